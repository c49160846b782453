//! Postgres-backed store tests. Skipped when DATABASE_URL is not set.
//!
//! Run with: cargo test --test db_integration

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use support_core::business_hours::{PgQueueSettings, QueueSettingsSource};
use support_core::delivery::records::{DeliveryRecordStore, PgDeliveryRecords};
use support_core::ingestion::{FlowSource, PgFlowSource};
use support_core::models::db::{DeliveryRecord, DeliveryStatus, TicketStatus};
use support_core::models::vars::SessionVars;
use support_core::session::{PgSessionStore, SessionStore};
use support_core::tickets::{DistributionMode, PgTicketStore, TicketStore};

async fn get_pool() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let Ok(db_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    Some(pool)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn session_upsert_keeps_last_write() -> Result<()> {
    let Some(pool) = get_pool().await else { return Ok(()) };
    let store = PgSessionStore::new(pool);
    let user = format!("webchat:{}", unique("u"));

    let fresh = store.load(&user).await?;
    assert_eq!(fresh.current_block, None);

    let mut vars = SessionVars::from_value(json!({"name": "Ana", "ticketNumber": 7}));
    store.save(&user, Some("menu"), Some("main"), &vars).await?;
    vars.set("name", json!("Bia"));
    store.save(&user, Some("pricing"), None, &vars).await?;

    let session = store.load(&user).await?;
    assert_eq!(session.current_block.as_deref(), Some("pricing"));
    assert_eq!(session.last_flow_id.as_deref(), Some("main"));
    assert_eq!(session.vars.extra.get("name"), Some(&json!("Bia")));
    assert_eq!(session.vars.ticket_number.as_deref(), Some("7"));
    Ok(())
}

#[tokio::test]
async fn distribution_reuses_open_ticket_and_balances_load() -> Result<()> {
    let Some(pool) = get_pool().await else { return Ok(()) };
    let queue = unique("queue");
    let (busy, idle) = (unique("busy"), unique("idle"));
    for id in [&busy, &idle] {
        sqlx::query("INSERT INTO agents (id, status, queues) VALUES ($1, 'online', $2)")
            .bind(id)
            .bind(vec![queue.clone()])
            .execute(&pool)
            .await?;
    }
    sqlx::query("INSERT INTO tickets (id, user_id, fila, status, assigned_to) VALUES ($1, $2, $3, 'open', $4)")
        .bind(Uuid::new_v4())
        .bind(unique("someone"))
        .bind(&queue)
        .bind(&busy)
        .execute(&pool)
        .await?;

    let store = PgTicketStore::new(pool.clone());
    let user = format!("whatsapp:{}", unique("u"));
    let first = store.distribute(&user, &queue, DistributionMode::Auto).await?;
    let again = store.distribute(&user, &queue, DistributionMode::Auto).await?;

    assert_eq!(first.status, TicketStatus::Open);
    assert_eq!(first.assigned_to.as_deref(), Some(idle.as_str()));
    assert!(first.ticket_number.is_some());
    assert_eq!(again.id, first.id);
    assert_eq!(store.find_open(&user).await?.map(|t| t.id), Some(first.id));

    let manual = store
        .distribute(&format!("telegram:{}", unique("u")), &queue, DistributionMode::Manual)
        .await?;
    assert_eq!(manual.assigned_to, None);
    Ok(())
}

#[tokio::test]
async fn concurrent_distribution_opens_one_ticket() -> Result<()> {
    let Some(pool) = get_pool().await else { return Ok(()) };
    let store = std::sync::Arc::new(PgTicketStore::new(pool.clone()));
    let user = format!("webchat:{}", unique("u"));
    let queue = unique("queue");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let (user, queue) = (user.clone(), queue.clone());
            tokio::spawn(async move { store.distribute(&user, &queue, DistributionMode::Auto).await })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await??.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let open: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets WHERE user_id = $1 AND status = 'open'")
        .bind(&user)
        .fetch_one(&pool)
        .await?;
    assert_eq!(open, 1);
    Ok(())
}

#[tokio::test]
async fn delivery_record_lifecycle() -> Result<()> {
    let Some(pool) = get_pool().await else { return Ok(()) };
    let store = PgDeliveryRecords::new(pool);
    let now = Utc::now();
    let record = DeliveryRecord {
        temp_id: Uuid::new_v4(),
        channel: "telegram".into(),
        recipient: "4242".into(),
        user_id: "telegram:4242".into(),
        kind: "text".into(),
        content: json!({"text": "hi"}),
        status: DeliveryStatus::Pending,
        provider_message_id: None,
        error: None,
        attempts: 0,
        created_at: now,
        updated_at: now,
    };

    store.insert_pending(&record).await?;
    store.mark_error(record.temp_id, "telegram returned 502", 1).await?;
    let failed = store.get(record.temp_id).await?.expect("record exists");
    assert_eq!(failed.status, DeliveryStatus::Error);
    assert_eq!(failed.error.as_deref(), Some("telegram returned 502"));

    store.mark_sent(record.temp_id, "tg-99", 2).await?;
    let sent = store.get(record.temp_id).await?.expect("record exists");
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.provider_message_id.as_deref(), Some("tg-99"));
    assert_eq!(sent.error, None);
    assert_eq!(sent.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn tenant_flow_and_queue_settings() -> Result<()> {
    let Some(pool) = get_pool().await else { return Ok(()) };
    let tenant = unique("tenant");
    let flow = json!({"start": "a", "blocks": {"a": {"type": "text", "content": "hi"}}});
    let (active, inactive) = (unique("flow"), unique("flow"));
    sqlx::query("INSERT INTO flows (id, tenant_id, definition, active) VALUES ($1, $2, $3, true), ($4, $2, $3, false)")
        .bind(&active)
        .bind(&tenant)
        .bind(&flow)
        .bind(&inactive)
        .execute(&pool)
        .await?;

    let loaded = PgFlowSource::new(pool.clone())
        .active_flow(Some(&tenant))
        .await?
        .expect("tenant has an active flow");
    assert_eq!(loaded.id, active);
    assert_eq!(loaded.start, "a");

    let queue = unique("Queue");
    sqlx::query("INSERT INTO queue_settings (queue_name, business_hours) VALUES ($1, $2)")
        .bind(&queue)
        .bind(json!({"timezone": "America/Sao_Paulo", "holidays": ["12-25"]}))
        .execute(&pool)
        .await?;
    let settings = PgQueueSettings::new(pool);
    let hours = settings
        .business_hours(&queue.to_lowercase())
        .await?
        .expect("queue is configured");
    assert_eq!(hours.timezone.as_deref(), Some("America/Sao_Paulo"));
    assert_eq!(hours.holidays, vec!["12-25".to_string()]);
    assert!(settings.business_hours(&unique("missing")).await?.is_none());
    Ok(())
}
