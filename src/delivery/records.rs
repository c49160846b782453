use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::db::{DeliveryRecord, DeliveryStatus};

/// Delivery record lifecycle: `pending -> sent | error`. A transient failure
/// records `error` and a later retry may still flip it to `sent`.
#[async_trait]
pub trait DeliveryRecordStore: Send + Sync {
    async fn insert_pending(&self, record: &DeliveryRecord) -> Result<()>;

    async fn mark_sent(&self, temp_id: Uuid, provider_message_id: &str, attempts: i32) -> Result<()>;

    async fn mark_error(&self, temp_id: Uuid, reason: &str, attempts: i32) -> Result<()>;

    async fn get(&self, temp_id: Uuid) -> Result<Option<DeliveryRecord>>;
}

pub struct PgDeliveryRecords {
    pool: PgPool,
}

impl PgDeliveryRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_status(
        &self,
        temp_id: Uuid,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        attempts: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = $2,
                provider_message_id = COALESCE($3, provider_message_id),
                error = $4,
                attempts = $5,
                updated_at = NOW()
            WHERE temp_id = $1
            "#,
        )
        .bind(temp_id)
        .bind(status.as_str())
        .bind(provider_message_id)
        .bind(error)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .context("Failed to update delivery record")?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryRecordStore for PgDeliveryRecords {
    async fn insert_pending(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records
                (temp_id, channel, recipient, user_id, kind, content, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, NOW(), NOW())
            "#,
        )
        .bind(record.temp_id)
        .bind(&record.channel)
        .bind(&record.recipient)
        .bind(&record.user_id)
        .bind(&record.kind)
        .bind(&record.content)
        .execute(&self.pool)
        .await
        .context("Failed to insert delivery record")?;
        Ok(())
    }

    async fn mark_sent(&self, temp_id: Uuid, provider_message_id: &str, attempts: i32) -> Result<()> {
        self.set_status(temp_id, DeliveryStatus::Sent, Some(provider_message_id), None, attempts)
            .await
    }

    async fn mark_error(&self, temp_id: Uuid, reason: &str, attempts: i32) -> Result<()> {
        self.set_status(temp_id, DeliveryStatus::Error, None, Some(reason), attempts)
            .await
    }

    async fn get(&self, temp_id: Uuid) -> Result<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(r#"SELECT * FROM delivery_records WHERE temp_id = $1"#)
            .bind(temp_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch delivery record")
    }
}

#[derive(Default)]
pub struct MemoryDeliveryRecords {
    records: Mutex<HashMap<Uuid, DeliveryRecord>>,
}

impl MemoryDeliveryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<DeliveryRecord> {
        let mut all: Vec<DeliveryRecord> = self.records.lock().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    async fn update(&self, temp_id: Uuid, apply: impl FnOnce(&mut DeliveryRecord) + Send) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&temp_id)
            .with_context(|| format!("Delivery record {temp_id} not found"))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DeliveryRecordStore for MemoryDeliveryRecords {
    async fn insert_pending(&self, record: &DeliveryRecord) -> Result<()> {
        self.records.lock().await.insert(record.temp_id, record.clone());
        Ok(())
    }

    async fn mark_sent(&self, temp_id: Uuid, provider_message_id: &str, attempts: i32) -> Result<()> {
        let provider_message_id = provider_message_id.to_string();
        self.update(temp_id, move |r| {
            r.status = DeliveryStatus::Sent;
            r.provider_message_id = Some(provider_message_id);
            r.error = None;
            r.attempts = attempts;
        })
        .await
    }

    async fn mark_error(&self, temp_id: Uuid, reason: &str, attempts: i32) -> Result<()> {
        let reason = reason.to_string();
        self.update(temp_id, move |r| {
            r.status = DeliveryStatus::Error;
            r.error = Some(reason);
            r.attempts = attempts;
        })
        .await
    }

    async fn get(&self, temp_id: Uuid) -> Result<Option<DeliveryRecord>> {
        Ok(self.records.lock().await.get(&temp_id).cloned())
    }
}
