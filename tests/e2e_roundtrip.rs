//! End-to-end turn: inbound event -> interpreter -> outgoing job -> webchat
//! bridge, with in-memory stores and a mock bridge.
//!
//! Run with: cargo test --test e2e_roundtrip

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support_core::business_hours::{QueueSettingsCache, StaticQueueSettings};
use support_core::clock::FixedClock;
use support_core::delivery::DeliveryService;
use support_core::delivery::queue::MemoryJobQueue;
use support_core::delivery::records::{DeliveryRecordStore, MemoryDeliveryRecords};
use support_core::delivery::senders::{ChannelSender, WebchatSender};
use support_core::delivery::worker::{DeliveryWorker, JobOutcome, RetryPolicy};
use support_core::flow_engine::{EngineSettings, FlowEngine, HUMAN_BLOCK};
use support_core::ingestion::{IngestOutcome, Ingestor, MemoryDeduplicator, StaticFlowSource};
use support_core::models::db::{Agent, AgentStatus, DeliveryStatus};
use support_core::models::flow::Flow;
use support_core::processors::Processors;
use support_core::scripting::{ScriptLimits, ScriptSandbox};
use support_core::session::{MemorySessionStore, SessionStore};
use support_core::tickets::MemoryTicketStore;

struct Stack {
    ingestor: Ingestor,
    sessions: Arc<MemorySessionStore>,
    tickets: Arc<MemoryTicketStore>,
    records: Arc<MemoryDeliveryRecords>,
    queue: Arc<MemoryJobQueue>,
    worker: DeliveryWorker,
}

fn support_flow() -> Flow {
    serde_json::from_value(json!({
        "id": "support",
        "start": "welcome",
        "onError": "oops",
        "blocks": {
            "welcome": {
                "type": "text",
                "content": "Welcome! Type 1 for billing or 2 to talk to us",
                "awaitResponse": true,
                "actions": [
                    {"conditions": [{"type": "equals", "variable": "lastUserMessage", "value": "1|billing"}], "next": "billing"},
                    {"conditions": [{"type": "contains", "variable": "lastUserMessage", "value": "2|human|atendente"}], "next": "agent"}
                ],
                "defaultNext": "oops"
            },
            "billing": {"type": "text", "content": "Your invoice is on its way, {{userId}}", "defaultNext": "welcome"},
            "agent": {"type": "human", "content": {"queueName": "Support"}},
            "on_human_return": {"type": "text", "content": "Thanks for talking to us! Protocol {{protocol}}"},
            "oops": {"type": "text", "content": "Sorry, I did not understand", "defaultNext": "welcome"}
        }
    }))
    .unwrap()
}

fn stack(bridge: &str) -> Stack {
    let sessions = Arc::new(MemorySessionStore::new());
    let tickets = Arc::new(MemoryTicketStore::new(vec![Agent {
        id: "ana".into(),
        status: AgentStatus::Online,
        queues: vec!["support".into()],
    }]));
    let records = Arc::new(MemoryDeliveryRecords::new());
    let queue = Arc::new(MemoryJobQueue::new());

    let outbound = Arc::new(DeliveryService::new(records.clone(), queue.clone()));
    let processors = Processors::new(
        outbound,
        reqwest::Client::new(),
        Arc::new(ScriptSandbox::new(ScriptLimits::default()).unwrap()),
        Duration::from_secs(5),
    );
    let engine = FlowEngine::new(
        sessions.clone(),
        tickets.clone(),
        Arc::new(QueueSettingsCache::new(
            Arc::new(StaticQueueSettings::default()),
            Duration::from_secs(60),
        )),
        processors,
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap())),
        EngineSettings::default(),
    );
    let ingestor = Ingestor::new(
        engine,
        Arc::new(StaticFlowSource::new(support_flow())),
        Arc::new(MemoryDeduplicator::new()),
    );

    let sender: Arc<dyn ChannelSender> = Arc::new(WebchatSender::new(reqwest::Client::new(), bridge));
    let worker = DeliveryWorker::new(
        vec![sender],
        records.clone(),
        queue.clone(),
        4,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        },
    );

    Stack {
        ingestor,
        sessions,
        tickets,
        records,
        queue,
        worker,
    }
}

fn inbound(text: &str, external_id: &str) -> String {
    json!({
        "type": "message",
        "channel": "webchat",
        "from": "visitor-7",
        "message": {"type": "text", "text": text},
        "external_id": external_id
    })
    .to_string()
}

/// Runs every queued job through the worker and returns the outcomes.
async fn drain(stack: &Stack) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    while let Some(job) = stack.queue.pop().await {
        outcomes.push(stack.worker.handle(job).await);
    }
    outcomes
}

#[tokio::test]
async fn billing_turn_is_delivered_to_the_bridge() -> Result<()> {
    let bridge = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bridge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "wc-1"})))
        .expect(3)
        .mount(&bridge)
        .await;
    let stack = stack(&format!("{}/bridge", bridge.uri()));

    stack.ingestor.handle_payload(&inbound("hello", "m-1")).await;
    let outcome = stack.ingestor.handle_payload(&inbound("Billing", "m-2")).await;
    assert_eq!(
        outcome,
        IngestOutcome::Processed(Some(json!("Welcome! Type 1 for billing or 2 to talk to us")))
    );

    let outcomes = drain(&stack).await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| *o == JobOutcome::Sent("wc-1".into())));

    let records = stack.records.all().await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == DeliveryStatus::Sent && r.attempts == 1));
    assert!(
        records
            .iter()
            .any(|r| r.content["content"]["text"] == json!("Your invoice is on its way, visitor-7"))
    );

    let session = stack.sessions.load("webchat:visitor-7").await?;
    assert_eq!(session.current_block.as_deref(), Some("welcome"));
    Ok(())
}

#[tokio::test]
async fn redelivered_event_is_not_answered_twice() -> Result<()> {
    let bridge = MockServer::start().await;
    let stack = stack(&format!("{}/bridge", bridge.uri()));

    stack.ingestor.handle_payload(&inbound("hello", "m-1")).await;
    stack.ingestor.handle_payload(&inbound("1", "m-2")).await;
    let queued = stack.queue.len().await;
    let replay = stack.ingestor.handle_payload(&inbound("1", "m-2")).await;

    assert_eq!(replay, IngestOutcome::Duplicate);
    assert_eq!(stack.queue.len().await, queued);
    Ok(())
}

#[tokio::test]
async fn handoff_and_return_after_ticket_close() -> Result<()> {
    let bridge = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"to": "visitor-7"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "wc"})))
        .mount(&bridge)
        .await;
    let stack = stack(&format!("{}/bridge", bridge.uri()));

    stack.ingestor.handle_payload(&inbound("hi", "m-1")).await;
    let handoff = stack.ingestor.handle_payload(&inbound("quero um atendente", "m-2")).await;
    assert_eq!(handoff, IngestOutcome::Processed(None));

    let session = stack.sessions.load("webchat:visitor-7").await?;
    assert_eq!(session.current_block.as_deref(), Some(HUMAN_BLOCK));
    assert_eq!(session.vars.fila.as_deref(), Some("Support"));
    assert_eq!(session.vars.protocol.as_deref(), Some("PRT-20240603-1430-1"));
    let tickets = stack.tickets.tickets().await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].assigned_to.as_deref(), Some("ana"));

    // The agent is talking now; the bot stays quiet.
    let quiet = stack.ingestor.handle_payload(&inbound("hello?", "m-3")).await;
    assert_eq!(quiet, IngestOutcome::Processed(None));

    stack.tickets.close("webchat:visitor-7").await;
    let closed = json!({"type": "ticket_status", "status": "closed", "userId": "webchat:visitor-7", "ticketNumber": 1});
    let resumed = stack.ingestor.handle_payload(&closed.to_string()).await;
    assert_eq!(
        resumed,
        IngestOutcome::Processed(Some(json!("Thanks for talking to us! Protocol PRT-20240603-1430-1")))
    );

    assert!(drain(&stack).await.iter().all(|o| matches!(o, JobOutcome::Sent(_))));
    Ok(())
}

#[tokio::test]
async fn bridge_outage_retries_until_exhausted() -> Result<()> {
    let bridge = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&bridge)
        .await;
    let stack = stack(&format!("{}/bridge", bridge.uri()));

    stack.ingestor.handle_payload(&inbound("hello", "m-1")).await;
    let outcomes = drain(&stack).await;

    assert!(matches!(outcomes.last(), Some(JobOutcome::Exhausted(_))));
    let record = &stack.records.all().await[0];
    let stored = stack.records.get(record.temp_id).await?.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Error);
    assert_eq!(stored.attempts, 3);
    Ok(())
}
