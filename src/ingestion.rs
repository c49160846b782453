//! Inbound event consumption: dedup, flow lookup and dispatch into the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::flow_engine::FlowEngine;
use crate::models::flow::Flow;
use crate::models::payloads::{Channel, Identity, InboundMessage, IncomingEvent, TicketStatusEvent};
use crate::streams::{self, StreamConsumer};

/// `dedup:{channel}:{provider_message_id}:{user}`
pub fn dedup_key(channel: Channel, provider_message_id: &str, user: &str) -> String {
    format!("dedup:{channel}:{provider_message_id}:{user}")
}

/// Remembers which inbound events were already processed.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Marks `key` as seen. Returns false if it was already marked.
    async fn first_seen(&self, key: &str) -> Result<bool>;
}

pub struct RedisDeduplicator {
    redis: MultiplexedConnection,
    ttl: Duration,
}

impl RedisDeduplicator {
    pub fn new(redis: MultiplexedConnection, ttl: Duration) -> Self {
        Self { redis, ttl }
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn first_seen(&self, key: &str) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut self.redis.clone())
            .await
            .context("Failed to SET dedup key")?;
        Ok(reply.is_some())
    }
}

/// Keys never expire.
#[derive(Default)]
pub struct MemoryDeduplicator {
    seen: DashMap<String, ()>,
}

impl MemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Deduplicator for MemoryDeduplicator {
    async fn first_seen(&self, key: &str) -> Result<bool> {
        Ok(self.seen.insert(key.to_string(), ()).is_none())
    }
}

/// Published flow documents.
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// The active flow for `tenant_id`, falling back to the tenant-less flow.
    async fn active_flow(&self, tenant_id: Option<&str>) -> Result<Option<Flow>>;
}

pub struct PgFlowSource {
    pool: PgPool,
}

impl PgFlowSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowSource for PgFlowSource {
    async fn active_flow(&self, tenant_id: Option<&str>) -> Result<Option<Flow>> {
        let row = sqlx::query_as::<_, (String, Value)>(
            r#"
            SELECT id, definition FROM flows
            WHERE active AND (tenant_id = $1 OR tenant_id IS NULL)
            ORDER BY (tenant_id IS NULL), updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load active flow")?;

        let Some((id, definition)) = row else {
            return Ok(None);
        };
        let mut flow: Flow =
            serde_json::from_value(definition).with_context(|| format!("Flow {id} is not a valid document"))?;
        if flow.id.is_empty() {
            flow.id = id;
        }
        Ok(Some(flow))
    }
}

/// Flows held in memory, keyed by tenant. `None` is the tenant-less flow.
#[derive(Default)]
pub struct StaticFlowSource {
    flows: HashMap<Option<String>, Flow>,
}

impl StaticFlowSource {
    pub fn new(flow: Flow) -> Self {
        Self::default().with_tenant(None, flow)
    }

    pub fn with_tenant(mut self, tenant_id: Option<&str>, flow: Flow) -> Self {
        self.flows.insert(tenant_id.map(str::to_string), flow);
        self
    }
}

#[async_trait]
impl FlowSource for StaticFlowSource {
    async fn active_flow(&self, tenant_id: Option<&str>) -> Result<Option<Flow>> {
        let tenant = tenant_id.map(str::to_string);
        Ok(self.flows.get(&tenant).or_else(|| self.flows.get(&None)).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The engine ran; carries the last content it sent.
    Processed(Option<Value>),
    Duplicate,
    NoFlow,
    Malformed,
}

pub struct Ingestor {
    engine: Arc<FlowEngine>,
    flows: Arc<dyn FlowSource>,
    dedup: Arc<dyn Deduplicator>,
}

impl Ingestor {
    pub fn new(engine: Arc<FlowEngine>, flows: Arc<dyn FlowSource>, dedup: Arc<dyn Deduplicator>) -> Self {
        Self { engine, flows, dedup }
    }

    /// Parses one stream payload and handles it. Never fails; every problem is
    /// logged so the entry can be acknowledged.
    pub async fn handle_payload(&self, payload: &str) -> IngestOutcome {
        match serde_json::from_str::<IncomingEvent>(payload) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                error!(payload, error = %e, "Failed to parse incoming event");
                IngestOutcome::Malformed
            }
        }
    }

    pub async fn handle(&self, event: IncomingEvent) -> IngestOutcome {
        match event {
            IncomingEvent::Message {
                channel,
                from,
                payload,
                message,
                external_id,
                tenant_id,
            } => {
                let identity = Identity::new(channel, from.trim());
                if identity.address.is_empty() {
                    warn!(channel = %channel, "Inbound message without sender, dropping");
                    return IngestOutcome::Malformed;
                }
                if let Some(external_id) = external_id.as_deref().filter(|id| !id.trim().is_empty()) {
                    if self.is_duplicate(channel, external_id, &identity.address).await {
                        return IngestOutcome::Duplicate;
                    }
                }

                let message = if message.is_empty() {
                    project_payload(channel, &payload).unwrap_or(message)
                } else {
                    message
                };
                let Some(flow) = self.load_flow(tenant_id.as_deref()).await else {
                    return IngestOutcome::NoFlow;
                };
                info!(
                    user_id = identity.key(),
                    flow_id = flow.id,
                    kind = message.kind.as_deref().unwrap_or("text"),
                    "Received inbound message"
                );
                let base_vars = base_vars(&identity, tenant_id.as_deref());
                IngestOutcome::Processed(self.engine.run_turn(&message, &flow, &base_vars, &identity).await)
            }
            IncomingEvent::TicketStatus(event) => self.ticket_status(event).await,
        }
    }

    async fn ticket_status(&self, event: TicketStatusEvent) -> IngestOutcome {
        let Some(identity) = Identity::parse(&event.user_id) else {
            warn!(user_id = event.user_id, "Ticket status for an unrecognized user id");
            return IngestOutcome::Malformed;
        };
        info!(user_id = event.user_id, status = event.status, fila = ?event.fila, "Received ticket status");
        let Some(flow) = self.load_flow(event.tenant_id.as_deref()).await else {
            return IngestOutcome::NoFlow;
        };
        IngestOutcome::Processed(self.engine.on_ticket_status(&event, &flow, &identity).await)
    }

    /// A dedup store failure lets the event through.
    async fn is_duplicate(&self, channel: Channel, external_id: &str, user: &str) -> bool {
        let key = dedup_key(channel, external_id, user);
        match self.dedup.first_seen(&key).await {
            Ok(true) => false,
            Ok(false) => {
                info!(key, "Duplicate inbound event, skipping");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Dedup check failed, processing anyway");
                false
            }
        }
    }

    async fn load_flow(&self, tenant_id: Option<&str>) -> Option<Flow> {
        match self.flows.active_flow(tenant_id).await {
            Ok(Some(flow)) => Some(flow),
            Ok(None) => {
                warn!(tenant_id, "No active flow, dropping event");
                None
            }
            Err(e) => {
                error!(tenant_id, error = %e, "Failed to load flow");
                None
            }
        }
    }
}

fn base_vars(identity: &Identity, tenant_id: Option<&str>) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("userId".into(), Value::String(identity.address.clone()));
    if let Some(tenant) = tenant_id {
        vars.insert("tenantId".into(), Value::String(tenant.to_string()));
    }
    vars
}

/// Best-effort projection of a channel-native webhook body, used when the
/// producer did not normalize the message itself.
pub fn project_payload(channel: Channel, payload: &Value) -> Option<InboundMessage> {
    let str_at = |v: &Value, path: &[&str]| -> Option<String> {
        path.iter()
            .try_fold(v, |cur, key| cur.get(*key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let message = match channel {
        Channel::Whatsapp => {
            let kind = str_at(payload, &["type"]);
            let tag = kind.clone().unwrap_or_default();
            match tag.as_str() {
                "interactive" => {
                    let reply = payload
                        .get("interactive")
                        .and_then(|i| i.get("button_reply").or_else(|| i.get("list_reply")))?;
                    InboundMessage {
                        kind,
                        text: None,
                        id: str_at(reply, &["id"]),
                        title: str_at(reply, &["title"]),
                    }
                }
                "button" => InboundMessage {
                    kind,
                    text: str_at(payload, &["button", "text"]),
                    id: str_at(payload, &["button", "payload"]),
                    title: None,
                },
                _ => InboundMessage {
                    text: str_at(payload, &["text", "body"]),
                    kind,
                    ..Default::default()
                },
            }
        }
        Channel::Telegram => {
            if let Some(callback) = payload.get("callback_query") {
                InboundMessage {
                    kind: Some("interactive".into()),
                    text: None,
                    id: str_at(callback, &["data"]),
                    title: None,
                }
            } else {
                let text = str_at(payload, &["message", "text"]).or_else(|| str_at(payload, &["message", "caption"]));
                InboundMessage {
                    kind: Some("text".into()),
                    text,
                    ..Default::default()
                }
            }
        }
        Channel::Webchat => serde_json::from_value(payload.clone()).ok()?,
    };
    debug!(channel = %channel, empty = message.is_empty(), "Projected channel payload");
    (!message.is_empty()).then_some(message)
}

/// Consumes the inbound stream until the process exits.
pub async fn run(ingestor: Arc<Ingestor>, consumer: StreamConsumer, prefetch: usize) -> Result<()> {
    info!(prefetch, "Ingestion worker started");
    streams::run(consumer, prefetch, move |payload: String| {
        let ingestor = ingestor.clone();
        async move {
            ingestor.handle_payload(&payload).await;
        }
    })
    .await
}
