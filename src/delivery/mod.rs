//! Outbound pipeline: adapt a unified message to its channel, record it as
//! `pending`, enqueue it, and let the workers deliver it.

pub mod adapters;
pub mod queue;
pub mod records;
pub mod senders;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::FlowError;
use crate::models::db::{DeliveryRecord, DeliveryStatus};
use crate::models::flow::MessageKind;
use crate::models::payloads::{Channel, OutgoingJob};

use self::adapters::{AdaptError, adapter_for};
use self::queue::JobQueue;
use self::records::DeliveryRecordStore;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    pub user_id: String,
    pub kind: MessageKind,
    pub content: Value,
    pub context: Option<Value>,
    /// Hold the message back this long before workers may send it.
    pub delay: Duration,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("empty recipient for {0}")]
    EmptyRecipient(Channel),
    #[error(transparent)]
    Adapt(#[from] AdaptError),
    #[error("could not enqueue delivery {temp_id}: {reason}")]
    Enqueue { temp_id: Uuid, reason: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<DeliveryError> for FlowError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::EmptyRecipient(_) | DeliveryError::Adapt(_) => FlowError::DeliveryFatal(e.to_string()),
            DeliveryError::Enqueue { .. } => FlowError::DeliveryTransient(e.to_string()),
            DeliveryError::Store(inner) => FlowError::Infrastructure(inner),
        }
    }
}

/// What the interpreter sees of delivery. Returns once the message is
/// durably queued; the network call happens later in a worker.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryRecord, DeliveryError>;
}

pub struct DeliveryService {
    records: Arc<dyn DeliveryRecordStore>,
    queue: Arc<dyn JobQueue>,
}

impl DeliveryService {
    pub fn new(records: Arc<dyn DeliveryRecordStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { records, queue }
    }
}

#[async_trait]
impl Outbound for DeliveryService {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryRecord, DeliveryError> {
        let adapter = adapter_for(message.channel);
        let to = adapter.normalize_recipient(&message.to);
        if to.is_empty() {
            return Err(DeliveryError::EmptyRecipient(message.channel));
        }
        let wire = adapter.adapt(message.kind, &message.content)?;

        let now = Utc::now();
        let record = DeliveryRecord {
            temp_id: Uuid::new_v4(),
            channel: message.channel.as_str().to_string(),
            recipient: to.clone(),
            user_id: message.user_id.clone(),
            kind: message.kind.as_str().to_string(),
            content: wire.clone(),
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.records.insert_pending(&record).await?;

        let job = OutgoingJob {
            temp_id: record.temp_id,
            channel: message.channel,
            to,
            user_id: message.user_id,
            kind: message.kind,
            content: wire,
            context: message.context,
            attempt: 0,
        };
        let queued = if message.delay.is_zero() {
            self.queue.push(&job).await
        } else {
            let due = TimeDelta::from_std(message.delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now);
            self.queue.schedule(&job, due).await
        };
        if let Err(e) = queued {
            let reason = format!("{e:#}");
            error!(temp_id = %record.temp_id, error = %reason, "Failed to enqueue outgoing job");
            self.records.mark_error(record.temp_id, &reason, 0).await?;
            return Err(DeliveryError::Enqueue {
                temp_id: record.temp_id,
                reason,
            });
        }

        info!(
            temp_id = %record.temp_id,
            channel = %message.channel,
            kind = message.kind.as_str(),
            delay_ms = message.delay.as_millis() as u64,
            "Queued outbound message"
        );
        Ok(record)
    }
}
