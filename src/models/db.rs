use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::vars::SessionVars;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionRow {
    pub user_id: String,
    pub current_block: Option<String>,
    pub last_flow_id: Option<String>,
    pub vars: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Execution state of one identity, as seen by the interpreter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub current_block: Option<String>,
    pub last_flow_id: Option<String>,
    pub vars: SessionVars,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            user_id: row.user_id,
            current_block: row.current_block,
            last_flow_id: row.last_flow_id,
            vars: SessionVars::from_value(row.vars),
            updated_at: Some(row.updated_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Pending,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::Closed => "closed",
        }
    }
}

impl TryFrom<String> for TicketStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "open" => Ok(TicketStatus::Open),
            "pending" => Ok(TicketStatus::Pending),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(format!("unknown ticket status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: Uuid,
    pub user_id: String,
    pub fila: String,
    #[sqlx(try_from = "String")]
    pub status: TicketStatus,
    pub assigned_to: Option<String>,
    pub ticket_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl TryFrom<String> for AgentStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub status: AgentStatus,
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Error => "error",
        }
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        match value.as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "error" => Ok(DeliveryStatus::Error),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// Persisted outcome of one outbound message.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub temp_id: Uuid,
    pub channel: String,
    pub recipient: String,
    pub user_id: String,
    pub kind: String,
    pub content: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
