use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::db::{Agent, AgentStatus, Ticket, TicketStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    Manual,
    #[default]
    Auto,
}

impl DistributionMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "manual" => DistributionMode::Manual,
            _ => DistributionMode::Auto,
        }
    }
}

/// Online agent serving the queue, with its count of open assigned tickets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLoad {
    pub agent_id: String,
    pub open_tickets: i64,
}

/// Online agents whose queue set contains `fila`, in candidate order.
pub fn eligible_agents<'a>(agents: &'a [Agent], fila: &str) -> Vec<&'a Agent> {
    agents
        .iter()
        .filter(|a| a.status == AgentStatus::Online)
        .filter(|a| a.queues.iter().any(|q| q.eq_ignore_ascii_case(fila)))
        .collect()
}

/// Least-loaded agent; ties keep the earlier candidate.
pub fn least_loaded(candidates: &[AgentLoad]) -> Option<&AgentLoad> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(idx, c)| (c.open_tickets, *idx))
        .map(|(_, c)| c)
}

/// `PRT-YYYYMMDD-HHMM-<ticket digits or 0000>` in the given timezone.
pub fn protocol(now: DateTime<Utc>, tz: Tz, ticket_number: Option<i64>) -> String {
    let local = now.with_timezone(&tz);
    let digits = ticket_number
        .map(|n| n.to_string().chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "0000".to_string());
    format!("PRT-{}-{}", local.format("%Y%m%d-%H%M"), digits)
}

/// Ticket persistence with atomic distribution. Implementations must run the
/// check-open, load count and assignment as one transaction.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Returns the user's open ticket, creating and assigning one if needed.
    async fn distribute(&self, user_id: &str, fila: &str, mode: DistributionMode) -> Result<Ticket>;

    async fn find_open(&self, user_id: &str) -> Result<Option<Ticket>>;
}

pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn distribute(&self, user_id: &str, fila: &str, mode: DistributionMode) -> Result<Ticket> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Serialize distribution per user and per queue for this transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("ticket:user:{user_id}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("ticket:queue:{}", fila.to_lowercase()))
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, Ticket>(
            r#"SELECT id, user_id, fila, status, assigned_to, ticket_number, created_at
               FROM tickets WHERE user_id = $1 AND status = 'open' LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to query open ticket")?;

        if let Some(ticket) = existing {
            tx.commit().await?;
            return Ok(ticket);
        }

        let assignee = match mode {
            DistributionMode::Manual => None,
            DistributionMode::Auto => {
                let agents = sqlx::query_as::<_, Agent>(
                    r#"SELECT id, status, queues FROM agents WHERE status = 'online' ORDER BY id"#,
                )
                .fetch_all(&mut *tx)
                .await
                .context("Failed to fetch agents")?;

                let eligible = eligible_agents(&agents, fila);
                if eligible.is_empty() {
                    warn!(fila = fila, user_id = user_id, "No online agent for queue, ticket left unassigned");
                    None
                } else {
                    let ids: Vec<String> = eligible.iter().map(|a| a.id.clone()).collect();
                    let counts: Vec<(String, i64)> = sqlx::query_as(
                        r#"SELECT assigned_to, COUNT(*) FROM tickets
                           WHERE status = 'open' AND assigned_to = ANY($1)
                           GROUP BY assigned_to"#,
                    )
                    .bind(&ids)
                    .fetch_all(&mut *tx)
                    .await
                    .context("Failed to count agent load")?;
                    let counts: HashMap<String, i64> = counts.into_iter().collect();

                    let loads: Vec<AgentLoad> = ids
                        .into_iter()
                        .map(|id| AgentLoad {
                            open_tickets: counts.get(&id).copied().unwrap_or(0),
                            agent_id: id,
                        })
                        .collect();
                    least_loaded(&loads).map(|l| l.agent_id.clone())
                }
            }
        };

        let ticket = sqlx::query_as::<_, Ticket>(
            r#"
            INSERT INTO tickets (id, user_id, fila, status, assigned_to, created_at)
            VALUES ($1, $2, $3, 'open', $4, NOW())
            RETURNING id, user_id, fila, status, assigned_to, ticket_number, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(fila)
        .bind(&assignee)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to create ticket")?;

        tx.commit().await.context("Failed to commit ticket distribution")?;

        info!(
            user_id = user_id,
            fila = fila,
            ticket_number = ticket.ticket_number,
            assigned_to = ticket.assigned_to.as_deref().unwrap_or("-"),
            "Ticket created"
        );
        Ok(ticket)
    }

    async fn find_open(&self, user_id: &str) -> Result<Option<Ticket>> {
        sqlx::query_as::<_, Ticket>(
            r#"SELECT id, user_id, fila, status, assigned_to, ticket_number, created_at
               FROM tickets WHERE user_id = $1 AND status = 'open' LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query open ticket")
    }
}

#[derive(Default)]
struct MemoryTickets {
    agents: Vec<Agent>,
    tickets: Vec<Ticket>,
    next_number: i64,
}

/// In-process ticket store; the single mutex makes distribution atomic.
#[derive(Default)]
pub struct MemoryTicketStore {
    inner: Mutex<MemoryTickets>,
}

impl MemoryTicketStore {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self {
            inner: Mutex::new(MemoryTickets {
                agents,
                tickets: Vec::new(),
                next_number: 1,
            }),
        }
    }

    pub async fn insert(&self, ticket: Ticket) {
        self.inner.lock().await.tickets.push(ticket);
    }

    pub async fn close(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        for t in inner.tickets.iter_mut().filter(|t| t.user_id == user_id) {
            t.status = TicketStatus::Closed;
        }
    }

    pub async fn tickets(&self) -> Vec<Ticket> {
        self.inner.lock().await.tickets.clone()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn distribute(&self, user_id: &str, fila: &str, mode: DistributionMode) -> Result<Ticket> {
        let mut inner = self.inner.lock().await;

        if let Some(open) = inner
            .tickets
            .iter()
            .find(|t| t.user_id == user_id && t.status == TicketStatus::Open)
        {
            return Ok(open.clone());
        }

        let assignee = match mode {
            DistributionMode::Manual => None,
            DistributionMode::Auto => {
                let loads: Vec<AgentLoad> = eligible_agents(&inner.agents, fila)
                    .into_iter()
                    .map(|a| AgentLoad {
                        agent_id: a.id.clone(),
                        open_tickets: inner
                            .tickets
                            .iter()
                            .filter(|t| t.status == TicketStatus::Open)
                            .filter(|t| t.assigned_to.as_deref() == Some(a.id.as_str()))
                            .count() as i64,
                    })
                    .collect();
                if loads.is_empty() {
                    warn!(fila = fila, user_id = user_id, "No online agent for queue, ticket left unassigned");
                }
                least_loaded(&loads).map(|l| l.agent_id.clone())
            }
        };

        let number = inner.next_number.max(1);
        inner.next_number = number + 1;
        let ticket = Ticket {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            fila: fila.to_string(),
            status: TicketStatus::Open,
            assigned_to: assignee,
            ticket_number: Some(number),
            created_at: Utc::now(),
        };
        inner.tickets.push(ticket.clone());
        Ok(ticket)
    }

    async fn find_open(&self, user_id: &str) -> Result<Option<Ticket>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tickets
            .iter()
            .find(|t| t.user_id == user_id && t.status == TicketStatus::Open)
            .cloned())
    }
}
