use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::db::{Session, SessionRow};
use crate::models::vars::SessionVars;

/// Persistence of per-identity execution state. `save` is an idempotent
/// upsert; the last write wins.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the stored session, or an empty one for an unseen identity.
    async fn load(&self, user_id: &str) -> Result<Session>;

    async fn save(
        &self,
        user_id: &str,
        current_block: Option<&str>,
        flow_id: Option<&str>,
        vars: &SessionVars,
    ) -> Result<()>;
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, user_id: &str) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"SELECT user_id, current_block, last_flow_id, vars, updated_at FROM sessions WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load session")?;

        Ok(match row {
            Some(row) => row.into(),
            None => Session {
                user_id: user_id.to_string(),
                ..Default::default()
            },
        })
    }

    async fn save(
        &self,
        user_id: &str,
        current_block: Option<&str>,
        flow_id: Option<&str>,
        vars: &SessionVars,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, current_block, last_flow_id, vars, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                current_block = EXCLUDED.current_block,
                last_flow_id = COALESCE(EXCLUDED.last_flow_id, sessions.last_flow_id),
                vars = EXCLUDED.vars,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(current_block)
        .bind(flow_id)
        .bind(vars.to_value())
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;
        Ok(())
    }
}

/// Process-local store, used by tests and single-node tooling.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, user_id: &str) -> Result<Session> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(user_id).cloned().unwrap_or_else(|| Session {
            user_id: user_id.to_string(),
            ..Default::default()
        }))
    }

    async fn save(
        &self,
        user_id: &str,
        current_block: Option<&str>,
        flow_id: Option<&str>,
        vars: &SessionVars,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let previous_flow = sessions.get(user_id).and_then(|s| s.last_flow_id.clone());
        sessions.insert(
            user_id.to_string(),
            Session {
                user_id: user_id.to_string(),
                current_block: current_block.map(str::to_string),
                last_flow_id: flow_id.map(str::to_string).or(previous_flow),
                vars: vars.clone(),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }
}

/// One async mutex per identity, held across load-process-save so two events
/// for the same user never interleave.
#[derive(Default, Clone)]
pub struct SessionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str) -> IdentityGuard {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        IdentityGuard {
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct IdentityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    user_id: String,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Forget the entry once nobody else holds or waits on it.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
