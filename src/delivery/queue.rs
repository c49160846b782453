use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::payloads::OutgoingJob;

const STREAM_MAXLEN: usize = 10000;

/// Moves due members of the delayed set onto the stream in one step, so a
/// crash can never drop a job between the two.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, payload in ipairs(due) do
  redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', 'payload', payload)
  redis.call('ZREM', KEYS[1], payload)
end
return #due
";

/// Producer side of the delivery queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes the job available to workers now.
    async fn push(&self, job: &OutgoingJob) -> Result<()>;

    /// Stores the job durably until `due`, then [`JobQueue::promote_due`] releases it.
    async fn schedule(&self, job: &OutgoingJob, due: DateTime<Utc>) -> Result<()>;

    /// Pushes up to `limit` scheduled jobs whose time has come, earliest first.
    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize>;
}

/// Redis stream producer. Entries carry the JSON job in a `payload` field;
/// scheduled jobs wait in a sorted set scored by due time in milliseconds.
pub struct RedisJobQueue {
    redis: MultiplexedConnection,
    stream: String,
    delayed: String,
}

impl RedisJobQueue {
    pub fn new(redis: MultiplexedConnection, stream: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            redis,
            delayed: format!("{stream}:delayed"),
            stream,
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, job: &OutgoingJob) -> Result<()> {
        let json_str = serde_json::to_string(job).context("Failed to serialize outgoing job")?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(&json_str)
            .query_async(&mut self.redis.clone())
            .await
            .with_context(|| format!("Failed to XADD to {}", self.stream))?;

        info!(
            stream_id = id,
            temp_id = %job.temp_id,
            channel = %job.channel,
            attempt = job.attempt,
            "Enqueued outgoing job"
        );
        Ok(())
    }

    async fn schedule(&self, job: &OutgoingJob, due: DateTime<Utc>) -> Result<()> {
        let json_str = serde_json::to_string(job).context("Failed to serialize outgoing job")?;
        redis::cmd("ZADD")
            .arg(&self.delayed)
            .arg(due.timestamp_millis())
            .arg(&json_str)
            .query_async::<()>(&mut self.redis.clone())
            .await
            .with_context(|| format!("Failed to ZADD to {}", self.delayed))?;

        info!(
            temp_id = %job.temp_id,
            channel = %job.channel,
            attempt = job.attempt,
            due = %due,
            "Scheduled outgoing job"
        );
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let promoted: usize = redis::Script::new(PROMOTE_SCRIPT)
            .key(&self.delayed)
            .key(&self.stream)
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(STREAM_MAXLEN)
            .invoke_async(&mut self.redis.clone())
            .await
            .with_context(|| format!("Failed to promote jobs from {}", self.delayed))?;
        if promoted > 0 {
            debug!(promoted, stream = self.stream, "Released scheduled jobs");
        }
        Ok(promoted)
    }
}

#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<OutgoingJob>>,
    delayed: Mutex<Vec<(DateTime<Utc>, OutgoingJob)>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pop(&self) -> Option<OutgoingJob> {
        self.jobs.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Jobs scheduled for later, with their due times.
    pub async fn scheduled(&self) -> Vec<(DateTime<Utc>, OutgoingJob)> {
        self.delayed.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, job: &OutgoingJob) -> Result<()> {
        self.jobs.lock().await.push_back(job.clone());
        Ok(())
    }

    async fn schedule(&self, job: &OutgoingJob, due: DateTime<Utc>) -> Result<()> {
        let mut delayed = self.delayed.lock().await;
        delayed.push((due, job.clone()));
        delayed.sort_by_key(|(due, _)| *due);
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut delayed = self.delayed.lock().await;
        let count = delayed.iter().take(limit).take_while(|(due, _)| *due <= now).count();
        let mut jobs = self.jobs.lock().await;
        jobs.extend(delayed.drain(..count).map(|(_, job)| job));
        Ok(count)
    }
}
