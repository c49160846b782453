//! Redis stream consumer-group plumbing shared by ingestion and delivery.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

const BLOCK_MS: usize = 5000;

pub struct StreamEntry {
    pub id: String,
    pub payload: Option<String>,
}

#[derive(Clone)]
pub struct StreamConsumer {
    redis: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub fn new(redis: MultiplexedConnection, stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            redis,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Creates the consumer group, ignoring BUSYGROUP if it already exists.
    pub async fn ensure_group(&self) {
        let _ = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut self.redis.clone())
            .await;
    }

    /// `id` is `"0"` for this consumer's unacknowledged backlog, `">"` for new entries.
    pub async fn read(&self, id: &str, count: usize, block: bool) -> redis::RedisResult<Vec<StreamEntry>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        if block {
            opts = opts.block(BLOCK_MS);
        }
        let reply: StreamReadReply = self
            .redis
            .clone()
            .xread_options(&[&self.stream], &[id], &opts)
            .await?;

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| StreamEntry {
                payload: entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok()),
                id: entry.id,
            })
            .collect())
    }

    pub async fn ack(&self, id: &str) {
        let result: redis::RedisResult<()> = self.redis.clone().xack(&self.stream, &self.group, &[id]).await;
        if let Err(e) = result {
            warn!(stream = self.stream, id, error = %e, "Failed to XACK entry");
        }
    }
}

/// Drains the consumer's pending backlog, then consumes new entries forever
/// with at most `prefetch` handlers in flight. Every entry is acknowledged
/// once its handler returns, including entries without a payload.
pub async fn run<F, Fut>(consumer: StreamConsumer, prefetch: usize, handler: F) -> Result<()>
where
    F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    consumer.ensure_group().await;

    loop {
        let backlog = consumer
            .read("0", prefetch, false)
            .await
            .with_context(|| format!("Failed to read backlog of {}", consumer.stream()))?;
        if backlog.is_empty() {
            break;
        }
        info!(stream = consumer.stream(), entries = backlog.len(), "Replaying pending entries");
        for entry in backlog {
            if let Some(payload) = entry.payload {
                handler(payload).await;
            }
            consumer.ack(&entry.id).await;
        }
    }

    info!(stream = consumer.stream(), "Listening on Redis stream");
    let permits = Arc::new(Semaphore::new(prefetch.max(1)));

    loop {
        // Wait for capacity before reading so the stream is the backlog, not memory.
        let first = permits.clone().acquire_owned().await?;
        let count = permits.available_permits() + 1;

        let entries = match consumer.read(">", count, true).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(stream = consumer.stream(), error = %e, "Error reading from Redis Stream");
                drop(first);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut first = Some(first);
        for entry in entries {
            let permit = match first.take() {
                Some(p) => p,
                None => permits.clone().acquire_owned().await?,
            };
            let Some(payload) = entry.payload else {
                warn!(stream = consumer.stream(), id = entry.id, "Entry has no payload field");
                consumer.ack(&entry.id).await;
                continue;
            };
            let handler = handler.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move {
                handler(payload).await;
                consumer.ack(&entry.id).await;
                drop(permit);
            });
        }
    }
}
