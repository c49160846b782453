pub mod business_hours;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod flow_engine;
pub mod ingestion;
pub mod matcher;
pub mod models;
pub mod processors;
pub mod scripting;
pub mod session;
pub mod streams;
pub mod template;
pub mod tickets;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::business_hours::{PgQueueSettings, QueueSettingsCache};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::delivery::DeliveryService;
use crate::delivery::queue::RedisJobQueue;
use crate::delivery::records::PgDeliveryRecords;
use crate::delivery::senders::{self, ChannelSender, TelegramSender, WebchatSender, WhatsappSender};
use crate::delivery::worker::{DeliveryWorker, RetryPolicy};
use crate::flow_engine::{EngineSettings, FlowEngine};
use crate::ingestion::{Ingestor, PgFlowSource, RedisDeduplicator};
use crate::processors::Processors;
use crate::scripting::ScriptSandbox;
use crate::session::PgSessionStore;
use crate::tickets::PgTicketStore;

/// Timeout for outbound provider calls.
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

pub struct AppState {
    pub pool: PgPool,
    pub redis: MultiplexedConnection,
    pub config: Config,
}

impl AppState {
    /// Connects to Postgres (running pending migrations) and Redis.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        info!("Connected to Postgres.");

        let redis_client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
        let redis = redis_client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis.");

        Ok(Self { pool, redis, config })
    }

    /// Interpreter wired to the Postgres stores and the outgoing stream.
    pub fn flow_engine(&self) -> Result<Arc<FlowEngine>> {
        let config = &self.config;
        let outbound = DeliveryService::new(
            Arc::new(PgDeliveryRecords::new(self.pool.clone())),
            Arc::new(RedisJobQueue::new(self.redis.clone(), config.outgoing_stream.clone())),
        );
        let sandbox = ScriptSandbox::new(config.script_limits).context("Failed to start script sandbox")?;
        let processors = Processors::new(
            Arc::new(outbound),
            senders::http_client(config.api_call_timeout),
            Arc::new(sandbox),
            config.api_call_timeout,
        );
        let queue_settings = QueueSettingsCache::new(
            Arc::new(PgQueueSettings::new(self.pool.clone())),
            config.business_hours_ttl,
        );

        Ok(FlowEngine::new(
            Arc::new(PgSessionStore::new(self.pool.clone())),
            Arc::new(PgTicketStore::new(self.pool.clone())),
            Arc::new(queue_settings),
            processors,
            Arc::new(SystemClock),
            EngineSettings {
                farewell_block: config.farewell_block.clone(),
                human_return_block: config.human_return_block.clone(),
                max_steps: config.max_steps_per_turn,
            },
        ))
    }

    pub fn ingestor(&self) -> Result<Ingestor> {
        Ok(Ingestor::new(
            self.flow_engine()?,
            Arc::new(PgFlowSource::new(self.pool.clone())),
            Arc::new(RedisDeduplicator::new(self.redis.clone(), self.config.dedup_ttl)),
        ))
    }

    /// Delivery worker with a sender for every channel that has credentials.
    pub fn delivery_worker(&self) -> DeliveryWorker {
        let config = &self.config;
        let client = senders::http_client(SEND_TIMEOUT);
        let mut channel_senders: Vec<Arc<dyn ChannelSender>> = Vec::new();

        if let Some(wa) = &config.whatsapp {
            channel_senders.push(Arc::new(WhatsappSender::new(client.clone(), &wa.api_url, &wa.token, &wa.phone_id)));
        }
        if let Some(tg) = &config.telegram {
            channel_senders.push(Arc::new(TelegramSender::new(client.clone(), &tg.api_url, &tg.bot_token)));
        }
        if let Some(url) = &config.webchat_webhook_url {
            channel_senders.push(Arc::new(WebchatSender::new(client.clone(), url)));
        }

        DeliveryWorker::new(
            channel_senders,
            Arc::new(PgDeliveryRecords::new(self.pool.clone())),
            Arc::new(RedisJobQueue::new(self.redis.clone(), config.outgoing_stream.clone())),
            config.delivery_channel_concurrency,
            RetryPolicy {
                max_attempts: config.delivery_max_attempts,
                base_delay: config.delivery_retry_base,
            },
        )
    }
}
