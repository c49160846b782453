use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::scripting::ScriptLimits;

#[derive(Debug, Clone)]
pub struct WhatsappConfig {
    pub api_url: String,
    pub token: String,
    pub phone_id: String,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
    pub bot_token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub db_max_connections: u32,

    pub incoming_stream: String,
    pub outgoing_stream: String,
    pub consumer_name: String,
    pub ingest_prefetch: usize,
    pub dedup_ttl: Duration,

    pub delivery_prefetch: usize,
    pub delivery_channel_concurrency: usize,
    pub delivery_max_attempts: u32,
    pub delivery_retry_base: Duration,

    pub business_hours_ttl: Duration,
    pub api_call_timeout: Duration,
    pub script_limits: ScriptLimits,

    pub farewell_block: String,
    pub human_return_block: String,
    pub max_steps_per_turn: usize,

    pub whatsapp: Option<WhatsappConfig>,
    pub telegram: Option<TelegramConfig>,
    pub webchat_webhook_url: Option<String>,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let whatsapp = match (optional("WHATSAPP_TOKEN"), optional("WHATSAPP_PHONE_ID")) {
            (Some(token), Some(phone_id)) => Some(WhatsappConfig {
                api_url: string_or("WHATSAPP_API_URL", "https://graph.facebook.com/v21.0"),
                token,
                phone_id,
            }),
            _ => None,
        };
        let telegram = optional("TELEGRAM_BOT_TOKEN").map(|bot_token| TelegramConfig {
            api_url: string_or("TELEGRAM_API_URL", "https://api.telegram.org"),
            bot_token,
        });

        let defaults = ScriptLimits::default();

        Ok(Self {
            database_url,
            redis_url: string_or("REDIS_URL", "redis://localhost:6379"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 20)?,

            incoming_stream: string_or("INCOMING_STREAM", "support:queue:incoming"),
            outgoing_stream: string_or("OUTGOING_STREAM", "support:queue:outgoing"),
            consumer_name: string_or("CONSUMER_NAME", "core_worker_1"),
            ingest_prefetch: parse_or("INGEST_PREFETCH", 10)?,
            dedup_ttl: Duration::from_secs(parse_or("DEDUP_TTL_SECS", 86_400)?),

            delivery_prefetch: parse_or("DELIVERY_PREFETCH", 20)?,
            delivery_channel_concurrency: parse_or("DELIVERY_CHANNEL_CONCURRENCY", 8)?,
            delivery_max_attempts: parse_or("DELIVERY_MAX_ATTEMPTS", 5)?,
            delivery_retry_base: Duration::from_millis(parse_or("DELIVERY_RETRY_BASE_MS", 2000)?),

            business_hours_ttl: Duration::from_secs(parse_or("BUSINESS_HOURS_TTL_SECS", 60)?),
            api_call_timeout: Duration::from_secs(parse_or("API_CALL_TIMEOUT_SECS", 15)?),
            script_limits: ScriptLimits {
                fuel: parse_or("SCRIPT_FUEL", defaults.fuel)?,
                timeout: Duration::from_secs(parse_or("SCRIPT_TIMEOUT_SECS", defaults.timeout.as_secs())?),
                memory_bytes: parse_or("SCRIPT_MEMORY_BYTES", defaults.memory_bytes)?,
            },

            farewell_block: string_or("FAREWELL_BLOCK", "farewell"),
            human_return_block: string_or("HUMAN_RETURN_BLOCK", "on_human_return"),
            max_steps_per_turn: parse_or("MAX_STEPS_PER_TURN", 64)?,

            whatsapp,
            telegram,
            webchat_webhook_url: optional("WEBCHAT_WEBHOOK_URL"),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn string_or(key: &str, default: &str) -> String {
    optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw.parse().with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_and_rejects_garbage() {
        assert_eq!(parse_or::<u32>("SUPPORT_CORE_TEST_UNSET_KEY", 7).unwrap(), 7);
        assert_eq!(string_or("SUPPORT_CORE_TEST_UNSET_KEY", "x"), "x");
        assert!("12a".parse::<u32>().is_err());
    }
}
