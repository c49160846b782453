use std::sync::Arc;

use anyhow::Result;
use support_core::config::Config;
use support_core::delivery::worker;
use support_core::streams::StreamConsumer;
use support_core::{AppState, ingestion};
use tracing::{error, info};

const INGEST_GROUP: &str = "support_core_group";
const DELIVERY_GROUP: &str = "support_delivery_group";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if it exists
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting support core engine...");

    let config = Config::from_env()?;
    let state = AppState::connect(config).await?;
    let config = &state.config;

    let ingestor = Arc::new(state.ingestor()?);
    let delivery = Arc::new(state.delivery_worker());

    let incoming = StreamConsumer::new(state.redis.clone(), &config.incoming_stream, INGEST_GROUP, &config.consumer_name);
    let outgoing = StreamConsumer::new(state.redis.clone(), &config.outgoing_stream, DELIVERY_GROUP, &config.consumer_name);

    let mut ingest_task = tokio::spawn(ingestion::run(ingestor, incoming, config.ingest_prefetch));
    let mut delivery_task = tokio::spawn(worker::run(delivery, outgoing, config.delivery_prefetch));

    // Either loop returning means its stream is unusable; exit so the supervisor restarts us.
    let (name, result) = tokio::select! {
        r = &mut ingest_task => ("ingestion", r),
        r = &mut delivery_task => ("delivery", r),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            return Ok(());
        }
    };
    match result {
        Ok(Ok(())) => info!(worker = name, "Worker stopped"),
        Ok(Err(e)) => {
            error!(worker = name, error = %e, "Worker failed");
            return Err(e);
        }
        Err(e) => {
            error!(worker = name, error = %e, "Worker panicked");
            return Err(e.into());
        }
    }
    Ok(())
}
