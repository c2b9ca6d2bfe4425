//! Risk Manager binary: runs the `risk.requests` consumer loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradecoord::agents::risk;
use tradecoord::broker::{BrokerOps, RedisBroker};
use tradecoord::config::Config;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "risk_manager=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tradecoord::metrics::init();
    let config = Config::from_env().context("loading configuration")?;

    let broker: Arc<dyn BrokerOps> = Arc::new(
        RedisBroker::connect(&config.broker_url)
            .await
            .context("connecting to broker")?,
    );
    broker.ping().await.context("broker ping failed at startup")?;

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    let idemp_ttl = Duration::from_secs(config.stream_idemp_ttl_seconds);
    risk::run(broker, idemp_ttl, config.stream_max_failures, cancel).await?;
    ctrl_c.abort();
    Ok(())
}
