//! Order Executor binary: runs the `exec.orders` consumer loop and the
//! periodic stale-order reconciliation sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradecoord::agents::executor;
use tradecoord::broker::{BrokerOps, RedisBroker};
use tradecoord::config::Config;
use tradecoord::exchange::{self, ExchangeAdapter};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "executor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env().context("loading configuration")?;

    let broker: Arc<dyn BrokerOps> = Arc::new(
        RedisBroker::connect(&config.broker_url)
            .await
            .context("connecting to broker")?,
    );
    broker.ping().await.context("broker ping failed at startup")?;

    let adapter: Arc<dyn ExchangeAdapter> = Arc::from(exchange::build(
        config.exchange,
        config.exchange_default_price,
        config.exchange_default_fee,
    ));

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    let reconcile = tokio::spawn({
        let broker = broker.clone();
        let cancel = cancel.clone();
        let stale_after = chrono::Duration::seconds(config.exec_order_stale_after_seconds);
        let interval = Duration::from_millis(config.exec_reconcile_interval_ms);
        async move { executor::run_reconciliation(broker, stale_after, interval, cancel).await }
    });

    let idemp_ttl = Duration::from_secs(config.stream_idemp_ttl_seconds);
    executor::run(
        broker,
        adapter,
        config.profit_per_trade,
        idemp_ttl,
        config.stream_max_failures,
        cancel,
    )
    .await?;

    ctrl_c.abort();
    reconcile.abort();
    Ok(())
}
