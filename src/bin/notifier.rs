//! Notification Manager binary: runs the `notify.events` consumer loop,
//! fanning each event out to the log sink and, if configured, a webhook.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradecoord::agents::notifier::{self, LogSink, NotifySink, RecentRing, WebhookSink};
use tradecoord::broker::{BrokerOps, RedisBroker};
use tradecoord::config::Config;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notifier=info".into()),
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

    let mut sinks: Vec<Arc<dyn NotifySink>> = vec![Arc::new(LogSink)];
    if let Some(url) = config.notify_webhook_url.clone() {
        info!(url = %url, "webhook sink enabled");
        sinks.push(Arc::new(WebhookSink {
            client: reqwest::Client::new(),
            url,
        }));
    }

    let ring = Arc::new(RecentRing::default());
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
    notifier::run(broker, ring, sinks, idemp_ttl, config.stream_max_failures, cancel).await?;
    ctrl_c.abort();
    Ok(())
}
