//! `tradecoord`: the orchestrator binary. Owns PnL/halt state, the admin
//! HTTP surface, and the orchestrator's own three stream consumers
//! (`analysis.signals`, `risk.responses`, `exec.status`). The analyst, risk
//! manager, executor, and notifier each run as their own binary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradecoord::admin::{self, AppState};
use tradecoord::agents::notifier::RecentRing;
use tradecoord::broker::{BrokerOps, RedisBroker};
use tradecoord::config::Config;
use tradecoord::exchange;
use tradecoord::orchestrator::Orchestrator;
use tradecoord::pnl::PnlLedger;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradecoord=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tradecoord::metrics::init();

    let config = Config::from_env().context("loading configuration")?;
    info!(port = config.port, comm_mode = ?config.comm_mode, "starting tradecoord");

    let broker: Arc<dyn BrokerOps> = Arc::new(
        RedisBroker::connect(&config.broker_url)
            .await
            .context("connecting to broker")?,
    );
    broker.ping().await.context("broker ping failed at startup")?;

    let pnl = Arc::new(PnlLedger::new(broker.clone()));
    let adapter = Arc::from(exchange::build(
        config.exchange,
        config.exchange_default_price,
        config.exchange_default_fee,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        pnl,
        config.start_equity,
        config.daily_target_pct,
        config.default_order_qty,
        config.profit_per_trade,
        Duration::from_millis(config.http_pipeline_timeout_ms),
    ));

    let state = AppState {
        orchestrator: orchestrator.clone(),
        ring: Arc::new(RecentRing::default()),
        adapter,
        admin_token: Arc::new(config.admin_token.clone()),
        started_at: Instant::now(),
        ack_ttl_seconds: config.ack_ttl_seconds,
        comm_mode: config.comm_mode,
    };

    let cancel = CancellationToken::new();

    let consumers = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        let idemp_ttl = Duration::from_secs(config.stream_idemp_ttl_seconds);
        let max_failures = config.stream_max_failures;
        async move { orchestrator.run_consumers(idemp_ttl, max_failures, cancel).await }
    });

    let _pending_monitors = tradecoord::metrics::spawn_monitors(
        broker.clone(),
        Duration::from_millis(config.pending_monitor_interval_ms),
        cancel.clone(),
    );

    let router = admin::build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding admin surface to port {}", config.port))?;

    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = consumers => {
            match res {
                Ok(Ok(())) => info!("orchestrator consumers exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "orchestrator consumers failed"),
                Err(e) => tracing::error!(error = %e, "orchestrator consumer task panicked"),
            }
        }
    }

    cancel.cancel();
    let _ = server.await;
    Ok(())
}
