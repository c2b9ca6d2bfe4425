//! Prometheus registry backing `/metrics`. See spec §6 ("Gauges and
//! counters: pending by stream/group, request durations, risk evaluations,
//! active parameters").

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerOps;
use crate::orchestrator::Orchestrator;
use crate::schemas::{groups, streams};
use crate::stream_runtime::monitor_pending;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref PENDING_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("tradecoord_stream_pending", "Pending entries for (stream, group)"),
        &["stream", "group"]
    )
    .expect("metric definition is valid");

    pub static ref RISK_EVAL_COUNTER: CounterVec = CounterVec::new(
        Opts::new("tradecoord_risk_evaluations_total", "Risk evaluations by outcome"),
        &["result"]
    )
    .expect("metric definition is valid");

    pub static ref ACTIVE_PARAM_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("tradecoord_active_param", "Current value of a risk parameter"),
        &["param"]
    )
    .expect("metric definition is valid");

    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("tradecoord_http_request_duration_seconds", "Admin HTTP request duration"),
        &["method", "path", "status"]
    )
    .expect("metric definition is valid");
}

/// Register every collector exactly once. Safe to call multiple times.
pub fn init() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        REGISTRY.register(Box::new(PENDING_GAUGE.clone())).ok();
        REGISTRY.register(Box::new(RISK_EVAL_COUNTER.clone())).ok();
        REGISTRY.register(Box::new(ACTIVE_PARAM_GAUGE.clone())).ok();
        REGISTRY.register(Box::new(REQUEST_DURATION.clone())).ok();
    });
}

pub fn record_risk_evaluation(ok: bool) {
    RISK_EVAL_COUNTER.with_label_values(&[if ok { "ok" } else { "rejected" }]).inc();
}

pub fn record_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    REQUEST_DURATION
        .with_label_values(&[method, path, &status.to_string()])
        .observe(duration_secs);
}

const TRACKED_SUBSCRIPTIONS: &[(&str, &str)] = &[
    (streams::ORCHESTRATOR_COMMANDS, groups::ANALYST),
    (streams::ANALYSIS_SIGNALS, groups::ORCHESTRATOR),
    (streams::RISK_REQUESTS, groups::RISK),
    (streams::RISK_RESPONSES, groups::ORCHESTRATOR),
    (streams::EXEC_ORDERS, groups::EXEC),
    (streams::EXEC_STATUS, groups::ORCHESTRATOR),
    (streams::NOTIFY_EVENTS, groups::NOTIFY),
];

/// Refresh the pending gauges from the live broker, then render the full
/// registry as Prometheus text exposition format.
pub async fn render(orchestrator: &Orchestrator) -> anyhow::Result<String> {
    for (stream, group) in TRACKED_SUBSCRIPTIONS {
        if let Ok(summary) = orchestrator.pending_summary(stream, group).await {
            PENDING_GAUGE.with_label_values(&[stream, group]).set(summary.count as f64);
        }
    }

    if let Ok(map) = orchestrator.broker().hash_get_all("optimizer:active_params").await {
        for param in ["minConfidence", "riskLimit", "tradingStartHour", "tradingEndHour"] {
            if let Some(v) = map.get(param).and_then(|v| v.parse::<f64>().ok()) {
                ACTIVE_PARAM_GAUGE.with_label_values(&[param]).set(v);
            }
        }
    }

    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Spawn one background pending-count monitor per tracked subscription, per
/// spec §5. `/metrics` also refreshes the same gauge on read, so these loops
/// keep it current between scrapes rather than being the sole source of it.
pub fn spawn_monitors(broker: Arc<dyn BrokerOps>, interval: Duration, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    TRACKED_SUBSCRIPTIONS
        .iter()
        .map(|(stream, group)| {
            let broker = broker.clone();
            let stream = stream.to_string();
            let group = group.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let label_stream = stream.clone();
                let label_group = group.clone();
                monitor_pending(
                    broker,
                    stream,
                    group,
                    interval,
                    move |count| {
                        PENDING_GAUGE.with_label_values(&[&label_stream, &label_group]).set(count as f64);
                    },
                    cancel,
                )
                .await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_risk_evaluation_increments_the_right_label() {
        init();
        record_risk_evaluation(true);
        let families = REGISTRY.gather();
        let found = families.iter().any(|f| f.get_name() == "tradecoord_risk_evaluations_total");
        assert!(found);
    }
}
