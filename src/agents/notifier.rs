//! Notification Manager: fans events out to outbound sinks and keeps a
//! recent-events ring plus an acknowledgment store. See spec §4.7.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::BrokerOps;
use crate::schemas::{self, groups, streams, NotifyEvent};
use crate::stream_runtime::{ConsumerConfig, Handler};

const RING_CAPACITY: usize = 100;

/// An outbound delivery target. Failures propagate as errors so the stream
/// runtime's retry/DLQ machinery engages.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn deliver(&self, event: &NotifyEvent) -> anyhow::Result<()>;
}

/// Always succeeds; logs at a level derived from severity.
pub struct LogSink;

#[async_trait]
impl NotifySink for LogSink {
    async fn deliver(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        match event.severity {
            schemas::Severity::Critical => error!(kind = %event.kind, message = ?event.message, "critical notification"),
            schemas::Severity::Warning => tracing::warn!(kind = %event.kind, message = ?event.message, "warning notification"),
            schemas::Severity::Info => info!(kind = %event.kind, message = ?event.message, "notification"),
        }
        Ok(())
    }
}

/// Posts the event as JSON to a configured webhook URL. Can fail, which is
/// what exercises the DLQ path (spec scenario S3).
pub struct WebhookSink {
    pub client: reqwest::Client,
    pub url: String,
}

#[async_trait]
impl NotifySink for WebhookSink {
    async fn deliver(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        let resp = self.client.post(&self.url).json(event).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook sink returned {}", resp.status());
        }
        Ok(())
    }
}

pub fn idempotency_key(event: &NotifyEvent) -> String {
    match &event.request_id {
        Some(rid) => rid.clone(),
        None => format!("{}:{}:{}", event.kind, event.trace_id.as_deref().unwrap_or(""), event.ts),
    }
}

#[derive(Debug, Clone)]
pub struct RingEntry {
    pub ring_id: String,
    pub event: NotifyEvent,
}

/// Process-local recent-events ring. Re-derivable from the stream on
/// restart; never shared across processes (spec §9).
#[derive(Default)]
pub struct RecentRing {
    entries: Mutex<VecDeque<RingEntry>>,
}

impl RecentRing {
    pub fn push(&self, ring_id: String, event: NotifyEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(RingEntry { ring_id, event });
    }

    pub fn snapshot(&self) -> Vec<RingEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

fn ack_key(id: &str) -> String {
    format!("notify:ack:{id}")
}

pub async fn ack(broker: &Arc<dyn BrokerOps>, id: &str, ttl_secs: u64) -> anyhow::Result<()> {
    // set_nx_ex is idempotent here: acking twice just finds the key already present.
    broker.set_nx_ex(&ack_key(id), "1", ttl_secs).await?;
    Ok(())
}

/// Decorate ring entries with their `acked` state via batch existence
/// probing of `notify:ack:<ring_id>`.
pub async fn recent_with_acks(
    broker: &Arc<dyn BrokerOps>,
    ring: &RecentRing,
) -> anyhow::Result<Vec<(RingEntry, bool)>> {
    let snapshot = ring.snapshot();
    let mut out = Vec::with_capacity(snapshot.len());
    for entry in snapshot {
        let acked = broker.exists(&ack_key(&entry.ring_id)).await.unwrap_or(false);
        out.push((entry, acked));
    }
    Ok(out)
}

pub fn handler(broker: Arc<dyn BrokerOps>, ring: Arc<RecentRing>, sinks: Vec<Arc<dyn NotifySink>>) -> Handler {
    Arc::new(move |entry| {
        let ring = ring.clone();
        let sinks = sinks.clone();
        Box::pin(async move {
            let event: NotifyEvent = serde_json::from_value(entry.payload)?;
            let ring_id = idempotency_key(&event);
            ring.push(ring_id, event.clone());

            for sink in &sinks {
                sink.deliver(&event).await?;
            }
            Ok(())
        })
    })
}

pub async fn run(
    broker: Arc<dyn BrokerOps>,
    ring: Arc<RecentRing>,
    sinks: Vec<Arc<dyn NotifySink>>,
    idemp_ttl: Duration,
    max_failures: u32,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let key_fn: crate::stream_runtime::KeyFn = Arc::new(|payload| {
        if let Some(rid) = payload.get("requestId").and_then(|v| v.as_str()) {
            return Some(rid.to_string());
        }
        let kind = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let trace_id = payload.get("traceId").and_then(|v| v.as_str()).unwrap_or("");
        let ts = payload.get("ts").and_then(|v| v.as_str()).unwrap_or("");
        Some(format!("{kind}:{trace_id}:{ts}"))
    });
    let cfg = ConsumerConfig::new(streams::NOTIFY_EVENTS, groups::NOTIFY)
        .with_idempotency(key_fn, idemp_ttl)
        .with_dlq(schemas::streams::dlq_of(streams::NOTIFY_EVENTS))
        .with_max_failures(max_failures);
    crate::stream_runtime::run_consumer(broker.clone(), cfg, handler(broker, ring, sinks), cancel).await
}
