//! Reliable stream-consumer runtime: the backbone every agent is built on.
//!
//! Provides the consumer-group loop (backlog sweep, blocking read, per-entry
//! idempotency suppression, failure counting, DLQ routing) and the pending
//! monitor. See spec §4.1.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerOps, Entry};
use crate::schemas::DlqEntry;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type Handler = Arc<dyn Fn(Entry) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

const BACKLOG_BATCH: usize = 10;
const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const EMPTY_READ_YIELD: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct IdempotencyConfig {
    pub key_fn: KeyFn,
    pub ttl: Duration,
}

#[derive(Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer_name: String,
    pub idempotency: Option<IdempotencyConfig>,
    pub dlq_stream: Option<String>,
    pub max_failures: u32,
}

impl ConsumerConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer_name: hostname_consumer_name(),
            idempotency: None,
            dlq_stream: None,
            max_failures: 5,
        }
    }

    pub fn with_idempotency(mut self, key_fn: KeyFn, ttl: Duration) -> Self {
        self.idempotency = Some(IdempotencyConfig { key_fn, ttl });
        self
    }

    pub fn with_dlq(mut self, dlq_stream: impl Into<String>) -> Self {
        self.dlq_stream = Some(dlq_stream.into());
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }
}

fn hostname_consumer_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("consumer-{}", std::process::id()))
}

fn failures_key(stream: &str, group: &str) -> String {
    format!("stream:{stream}:group:{group}:failures")
}

fn idem_key(stream: &str, group: &str, k: &str) -> String {
    format!("idem:{stream}:{group}:{k}")
}

/// Run the consumer loop until `cancel` fires. In-flight handler calls are
/// allowed to finish; no new batch is started afterward.
pub async fn run_consumer(
    broker: Arc<dyn BrokerOps>,
    cfg: ConsumerConfig,
    handler: Handler,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    broker.ensure_group(&cfg.stream, &cfg.group).await?;
    info!(stream = %cfg.stream, group = %cfg.group, "consumer loop started");

    while !cancel.is_cancelled() {
        let mut entries = broker
            .read_backlog(&cfg.stream, &cfg.group, &cfg.consumer_name, BACKLOG_BATCH)
            .await
            .unwrap_or_else(|e| {
                warn!(stream = %cfg.stream, error = %e, "backlog read failed, retrying");
                Vec::new()
            });

        if entries.is_empty() {
            entries = broker
                .read_new(
                    &cfg.stream,
                    &cfg.group,
                    &cfg.consumer_name,
                    BACKLOG_BATCH,
                    BLOCK_TIMEOUT,
                )
                .await
                .unwrap_or_else(|e| {
                    warn!(stream = %cfg.stream, error = %e, "blocking read failed, retrying");
                    Vec::new()
                });
        }

        if entries.is_empty() {
            tokio::time::sleep(EMPTY_READ_YIELD).await;
            continue;
        }

        for entry in entries {
            if cancel.is_cancelled() {
                break;
            }
            process_entry(&broker, &cfg, &handler, entry).await;
        }
    }

    info!(stream = %cfg.stream, group = %cfg.group, "consumer loop stopped");
    Ok(())
}

async fn process_entry(broker: &Arc<dyn BrokerOps>, cfg: &ConsumerConfig, handler: &Handler, entry: Entry) {
    let stream = &cfg.stream;
    let group = &cfg.group;

    let mut claimed_idem_key: Option<String> = None;
    if let Some(idem) = &cfg.idempotency {
        let k = (idem.key_fn)(&entry.payload).unwrap_or_else(|| entry.id.clone());
        let key = idem_key(stream, group, &k);
        match broker.set_nx_ex(&key, "1", idem.ttl.as_secs()).await {
            Ok(true) => claimed_idem_key = Some(key),
            Ok(false) => {
                debug!(stream = %stream, group = %group, id = %entry.id, "duplicate suppressed");
                let _ = broker.ack(stream, group, &entry.id).await;
                return;
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "idempotency claim failed, processing anyway");
            }
        }
    }

    match handler(entry.clone()).await {
        Ok(()) => {
            let _ = broker.ack(stream, group, &entry.id).await;
            let _ = broker
                .hash_del_field(&failures_key(stream, group), &entry.id)
                .await;
        }
        Err(e) => {
            error!(stream = %stream, group = %group, id = %entry.id, error = %e, "handler failed");

            // The handler did not actually complete: release the idempotency
            // claim so the next redelivery re-invokes it instead of being
            // suppressed as a duplicate.
            if let Some(key) = &claimed_idem_key {
                let _ = broker.kv_del(key).await;
            }

            let fkey = failures_key(stream, group);
            let count = broker.hincr_int(&fkey, &entry.id, 1).await.unwrap_or(1);

            if count as u32 >= cfg.max_failures {
                if let Some(dlq) = &cfg.dlq_stream {
                    let dlq_entry = DlqEntry {
                        original_stream: stream.clone(),
                        group: group.clone(),
                        id: entry.id.clone(),
                        payload: entry.payload.clone(),
                        error: e.to_string(),
                        ts: chrono::Utc::now().to_rfc3339(),
                    };
                    if let Ok(value) = serde_json::to_value(&dlq_entry) {
                        let _ = broker.append(dlq, &value).await;
                    }
                    let _ = broker.ack(stream, group, &entry.id).await;
                    let _ = broker.hash_del_field(&fkey, &entry.id).await;
                    warn!(stream = %stream, id = %entry.id, "moved to DLQ after max failures");
                }
            }
            // Otherwise leave pending; the next backlog sweep retries it.
        }
    }
}

/// Periodically query the broker's pending count for `(stream, group)` and
/// invoke `callback`. Runs until `cancel` fires. Errors are swallowed —
/// this is a best-effort gauge, never a correctness path.
pub async fn monitor_pending<F>(
    broker: Arc<dyn BrokerOps>,
    stream: String,
    group: String,
    interval: Duration,
    mut callback: F,
    cancel: CancellationToken,
) where
    F: FnMut(i64) + Send,
{
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match broker.pending_summary(&stream, &group).await {
            Ok(summary) => callback(summary.count),
            Err(e) => debug!(stream = %stream, group = %group, error = %e, "pending monitor query failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
}
