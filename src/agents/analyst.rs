//! Market Analyst: consumes `analyze` commands, emits a signal. See spec
//! §4.4. Signal computation is implementation-free per spec; this stub
//! always returns `side=buy, confidence=0.7`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::BrokerOps;
use crate::schemas::{self, groups, streams, CommandType, Side};
use crate::stream_runtime::{ConsumerConfig, Handler};

pub const STUB_SIDE: Side = Side::Buy;
pub const STUB_CONFIDENCE: f64 = 0.7;

/// Compute a signal for `(symbol, requestId)`. Implementation-free per spec.
pub fn analyze_stub(request_id: &str, symbol: &str, trace_id: &str) -> schemas::Signal {
    schemas::Signal {
        request_id: request_id.to_string(),
        symbol: symbol.to_string(),
        side: STUB_SIDE,
        confidence: STUB_CONFIDENCE,
        trace_id: trace_id.to_string(),
        ts: schemas::now_iso(),
    }
}

pub fn handler(broker: Arc<dyn BrokerOps>) -> Handler {
    Arc::new(move |entry| {
        let broker = broker.clone();
        Box::pin(async move {
            let cmd: schemas::Command = serde_json::from_value(entry.payload)?;
            if cmd.kind != CommandType::Analyze {
                return Ok(());
            }
            let Some(request_id) = cmd.request_id else {
                return Ok(());
            };
            let symbol = cmd.symbol.unwrap_or_default();
            let signal = analyze_stub(&request_id, &symbol, &cmd.trace_id);
            broker
                .append(streams::ANALYSIS_SIGNALS, &serde_json::to_value(&signal)?)
                .await?;
            info!(request_id = %request_id, symbol = %symbol, "signal emitted");
            Ok(())
        })
    })
}

pub async fn run(broker: Arc<dyn BrokerOps>, idemp_ttl: Duration, max_failures: u32, cancel: CancellationToken) -> anyhow::Result<()> {
    let key_fn: crate::stream_runtime::KeyFn = Arc::new(|payload| {
        payload.get("requestId").and_then(|v| v.as_str()).map(|s| s.to_string())
    });
    let cfg = ConsumerConfig::new(streams::ORCHESTRATOR_COMMANDS, groups::ANALYST)
        .with_idempotency(key_fn, idemp_ttl)
        .with_dlq(schemas::streams::dlq_of(streams::ORCHESTRATOR_COMMANDS))
        .with_max_failures(max_failures);
    crate::stream_runtime::run_consumer(broker.clone(), cfg, handler(broker), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_always_returns_buy_with_fixed_confidence() {
        let signal = analyze_stub("r1", "BTC-USD", "t1");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.confidence, 0.7);
        assert_eq!(signal.symbol, "BTC-USD");
    }
}
