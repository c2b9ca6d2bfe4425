//! Risk Manager: evaluates signals against dynamic parameters loaded fresh
//! on every message. See spec §4.5.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::BrokerOps;
use crate::schemas::{self, groups, streams, RiskParams, RiskResponse, Severity, Side};
use crate::stream_runtime::{ConsumerConfig, Handler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskReason {
    OutsideWindow,
    BlockedSide,
    RiskLimit,
    LowConfidence,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::OutsideWindow => "outside_window",
            RiskReason::BlockedSide => "blocked_side",
            RiskReason::RiskLimit => "risk_limit",
            RiskReason::LowConfidence => "low_confidence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskVerdict {
    pub ok: bool,
    pub reason: Option<RiskReason>,
}

fn hour_outside_window(now_hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        now_hour < start || now_hour >= end
    } else {
        // Wrap-around window, e.g. start=22, end=6.
        now_hour >= end && now_hour < start
    }
}

/// Pure function: deterministic in `(params, side, confidence, now_hour)`.
/// Ordering: `outside_window > blocked_side > risk_limit > low_confidence > ok`.
pub fn evaluate(params: &RiskParams, side: Side, confidence: f64, now_hour: u32) -> RiskVerdict {
    if let (Some(start), Some(end)) = (params.trading_start_hour, params.trading_end_hour) {
        if hour_outside_window(now_hour, start, end) {
            return RiskVerdict {
                ok: false,
                reason: Some(RiskReason::OutsideWindow),
            };
        }
    }

    let side_str = side.as_str();
    if params.block_sides.iter().any(|s| s.eq_ignore_ascii_case(side_str)) {
        return RiskVerdict {
            ok: false,
            reason: Some(RiskReason::BlockedSide),
        };
    }

    let risk_limit_threshold = params.risk_limit.map(|rl| 1.0 - rl.clamp(0.0, 1.0));
    let threshold = risk_limit_threshold
        .map(|t| t.max(params.min_confidence))
        .unwrap_or(params.min_confidence);

    if confidence < threshold {
        let reason = match risk_limit_threshold {
            Some(rlt) if rlt >= params.min_confidence && confidence < rlt => RiskReason::RiskLimit,
            _ => RiskReason::LowConfidence,
        };
        return RiskVerdict {
            ok: false,
            reason: Some(reason),
        };
    }

    RiskVerdict { ok: true, reason: None }
}

async fn load_params(broker: &Arc<dyn BrokerOps>) -> anyhow::Result<RiskParams> {
    let map = broker.hash_get_all("optimizer:active_params").await?;
    let mut params = RiskParams::default();
    if let Some(v) = map.get("minConfidence").and_then(|v| v.parse().ok()) {
        params.min_confidence = v;
    }
    params.risk_limit = map.get("riskLimit").and_then(|v| v.parse().ok());
    params.trading_start_hour = map.get("tradingStartHour").and_then(|v| v.parse().ok());
    params.trading_end_hour = map.get("tradingEndHour").and_then(|v| v.parse().ok());
    params.block_sides = map
        .get("blockSides")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
        .unwrap_or_default();
    Ok(params)
}

/// Build the handler closure for the `risk.requests` consumer loop.
pub fn handler(broker: Arc<dyn BrokerOps>) -> Handler {
    Arc::new(move |entry| {
        let broker = broker.clone();
        Box::pin(async move {
            let req: schemas::RiskRequest = serde_json::from_value(entry.payload)?;
            let params = load_params(&broker).await?;
            let now_hour = Utc::now().hour();
            let verdict = evaluate(&params, req.side, req.confidence, now_hour);

            let response = RiskResponse {
                request_id: req.request_id.clone(),
                ok: verdict.ok,
                reason: verdict.reason.map(|r| r.as_str().to_string()),
                trace_id: req.trace_id.clone(),
                ts: schemas::now_iso(),
            };
            broker
                .append(streams::RISK_RESPONSES, &serde_json::to_value(&response)?)
                .await?;

            if !verdict.ok {
                let event = crate::schemas::NotifyEvent {
                    kind: "risk_rejected".to_string(),
                    severity: Severity::Warning,
                    message: verdict.reason.map(|r| r.as_str().to_string()),
                    context: Some(serde_json::json!({"requestId": req.request_id, "symbol": req.symbol})),
                    request_id: Some(req.request_id.clone()),
                    trace_id: Some(req.trace_id.clone()),
                    ts: schemas::now_iso(),
                };
                broker
                    .append(streams::NOTIFY_EVENTS, &serde_json::to_value(&event)?)
                    .await?;
            }

            crate::metrics::record_risk_evaluation(verdict.ok);
            info!(request_id = %req.request_id, ok = verdict.ok, "risk evaluated");
            Ok(())
        })
    })
}

pub async fn run(broker: Arc<dyn BrokerOps>, idemp_ttl: Duration, max_failures: u32, cancel: CancellationToken) -> anyhow::Result<()> {
    let key_fn: crate::stream_runtime::KeyFn = Arc::new(|payload| {
        payload.get("requestId").and_then(|v| v.as_str()).map(|s| s.to_string())
    });
    let cfg = ConsumerConfig::new(streams::RISK_REQUESTS, groups::RISK)
        .with_idempotency(key_fn, idemp_ttl)
        .with_dlq(schemas::streams::dlq_of(streams::RISK_REQUESTS))
        .with_max_failures(max_failures);
    crate::stream_runtime::run_consumer(broker.clone(), cfg, handler(broker), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RiskParams {
        RiskParams {
            min_confidence: 0.6,
            risk_limit: None,
            trading_start_hour: None,
            trading_end_hour: None,
            block_sides: Vec::new(),
        }
    }

    #[test]
    fn ok_when_confidence_meets_default_threshold() {
        let v = evaluate(&params(), Side::Buy, 0.7, 12);
        assert_eq!(v, RiskVerdict { ok: true, reason: None });
    }

    #[test]
    fn low_confidence_rejected_below_min_confidence() {
        let v = evaluate(&params(), Side::Buy, 0.5, 12);
        assert_eq!(
            v,
            RiskVerdict {
                ok: false,
                reason: Some(RiskReason::LowConfidence)
            }
        );
    }

    #[test]
    fn outside_window_outranks_everything_else() {
        let mut p = params();
        p.trading_start_hour = Some(9);
        p.trading_end_hour = Some(17);
        p.block_sides = vec!["buy".to_string()];
        let v = evaluate(&p, Side::Buy, 0.9, 20);
        assert_eq!(v.reason, Some(RiskReason::OutsideWindow));
    }

    #[test]
    fn wrap_around_window_spans_midnight() {
        let mut p = params();
        p.trading_start_hour = Some(22);
        p.trading_end_hour = Some(6);
        // 23:00 is inside [22, 6) wrap-around window.
        let v = evaluate(&p, Side::Buy, 0.9, 23);
        assert_eq!(v, RiskVerdict { ok: true, reason: None });
        // 12:00 is outside it.
        let v2 = evaluate(&p, Side::Buy, 0.9, 12);
        assert_eq!(v2.reason, Some(RiskReason::OutsideWindow));
    }

    #[test]
    fn blocked_side_outranks_confidence_threshold() {
        let mut p = params();
        p.block_sides = vec!["sell".to_string()];
        let v = evaluate(&p, Side::Sell, 0.99, 12);
        assert_eq!(v.reason, Some(RiskReason::BlockedSide));
    }

    #[test]
    fn risk_limit_reason_applies_only_when_it_is_the_binding_threshold() {
        let mut p = params();
        p.min_confidence = 0.5;
        p.risk_limit = Some(0.3); // threshold = 1 - 0.3 = 0.7, >= min_confidence
        let v = evaluate(&p, Side::Buy, 0.6, 12);
        assert_eq!(v.reason, Some(RiskReason::RiskLimit));
    }

    #[test]
    fn low_confidence_reason_when_risk_limit_threshold_does_not_bind() {
        let mut p = params();
        p.min_confidence = 0.8;
        p.risk_limit = Some(0.5); // threshold = 0.5, below min_confidence, doesn't bind
        let v = evaluate(&p, Side::Buy, 0.6, 12);
        assert_eq!(v.reason, Some(RiskReason::LowConfidence));
    }

    #[test]
    fn evaluate_is_deterministic_for_fixed_inputs() {
        let p = params();
        let a = evaluate(&p, Side::Buy, 0.65, 12);
        let b = evaluate(&p, Side::Buy, 0.65, 12);
        assert_eq!(a, b);
    }
}
