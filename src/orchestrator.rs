//! Orchestrator: drives the `analyze → risk → execute → fill` pipeline,
//! maintains PnL, enforces the halt invariant, and exposes admin ops.
//! See spec §4.3.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::executor;
use crate::agents::risk::evaluate;
use crate::broker::{BrokerOps, Entry};
use crate::config::CommMode;
use crate::error::AdminError;
use crate::exchange::ExchangeAdapter;
use crate::pnl::PnlLedger;
use crate::schemas::{self, groups, streams, Command, CommandType, NotifyEvent, OrderStatus, RiskParams, RiskRequest, Severity, Side};

/// Carries the data the analyze→risk slice needs to forward a risk verdict
/// into an order. Soft cache — losing it on restart only stalls in-flight
/// pipelines; new pipelines are unaffected (spec §4.3).
#[derive(Debug, Clone)]
struct PendingPipeline {
    symbol: String,
    side: Side,
    #[allow(dead_code)]
    confidence: f64,
}

pub struct Orchestrator {
    broker: Arc<dyn BrokerOps>,
    pnl: Arc<PnlLedger>,
    pending: Arc<Mutex<HashMap<String, PendingPipeline>>>,
    start_equity: f64,
    daily_target_pct: f64,
    default_order_qty: f64,
    profit_per_trade: f64,
    http_timeout: Duration,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub request_id: String,
    pub trace_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRunResult {
    pub request_id: String,
    pub trace_id: String,
    pub risk_ok: bool,
    pub risk_reason: Option<String>,
    pub exec_status: Option<OrderStatus>,
    pub profit: Option<f64>,
}

fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u32 = rng.gen();
    format!("{:x}-{:08x}", chrono::Utc::now().timestamp_millis(), suffix)
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn BrokerOps>,
        pnl: Arc<PnlLedger>,
        start_equity: f64,
        daily_target_pct: f64,
        default_order_qty: f64,
        profit_per_trade: f64,
        http_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            pnl,
            pending: Arc::new(Mutex::new(HashMap::new())),
            start_equity,
            daily_target_pct,
            default_order_qty,
            profit_per_trade,
            http_timeout,
        }
    }

    async fn admit(&self) -> Result<(), AdminError> {
        self.pnl
            .init_day_if_needed(self.start_equity, self.daily_target_pct)
            .await
            .map_err(AdminError::Internal)?;
        if self.pnl.is_halted().await.map_err(AdminError::Internal)? {
            return Err(AdminError::Halted);
        }
        Ok(())
    }

    /// `pubsub` mode: originate by appending one `analyze` command. The rest
    /// of the pipeline runs via this orchestrator's own stream consumers.
    pub async fn run_pubsub(
        &self,
        symbol: &str,
        request_id: Option<String>,
        trace_id: Option<String>,
    ) -> Result<RunAccepted, AdminError> {
        self.admit().await?;

        let request_id = request_id.unwrap_or_else(generate_request_id);
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let command = Command {
            kind: CommandType::Analyze,
            symbol: Some(symbol.to_string()),
            reason: None,
            request_id: Some(request_id.clone()),
            trace_id: trace_id.clone(),
            ts: schemas::now_iso(),
        };
        self.broker
            .append(streams::ORCHESTRATOR_COMMANDS, &serde_json::to_value(&command).map_err(|e| AdminError::Internal(e.into()))?)
            .await
            .map_err(AdminError::Internal)?;

        Ok(RunAccepted { request_id, trace_id })
    }

    /// `http` mode: synchronously call analyst → risk → executor in
    /// sequence, each step within a combined 5 s budget (spec §5).
    pub async fn run_http(
        &self,
        symbol: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        request_id: Option<String>,
        trace_id: Option<String>,
    ) -> Result<HttpRunResult, AdminError> {
        self.admit().await?;

        let request_id = request_id.unwrap_or_else(generate_request_id);
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let outcome = tokio::time::timeout(self.http_timeout, self.run_http_inner(symbol, adapter, &request_id, &trace_id)).await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(AdminError::PipelineFailed(e.to_string())),
            Err(_) => Err(AdminError::PipelineFailed("timed out".to_string())),
        }
    }

    async fn run_http_inner(
        &self,
        symbol: &str,
        adapter: Arc<dyn ExchangeAdapter>,
        request_id: &str,
        trace_id: &str,
    ) -> anyhow::Result<HttpRunResult> {
        let signal = crate::agents::analyst::analyze_stub(request_id, symbol, trace_id);

        let params = self.load_risk_params().await?;
        let now_hour = chrono::Timelike::hour(&chrono::Utc::now());
        let verdict = evaluate(&params, signal.side, signal.confidence, now_hour);
        crate::metrics::record_risk_evaluation(verdict.ok);

        if !verdict.ok {
            return Ok(HttpRunResult {
                request_id: request_id.to_string(),
                trace_id: trace_id.to_string(),
                risk_ok: false,
                risk_reason: verdict.reason.map(|r| r.as_str().to_string()),
                exec_status: None,
                profit: None,
            });
        }

        let status = executor::simulate_fill(
            &adapter,
            request_id,
            symbol,
            signal.side,
            self.default_order_qty,
            trace_id,
            self.profit_per_trade,
        )
        .await?;

        if status.status == OrderStatus::Filled {
            self.settle_fill(status.profit.unwrap_or(0.0)).await?;
        }

        Ok(HttpRunResult {
            request_id: request_id.to_string(),
            trace_id: trace_id.to_string(),
            risk_ok: true,
            risk_reason: None,
            exec_status: Some(status.status),
            profit: status.profit,
        })
    }

    async fn load_risk_params(&self) -> anyhow::Result<RiskParams> {
        let map = self.broker.hash_get_all("optimizer:active_params").await?;
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

    /// `analysis.signals(requestId)` handler: WAITING_SIGNAL → WAITING_RISK.
    pub async fn on_signal(&self, entry: Entry) -> anyhow::Result<()> {
        let signal: schemas::Signal = serde_json::from_value(entry.payload)?;
        self.pending.lock().insert(
            signal.request_id.clone(),
            PendingPipeline {
                symbol: signal.symbol.clone(),
                side: signal.side,
                confidence: signal.confidence,
            },
        );

        let req = RiskRequest {
            request_id: signal.request_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            confidence: signal.confidence,
            trace_id: signal.trace_id.clone(),
            ts: schemas::now_iso(),
        };
        self.broker.append(streams::RISK_REQUESTS, &serde_json::to_value(&req)?).await?;
        Ok(())
    }

    /// `risk.responses(requestId)` handler: WAITING_RISK → {SUBMITTED | REJECTED}.
    pub async fn on_risk_response(&self, entry: Entry) -> anyhow::Result<()> {
        let resp: schemas::RiskResponse = serde_json::from_value(entry.payload)?;
        let Some(pending) = self.pending.lock().remove(&resp.request_id) else {
            warn!(request_id = %resp.request_id, "risk response for unknown/expired pipeline, dropping");
            return Ok(());
        };

        if !resp.ok {
            info!(request_id = %resp.request_id, reason = ?resp.reason, "pipeline rejected by risk");
            return Ok(());
        }

        let order = schemas::Order {
            order_id: resp.request_id.clone(),
            symbol: pending.symbol,
            side: pending.side,
            qty: self.default_order_qty,
            trace_id: resp.trace_id.clone(),
            ts: schemas::now_iso(),
        };
        self.broker.append(streams::EXEC_ORDERS, &serde_json::to_value(&order)?).await?;
        Ok(())
    }

    /// `exec.status(orderId, status=filled)` handler: WAITING_FILL → SETTLED.
    pub async fn on_exec_status(&self, entry: Entry) -> anyhow::Result<()> {
        let status: schemas::ExecStatus = serde_json::from_value(entry.payload)?;
        if status.status != OrderStatus::Filled {
            return Ok(());
        }
        self.settle_fill(status.profit.unwrap_or(0.0)).await?;
        Ok(())
    }

    async fn settle_fill(&self, profit: f64) -> anyhow::Result<()> {
        let snapshot = self.pnl.increment(profit).await?;
        if !snapshot.halted && snapshot.target_reached() {
            self.pnl.set_halted(true).await?;
            let command = Command {
                kind: CommandType::Halt,
                symbol: None,
                reason: Some("daily_target_reached".to_string()),
                request_id: None,
                trace_id: Uuid::new_v4().to_string(),
                ts: schemas::now_iso(),
            };
            self.broker
                .append(streams::ORCHESTRATOR_COMMANDS, &serde_json::to_value(&command)?)
                .await?;
            let event = NotifyEvent {
                kind: "daily_target_reached".to_string(),
                severity: Severity::Critical,
                message: Some(format!("daily target reached: {:.2}%", snapshot.percent)),
                context: Some(serde_json::to_value(&snapshot)?),
                request_id: None,
                trace_id: None,
                ts: schemas::now_iso(),
            };
            self.broker.append(streams::NOTIFY_EVENTS, &serde_json::to_value(&event)?).await?;
            info!(percent = snapshot.percent, "daily target reached, halting");
        }
        Ok(())
    }

    // -- Admin operations (token-gated at the HTTP layer) --

    pub async fn halt(&self, reason: &str) -> anyhow::Result<()> {
        self.pnl.set_halted(true).await?;
        let command = Command {
            kind: CommandType::Halt,
            symbol: None,
            reason: Some(reason.to_string()),
            request_id: None,
            trace_id: Uuid::new_v4().to_string(),
            ts: schemas::now_iso(),
        };
        self.broker.append(streams::ORCHESTRATOR_COMMANDS, &serde_json::to_value(&command)?).await?;
        let event = NotifyEvent {
            kind: "halt".to_string(),
            severity: Severity::Critical,
            message: Some(reason.to_string()),
            context: None,
            request_id: None,
            trace_id: None,
            ts: schemas::now_iso(),
        };
        self.broker.append(streams::NOTIFY_EVENTS, &serde_json::to_value(&event)?).await?;
        Ok(())
    }

    pub async fn unhalt(&self) -> anyhow::Result<()> {
        self.pnl.set_halted(false).await?;
        let event = NotifyEvent {
            kind: "halt_cleared".to_string(),
            severity: Severity::Info,
            message: None,
            context: None,
            request_id: None,
            trace_id: None,
            ts: schemas::now_iso(),
        };
        self.broker.append(streams::NOTIFY_EVENTS, &serde_json::to_value(&event)?).await?;
        Ok(())
    }

    pub async fn pnl_reset(&self) -> anyhow::Result<()> {
        self.pnl.reset_day(self.start_equity, self.daily_target_pct).await
    }

    pub async fn pending_summary(&self, stream: &str, group: &str) -> anyhow::Result<crate::broker::PendingSummary> {
        self.broker.pending_summary(stream, group).await
    }

    pub async fn dlq_list(&self, stream: &str, start: &str, end: &str, count: usize) -> anyhow::Result<Vec<Entry>> {
        self.broker.range(stream, start, end, count).await
    }

    pub async fn dlq_requeue(&self, dlq_stream: &str, id: &str) -> Result<(), AdminError> {
        let entries = self
            .broker
            .range(dlq_stream, "-", "+", 10_000)
            .await
            .map_err(AdminError::Internal)?;
        let Some(entry) = entries.into_iter().find(|e| e.id == id) else {
            return Err(AdminError::NotFound);
        };
        let dlq_entry: schemas::DlqEntry = serde_json::from_value(entry.payload).map_err(|_| AdminError::InvalidDlqFormat)?;

        self.broker
            .append(&dlq_entry.original_stream, &dlq_entry.payload)
            .await
            .map_err(AdminError::Internal)?;
        self.broker.delete(dlq_stream, id).await.map_err(AdminError::Internal)?;
        Ok(())
    }

    pub fn pnl(&self) -> Arc<PnlLedger> {
        self.pnl.clone()
    }

    pub fn broker(&self) -> Arc<dyn BrokerOps> {
        self.broker.clone()
    }

    /// Register handlers for this orchestrator's three inbound streams and
    /// run them until `cancel` fires. Each runs as its own consumer group
    /// task, matching spec §5's "one consumer loop per subscribed
    /// stream/group".
    pub async fn run_consumers(self: Arc<Self>, idemp_ttl: Duration, max_failures: u32, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let signal_orch = self.clone();
        let signal_handler: crate::stream_runtime::Handler = Arc::new(move |entry| {
            let orch = signal_orch.clone();
            Box::pin(async move { orch.on_signal(entry).await })
        });
        let signal_key: crate::stream_runtime::KeyFn =
            Arc::new(|p| p.get("requestId").and_then(|v| v.as_str()).map(|s| s.to_string()));
        let signal_cfg = crate::stream_runtime::ConsumerConfig::new(streams::ANALYSIS_SIGNALS, groups::ORCHESTRATOR)
            .with_idempotency(signal_key, idemp_ttl)
            .with_dlq(schemas::streams::dlq_of(streams::ANALYSIS_SIGNALS))
            .with_max_failures(max_failures);

        let risk_orch = self.clone();
        let risk_handler: crate::stream_runtime::Handler = Arc::new(move |entry| {
            let orch = risk_orch.clone();
            Box::pin(async move { orch.on_risk_response(entry).await })
        });
        let risk_key: crate::stream_runtime::KeyFn =
            Arc::new(|p| p.get("requestId").and_then(|v| v.as_str()).map(|s| s.to_string()));
        let risk_cfg = crate::stream_runtime::ConsumerConfig::new(streams::RISK_RESPONSES, groups::ORCHESTRATOR)
            .with_idempotency(risk_key, idemp_ttl)
            .with_dlq(schemas::streams::dlq_of(streams::RISK_RESPONSES))
            .with_max_failures(max_failures);

        let status_orch = self.clone();
        let status_handler: crate::stream_runtime::Handler = Arc::new(move |entry| {
            let orch = status_orch.clone();
            Box::pin(async move { orch.on_exec_status(entry).await })
        });
        let status_key: crate::stream_runtime::KeyFn =
            Arc::new(|p| p.get("orderId").and_then(|v| v.as_str()).map(|s| s.to_string()));
        let status_cfg = crate::stream_runtime::ConsumerConfig::new(streams::EXEC_STATUS, groups::ORCHESTRATOR)
            .with_idempotency(status_key, idemp_ttl)
            .with_dlq(schemas::streams::dlq_of(streams::EXEC_STATUS))
            .with_max_failures(max_failures);

        let broker = self.broker();
        tokio::try_join!(
            crate::stream_runtime::run_consumer(broker.clone(), signal_cfg, signal_handler, cancel.clone()),
            crate::stream_runtime::run_consumer(broker.clone(), risk_cfg, risk_handler, cancel.clone()),
            crate::stream_runtime::run_consumer(broker, status_cfg, status_handler, cancel),
        )?;
        Ok(())
    }
}

pub fn resolve_mode(cfg: CommMode, requested: Option<&str>) -> CommMode {
    match requested {
        Some("http") => CommMode::Http,
        Some("pubsub") => CommMode::Pubsub,
        _ => cfg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::exchange::Paper;

    fn ledger(broker: Arc<dyn BrokerOps>) -> Arc<PnlLedger> {
        Arc::new(PnlLedger::new(broker))
    }

    #[tokio::test]
    async fn run_pubsub_rejects_when_halted() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        pnl.init_day_if_needed(1000.0, 1.0).await.unwrap();
        pnl.set_halted(true).await.unwrap();

        let orch = Orchestrator::new(broker, pnl, 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5));
        let result = orch.run_pubsub("BTC-USD", None, None).await;
        assert!(matches!(result, Err(AdminError::Halted)));
    }

    #[tokio::test]
    async fn run_pubsub_appends_analyze_command() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        let orch = Orchestrator::new(broker.clone(), pnl, 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5));

        let accepted = orch.run_pubsub("BTC-USD", None, None).await.unwrap();
        assert!(!accepted.request_id.is_empty());

        let entries = broker.range(streams::ORCHESTRATOR_COMMANDS, "-", "+", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn full_pubsub_pipeline_settles_and_halts_at_target() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        let orch = Arc::new(Orchestrator::new(broker.clone(), pnl.clone(), 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5)));

        let accepted = orch.run_pubsub("BTC-USD", None, None).await.unwrap();

        let signal = crate::agents::analyst::analyze_stub(&accepted.request_id, "BTC-USD", &accepted.trace_id);
        orch.on_signal(Entry {
            id: "1-0".to_string(),
            payload: serde_json::to_value(&signal).unwrap(),
        })
        .await
        .unwrap();

        let resp = schemas::RiskResponse {
            request_id: accepted.request_id.clone(),
            ok: true,
            reason: None,
            trace_id: accepted.trace_id.clone(),
            ts: schemas::now_iso(),
        };
        orch.on_risk_response(Entry {
            id: "2-0".to_string(),
            payload: serde_json::to_value(&resp).unwrap(),
        })
        .await
        .unwrap();

        let status = schemas::ExecStatus {
            order_id: accepted.request_id.clone(),
            status: OrderStatus::Filled,
            symbol: Some("BTC-USD".to_string()),
            side: Some(Side::Buy),
            qty: Some(1.0),
            profit: Some(10.0),
            fee: None,
            price: Some(100.0),
            trace_id: accepted.trace_id.clone(),
            ts: schemas::now_iso(),
        };
        orch.on_exec_status(Entry {
            id: "3-0".to_string(),
            payload: serde_json::to_value(&status).unwrap(),
        })
        .await
        .unwrap();

        let snapshot = pnl.status().await.unwrap();
        assert_eq!(snapshot.realized, 10.0);
        assert_eq!(snapshot.percent, 1.0);
        assert!(snapshot.halted);

        let second = orch.run_pubsub("BTC-USD", None, None).await;
        assert!(matches!(second, Err(AdminError::Halted)));
    }

    #[tokio::test]
    async fn run_http_mode_happy_path() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        let orch = Orchestrator::new(broker, pnl.clone(), 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5));
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(Paper {
            default_price: 100.0,
            default_fee: 0.0,
        });

        let result = orch.run_http("BTC-USD", adapter, None, None).await.unwrap();
        assert!(result.risk_ok);
        assert_eq!(result.exec_status, Some(OrderStatus::Filled));
        assert_eq!(result.profit, Some(10.0));
    }

    #[tokio::test]
    async fn dlq_requeue_round_trips_payload_and_removes_original() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        let orch = Orchestrator::new(broker.clone(), pnl, 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5));

        let dlq_entry = schemas::DlqEntry {
            original_stream: streams::RISK_REQUESTS.to_string(),
            group: groups::RISK.to_string(),
            id: "5-0".to_string(),
            payload: serde_json::json!({"requestId": "r1"}),
            error: "boom".to_string(),
            ts: schemas::now_iso(),
        };
        let dlq_stream = schemas::streams::dlq_of(streams::RISK_REQUESTS);
        let id = broker.append(&dlq_stream, &serde_json::to_value(&dlq_entry).unwrap()).await.unwrap();

        orch.dlq_requeue(&dlq_stream, &id).await.unwrap();

        let requeued = broker.range(streams::RISK_REQUESTS, "-", "+", 10).await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].payload["requestId"], "r1");

        let remaining = broker.range(&dlq_stream, "-", "+", 10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn dlq_requeue_missing_id_returns_not_found() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let pnl = ledger(broker.clone());
        let orch = Orchestrator::new(broker, pnl, 1000.0, 1.0, 1.0, 10.0, Duration::from_secs(5));

        let result = orch.dlq_requeue("risk.requests.dlq", "missing").await;
        assert!(matches!(result, Err(AdminError::NotFound)));
    }
}
