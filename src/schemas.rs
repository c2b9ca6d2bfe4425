//! Stream message shapes and invariants.
//!
//! Every payload on every stream is a JSON object; these types are the
//! `serde` contract for that object under the conventional `data` field.
//! Field names follow the wire convention (`camelCase`) even though Rust
//! field names stay `snake_case`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical stream (topic) names. Each has a companion `<name>.dlq` stream.
pub mod streams {
    pub const ORCHESTRATOR_COMMANDS: &str = "orchestrator.commands";
    pub const ANALYSIS_SIGNALS: &str = "analysis.signals";
    pub const RISK_REQUESTS: &str = "risk.requests";
    pub const RISK_RESPONSES: &str = "risk.responses";
    pub const EXEC_ORDERS: &str = "exec.orders";
    pub const EXEC_STATUS: &str = "exec.status";
    pub const NOTIFY_EVENTS: &str = "notify.events";

    /// The companion dead-letter stream name for `stream`.
    pub fn dlq_of(stream: &str) -> String {
        format!("{stream}.dlq")
    }
}

/// Consumer group names, one per reader role.
pub mod groups {
    pub const ANALYST: &str = "analyst";
    pub const ORCHESTRATOR: &str = "orchestrator";
    pub const RISK: &str = "risk";
    pub const EXEC: &str = "exec";
    pub const NOTIFY: &str = "notify";
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
    Rejected,
    Failed,
    Pending,
    Canceled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Failed | OrderStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Analyze,
    Halt,
}

/// `orchestrator.commands` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `analysis.signals` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub request_id: String,
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `risk.requests` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRequest {
    pub request_id: String,
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `risk.responses` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `exec.orders` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `exec.status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStatus {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub trace_id: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// `notify.events` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// Companion dead-letter entry wrapping a failed original entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub original_stream: String,
    pub group: String,
    pub id: String,
    pub payload: serde_json::Value,
    pub error: String,
    #[serde(default = "now_iso")]
    pub ts: String,
}

/// A day's PnL snapshot, mirrors the `pnl:<YYYY-MM-DD>` hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PnlStatus {
    pub start_equity: f64,
    pub realized: f64,
    pub percent: f64,
    pub daily_target_pct: f64,
    pub halted: bool,
}

impl PnlStatus {
    pub fn recompute_percent(&mut self) {
        self.percent = if self.start_equity != 0.0 {
            100.0 * self.realized / self.start_equity
        } else {
            0.0
        };
    }

    pub fn target_reached(&self) -> bool {
        self.percent >= self.daily_target_pct
    }
}

/// The `exec:orders:<orderId>` order-state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub received_ts: DateTime<Utc>,
    pub last_status: Option<ExecStatus>,
    pub stale_notified: bool,
}

/// Shared risk parameters, `optimizer:active_params`.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    pub min_confidence: f64,
    pub risk_limit: Option<f64>,
    pub trading_start_hour: Option<u32>,
    pub trading_end_hour: Option<u32>,
    pub block_sides: Vec<String>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            risk_limit: None,
            trading_start_hour: None,
            trading_end_hour: None,
            block_sides: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_status_percent_is_derived_from_start_equity() {
        let mut status = PnlStatus {
            start_equity: 1000.0,
            realized: 10.0,
            percent: 0.0,
            daily_target_pct: 1.0,
            halted: false,
        };
        status.recompute_percent();
        assert_eq!(status.percent, 1.0);
        assert!(status.target_reached());
    }

    #[test]
    fn order_status_terminal_classification() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn command_round_trips_through_json_with_camel_case_fields() {
        let cmd = Command {
            kind: CommandType::Analyze,
            symbol: Some("BTC-USD".to_string()),
            reason: None,
            request_id: Some("abc".to_string()),
            trace_id: "trace-1".to_string(),
            ts: now_iso(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["requestId"], "abc");
        assert_eq!(json["symbol"], "BTC-USD");
        assert!(json.get("reason").is_none());

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back.request_id.as_deref(), Some("abc"));
    }
}
