//! Application configuration.
//!
//! Mirrors the teacher's `Config::from_env` pattern: `dotenv` loads a local
//! `.env` if present, then every variable is read with `std::env::var` and a
//! parsed default, never a hard failure for optional knobs.

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Pubsub,
    Http,
    Hybrid,
}

impl CommMode {
    fn parse(s: &str) -> Self {
        match s {
            "http" => CommMode::Http,
            "hybrid" => CommMode::Hybrid,
            _ => CommMode::Pubsub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Paper,
    Binance,
    Coinbase,
}

impl Exchange {
    fn parse(s: &str) -> Self {
        match s {
            "binance" => Exchange::Binance,
            "coinbase" => Exchange::Coinbase,
            _ => Exchange::Paper,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub kv_url: String,
    pub port: u16,
    pub comm_mode: CommMode,
    pub start_equity: f64,
    pub daily_target_pct: f64,
    pub stream_idemp_ttl_seconds: u64,
    pub stream_max_failures: u32,
    pub ack_ttl_seconds: u64,
    pub exec_order_stale_after_seconds: i64,
    pub exec_reconcile_interval_ms: u64,
    pub admin_token: String,
    pub exchange: Exchange,
    pub exchange_default_price: f64,
    pub exchange_default_fee: f64,
    pub profit_per_trade: f64,
    pub risk_min_confidence_default: f64,
    pub default_order_qty: f64,
    pub http_pipeline_timeout_ms: u64,
    pub notify_webhook_url: Option<String>,
    pub pending_monitor_interval_ms: u64,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Read the admin token from `ADMIN_TOKEN`, or from the file named by
    /// `ADMIN_TOKEN_FILE` if set. The file is read once at startup.
    fn load_admin_token() -> anyhow::Result<String> {
        if let Ok(path) = env::var("ADMIN_TOKEN_FILE") {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read ADMIN_TOKEN_FILE {path}: {e}"))?;
            return Ok(contents.trim().to_string());
        }
        env::var("ADMIN_TOKEN")
            .map_err(|_| anyhow::anyhow!("ADMIN_TOKEN or ADMIN_TOKEN_FILE must be set"))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            broker_url: env_string("BROKER_URL", "redis://127.0.0.1:6379"),
            kv_url: env_string("KV_URL", "redis://127.0.0.1:6379"),
            port: env_parsed("PORT", 8080u16),
            comm_mode: CommMode::parse(&env_string("COMM_MODE", "pubsub")),
            start_equity: env_parsed("START_EQUITY", 10_000.0),
            daily_target_pct: env_parsed("DAILY_TARGET_PCT", 1.0),
            stream_idemp_ttl_seconds: env_parsed("STREAM_IDEMP_TTL_SECONDS", 86_400),
            stream_max_failures: env_parsed("STREAM_MAX_FAILURES", 5),
            ack_ttl_seconds: env_parsed("ACK_TTL_SECONDS", 604_800),
            exec_order_stale_after_seconds: env_parsed("EXEC_ORDER_STALE_AFTER_SECONDS", 120),
            exec_reconcile_interval_ms: env_parsed("EXEC_RECONCILE_INTERVAL_MS", 30_000),
            admin_token: Self::load_admin_token()?,
            exchange: Exchange::parse(&env_string("EXCHANGE", "paper")),
            exchange_default_price: env_parsed("EXCHANGE_DEFAULT_PRICE", 1.0),
            exchange_default_fee: env_parsed("EXCHANGE_DEFAULT_FEE", 0.0),
            profit_per_trade: env_parsed("PROFIT_PER_TRADE", 10.0),
            risk_min_confidence_default: env_parsed("RISK_MIN_CONFIDENCE_DEFAULT", 0.6),
            default_order_qty: env_parsed("ORDER_QTY", 1.0),
            http_pipeline_timeout_ms: env_parsed("HTTP_PIPELINE_TIMEOUT_MS", 5_000),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            pending_monitor_interval_ms: env_parsed("PENDING_MONITOR_INTERVAL_MS", 15_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_mode_parses_known_values_and_defaults_to_pubsub() {
        assert_eq!(CommMode::parse("http"), CommMode::Http);
        assert_eq!(CommMode::parse("hybrid"), CommMode::Hybrid);
        assert_eq!(CommMode::parse("garbage"), CommMode::Pubsub);
    }

    #[test]
    fn exchange_parses_known_values_and_defaults_to_paper() {
        assert_eq!(Exchange::parse("binance"), Exchange::Binance);
        assert_eq!(Exchange::parse("coinbase"), Exchange::Coinbase);
        assert_eq!(Exchange::parse("nope"), Exchange::Paper);
    }
}
