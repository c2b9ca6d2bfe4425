//! PnL ledger: per-day realized/percent accounting and the halt flag, held
//! in the shared key-value store under `pnl:<YYYY-MM-DD>` (UTC). See spec
//! §4.2 and the Open-Question resolution in §9 (recompute `percent` from a
//! fresh read after every `increment`, rather than a racy partial update).

use std::sync::Arc;

use chrono::Utc;

use crate::broker::BrokerOps;
use crate::schemas::PnlStatus;

fn day_key(date: &str) -> String {
    format!("pnl:{date}")
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub struct PnlLedger {
    broker: Arc<dyn BrokerOps>,
}

impl PnlLedger {
    pub fn new(broker: Arc<dyn BrokerOps>) -> Self {
        Self { broker }
    }

    /// Create today's record if it doesn't already exist.
    pub async fn init_day_if_needed(&self, start_equity: f64, daily_target_pct: f64) -> anyhow::Result<()> {
        let date = today();
        let key = day_key(&date);
        let existing = self.broker.hash_get_all(&key).await?;
        if existing.contains_key("startEquity") {
            return Ok(());
        }
        self.broker
            .hash_set(
                &key,
                &[
                    ("date", date),
                    ("startEquity", start_equity.to_string()),
                    ("realized", "0".to_string()),
                    ("percent", "0".to_string()),
                    ("dailyTargetPct", daily_target_pct.to_string()),
                    ("halted", "0".to_string()),
                ],
            )
            .await
    }

    pub async fn status(&self) -> anyhow::Result<PnlStatus> {
        let key = day_key(&today());
        let map = self.broker.hash_get_all(&key).await?;
        Ok(PnlStatus {
            start_equity: map.get("startEquity").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            realized: map.get("realized").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            percent: map.get("percent").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            daily_target_pct: map.get("dailyTargetPct").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            halted: map.get("halted").map(|v| v == "1").unwrap_or(false),
        })
    }

    /// Atomically add `amount` to `realized`, then recompute and write
    /// `percent` from a fresh read of the same `startEquity`.
    pub async fn increment(&self, amount: f64) -> anyhow::Result<PnlStatus> {
        let key = day_key(&today());
        self.broker.hincrbyfloat(&key, "realized", amount).await?;

        let mut status = self.status().await?;
        status.recompute_percent();
        self.broker
            .hash_set(&key, &[("percent", status.percent.to_string())])
            .await?;
        Ok(status)
    }

    pub async fn set_halted(&self, halted: bool) -> anyhow::Result<()> {
        let key = day_key(&today());
        self.broker
            .hash_set(&key, &[("halted", if halted { "1" } else { "0" }.to_string())])
            .await
    }

    pub async fn is_halted(&self) -> anyhow::Result<bool> {
        Ok(self.status().await?.halted)
    }

    pub async fn reset_day(&self, start_equity: f64, daily_target_pct: f64) -> anyhow::Result<()> {
        let key = day_key(&today());
        self.broker
            .hash_set(
                &key,
                &[
                    ("date", today()),
                    ("startEquity", start_equity.to_string()),
                    ("realized", "0".to_string()),
                    ("percent", "0".to_string()),
                    ("dailyTargetPct", daily_target_pct.to_string()),
                    ("halted", "0".to_string()),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;

    fn ledger() -> PnlLedger {
        PnlLedger::new(Arc::new(FakeBroker::new()))
    }

    #[tokio::test]
    async fn init_is_idempotent_and_sets_defaults() {
        let ledger = ledger();
        ledger.init_day_if_needed(1000.0, 1.0).await.unwrap();
        ledger.init_day_if_needed(5000.0, 2.0).await.unwrap();

        let status = ledger.status().await.unwrap();
        assert_eq!(status.start_equity, 1000.0);
        assert_eq!(status.daily_target_pct, 1.0);
        assert!(!status.halted);
    }

    #[tokio::test]
    async fn pnl_law_percent_tracks_sum_of_increments() {
        let ledger = ledger();
        ledger.init_day_if_needed(1000.0, 1.0).await.unwrap();

        ledger.increment(4.0).await.unwrap();
        let status = ledger.increment(6.0).await.unwrap();

        assert_eq!(status.realized, 10.0);
        assert_eq!(status.percent, 1.0);
    }

    #[tokio::test]
    async fn halt_invariant_crosses_target_deterministically() {
        let ledger = ledger();
        ledger.init_day_if_needed(1000.0, 1.0).await.unwrap();

        let status = ledger.increment(10.0).await.unwrap();
        assert!(status.target_reached());
        assert!(!ledger.is_halted().await.unwrap());

        ledger.set_halted(true).await.unwrap();
        assert!(ledger.is_halted().await.unwrap());
    }

    #[tokio::test]
    async fn reset_day_overwrites_fields() {
        let ledger = ledger();
        ledger.init_day_if_needed(1000.0, 1.0).await.unwrap();
        ledger.increment(50.0).await.unwrap();
        ledger.set_halted(true).await.unwrap();

        ledger.reset_day(2000.0, 2.0).await.unwrap();
        let status = ledger.status().await.unwrap();
        assert_eq!(status.start_equity, 2000.0);
        assert_eq!(status.realized, 0.0);
        assert!(!status.halted);
    }
}
