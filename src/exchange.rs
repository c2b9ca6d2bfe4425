//! Exchange adapters: the single polymorphism point between the executor
//! and the outside world. See spec §4.6 and §9 ("Adapter polymorphism").
//!
//! `Binance`/`Coinbase` are out of scope per spec §1 ("exchange adapter
//! implementations") — they exist so `EXCHANGE` selects a real variant, not
//! because they place real orders.

use async_trait::async_trait;

use crate::schemas::Side;

/// Outcome of placing an order against an exchange.
#[derive(Debug, Clone)]
pub struct Fill {
    pub filled: bool,
    pub price: Option<f64>,
    pub fee: Option<f64>,
    pub notional: Option<f64>,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place_order(&self, symbol: &str, side: Side, qty: f64) -> anyhow::Result<Fill>;
}

/// Always fills at a configured price with configured fee. The only adapter
/// this crate actually executes against.
pub struct Paper {
    pub default_price: f64,
    pub default_fee: f64,
}

#[async_trait]
impl ExchangeAdapter for Paper {
    async fn place_order(&self, _symbol: &str, _side: Side, qty: f64) -> anyhow::Result<Fill> {
        Ok(Fill {
            filled: true,
            price: Some(self.default_price),
            fee: Some(self.default_fee),
            notional: Some(self.default_price * qty),
        })
    }
}

pub struct Binance;

#[async_trait]
impl ExchangeAdapter for Binance {
    async fn place_order(&self, _symbol: &str, _side: Side, _qty: f64) -> anyhow::Result<Fill> {
        Err(anyhow::anyhow!("binance connectivity is out of scope for this deployment"))
    }
}

pub struct Coinbase;

#[async_trait]
impl ExchangeAdapter for Coinbase {
    async fn place_order(&self, _symbol: &str, _side: Side, _qty: f64) -> anyhow::Result<Fill> {
        Err(anyhow::anyhow!("coinbase connectivity is out of scope for this deployment"))
    }
}

pub fn build(exchange: crate::config::Exchange, default_price: f64, default_fee: f64) -> Box<dyn ExchangeAdapter> {
    match exchange {
        crate::config::Exchange::Paper => Box::new(Paper {
            default_price,
            default_fee,
        }),
        crate::config::Exchange::Binance => Box::new(Binance),
        crate::config::Exchange::Coinbase => Box::new(Coinbase),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paper_adapter_always_fills_at_configured_price() {
        let adapter = Paper {
            default_price: 100.0,
            default_fee: 1.5,
        };
        let fill = adapter.place_order("BTC-USD", Side::Buy, 2.0).await.unwrap();
        assert!(fill.filled);
        assert_eq!(fill.price, Some(100.0));
        assert_eq!(fill.fee, Some(1.5));
        assert_eq!(fill.notional, Some(200.0));
    }
}
