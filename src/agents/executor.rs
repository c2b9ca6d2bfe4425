//! Trade Executor: accepts orders, forwards them to the configured exchange
//! adapter, and reconciles stale orders. See spec §4.6.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerOps;
use crate::exchange::ExchangeAdapter;
use crate::schemas::{self, groups, streams, ExecStatus, NotifyEvent, OrderState, OrderStatus, Severity};
use crate::stream_runtime::{ConsumerConfig, Handler};

fn order_key(order_id: &str) -> String {
    format!("exec:orders:{order_id}")
}

async fn load_order_state(broker: &Arc<dyn BrokerOps>, order_id: &str) -> anyhow::Result<Option<OrderState>> {
    let map = broker.hash_get_all(&order_key(order_id)).await?;
    match map.get("state") {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

async fn save_order_state(broker: &Arc<dyn BrokerOps>, state: &OrderState) -> anyhow::Result<()> {
    let raw = serde_json::to_string(state)?;
    broker.hash_set(&order_key(&state.order_id), &[("state", raw)]).await
}

pub fn handler(broker: Arc<dyn BrokerOps>, adapter: Arc<dyn ExchangeAdapter>, profit_per_trade: f64) -> Handler {
    Arc::new(move |entry| {
        let broker = broker.clone();
        let adapter = adapter.clone();
        Box::pin(async move {
            let order: schemas::Order = serde_json::from_value(entry.payload)?;

            if let Some(existing) = load_order_state(&broker, &order.order_id).await? {
                if existing.last_status.as_ref().map(|s| s.status.is_terminal()).unwrap_or(false) {
                    info!(order_id = %order.order_id, "duplicate order delivery, already terminal, skipping");
                    return Ok(());
                }
            }

            let initial = OrderState {
                order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.qty,
                received_ts: Utc::now(),
                last_status: None,
                stale_notified: false,
            };
            save_order_state(&broker, &initial).await?;

            let fill = adapter.place_order(&order.symbol, order.side, order.qty).await?;

            let status = if fill.filled {
                ExecStatus {
                    order_id: order.order_id.clone(),
                    status: OrderStatus::Filled,
                    symbol: Some(order.symbol.clone()),
                    side: Some(order.side),
                    qty: Some(order.qty),
                    profit: Some(profit_per_trade - fill.fee.unwrap_or(0.0)),
                    fee: fill.fee,
                    price: fill.price,
                    trace_id: order.trace_id.clone(),
                    ts: schemas::now_iso(),
                }
            } else {
                ExecStatus {
                    order_id: order.order_id.clone(),
                    status: OrderStatus::Rejected,
                    symbol: Some(order.symbol.clone()),
                    side: Some(order.side),
                    qty: Some(order.qty),
                    profit: None,
                    fee: fill.fee,
                    price: fill.price,
                    trace_id: order.trace_id.clone(),
                    ts: schemas::now_iso(),
                }
            };

            let mut persisted = initial;
            persisted.last_status = Some(status.clone());
            save_order_state(&broker, &persisted).await?;

            broker
                .append(streams::EXEC_STATUS, &serde_json::to_value(&status)?)
                .await?;
            info!(order_id = %order.order_id, status = ?status.status, "order processed");
            Ok(())
        })
    })
}

/// Place an order and compose its status directly, without touching
/// `exec:orders:*` state or streams. Used by the orchestrator's `http`
/// pipeline mode, which has no redelivery to guard against.
pub async fn simulate_fill(
    adapter: &Arc<dyn ExchangeAdapter>,
    order_id: &str,
    symbol: &str,
    side: crate::schemas::Side,
    qty: f64,
    trace_id: &str,
    profit_per_trade: f64,
) -> anyhow::Result<ExecStatus> {
    let fill = adapter.place_order(symbol, side, qty).await?;
    Ok(if fill.filled {
        ExecStatus {
            order_id: order_id.to_string(),
            status: OrderStatus::Filled,
            symbol: Some(symbol.to_string()),
            side: Some(side),
            qty: Some(qty),
            profit: Some(profit_per_trade - fill.fee.unwrap_or(0.0)),
            fee: fill.fee,
            price: fill.price,
            trace_id: trace_id.to_string(),
            ts: schemas::now_iso(),
        }
    } else {
        ExecStatus {
            order_id: order_id.to_string(),
            status: OrderStatus::Rejected,
            symbol: Some(symbol.to_string()),
            side: Some(side),
            qty: Some(qty),
            profit: None,
            fee: fill.fee,
            price: fill.price,
            trace_id: trace_id.to_string(),
            ts: schemas::now_iso(),
        }
    })
}

pub async fn run(
    broker: Arc<dyn BrokerOps>,
    adapter: Arc<dyn ExchangeAdapter>,
    profit_per_trade: f64,
    idemp_ttl: Duration,
    max_failures: u32,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let key_fn: crate::stream_runtime::KeyFn = Arc::new(|payload| {
        payload.get("orderId").and_then(|v| v.as_str()).map(|s| s.to_string())
    });
    let cfg = ConsumerConfig::new(streams::EXEC_ORDERS, groups::EXEC)
        .with_idempotency(key_fn, idemp_ttl)
        .with_dlq(schemas::streams::dlq_of(streams::EXEC_ORDERS))
        .with_max_failures(max_failures);
    crate::stream_runtime::run_consumer(broker.clone(), cfg, handler(broker, adapter, profit_per_trade), cancel).await
}

/// Scan `exec:orders:*` for orders stuck non-terminal past `stale_after`,
/// notify once, and mark them so the notification doesn't repeat.
pub async fn reconcile_once(broker: &Arc<dyn BrokerOps>, stale_after: chrono::Duration) -> anyhow::Result<usize> {
    let keys = broker.scan_keys("exec:orders:*").await?;
    let mut notified = 0;
    let now = Utc::now();

    for key in keys {
        let map = broker.hash_get_all(&key).await?;
        let Some(raw) = map.get("state") else { continue };
        let Ok(mut state): Result<OrderState, _> = serde_json::from_str(raw) else {
            continue;
        };

        let is_terminal = state.last_status.as_ref().map(|s| s.status.is_terminal()).unwrap_or(false);
        if is_terminal || state.stale_notified {
            continue;
        }
        if now - state.received_ts < stale_after {
            continue;
        }

        let event = NotifyEvent {
            kind: "exec_order_stale".to_string(),
            severity: Severity::Warning,
            message: Some(format!("order {} has been pending since {}", state.order_id, state.received_ts)),
            context: Some(serde_json::json!({"orderId": state.order_id, "symbol": state.symbol})),
            request_id: None,
            trace_id: None,
            ts: schemas::now_iso(),
        };
        broker
            .append(streams::NOTIFY_EVENTS, &serde_json::to_value(&event)?)
            .await?;

        state.stale_notified = true;
        save_order_state(broker, &state).await?;
        notified += 1;
        warn!(order_id = %state.order_id, "order flagged stale");
    }

    Ok(notified)
}

pub async fn run_reconciliation(
    broker: Arc<dyn BrokerOps>,
    stale_after: chrono::Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = reconcile_once(&broker, stale_after).await {
            warn!(error = %e, "reconciliation sweep failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::exchange::Paper;
    use crate::schemas::Side;

    #[tokio::test]
    async fn terminal_orders_are_skipped_on_redelivery() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(Paper {
            default_price: 100.0,
            default_fee: 0.0,
        });
        let h = handler(broker.clone(), adapter, 10.0);

        let order = schemas::Order {
            order_id: "o1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: Side::Buy,
            qty: 1.0,
            trace_id: "t1".to_string(),
            ts: schemas::now_iso(),
        };
        let payload = serde_json::to_value(&order).unwrap();

        let entry1 = crate::broker::Entry {
            id: "1-0".to_string(),
            payload: payload.clone(),
        };
        h(entry1).await.unwrap();

        let statuses_before = broker.range(streams::EXEC_STATUS, "-", "+", 50).await.unwrap();
        assert_eq!(statuses_before.len(), 1);

        let entry2 = crate::broker::Entry {
            id: "2-0".to_string(),
            payload,
        };
        h(entry2).await.unwrap();

        let statuses_after = broker.range(streams::EXEC_STATUS, "-", "+", 50).await.unwrap();
        assert_eq!(statuses_after.len(), 1, "redelivery must not double-submit a fill");
    }

    #[tokio::test]
    async fn reconcile_flags_stale_orders_exactly_once() {
        let broker: Arc<dyn BrokerOps> = Arc::new(FakeBroker::new());
        let state = OrderState {
            order_id: "o2".to_string(),
            symbol: "ETH-USD".to_string(),
            side: Side::Sell,
            qty: 2.0,
            received_ts: Utc::now() - chrono::Duration::seconds(200),
            last_status: None,
            stale_notified: false,
        };
        save_order_state(&broker, &state).await.unwrap();

        let notified = reconcile_once(&broker, chrono::Duration::seconds(120)).await.unwrap();
        assert_eq!(notified, 1);

        let notified_again = reconcile_once(&broker, chrono::Duration::seconds(120)).await.unwrap();
        assert_eq!(notified_again, 0, "stale_notified must suppress repeat notifications");
    }
}
