// ===============================
// src/gateway.rs (order gateways + mock venues)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::{sleep, Duration}};
use tracing::{debug, warn};

use crate::domain::{MakerFill, MarketEvent, Quote, Side};
use crate::error::{ApiError, OrderError};

/// Fresh client order id (venue limit is 36 chars).
pub fn client_order_id() -> String {
    format!("xv-{}-{}", Utc::now().timestamp_millis(), rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerOrder {
    pub side: Side,
    pub qty: Decimal,
    /// `None` sends a market order
    pub price: Option<Decimal>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl MakerOrder {
    pub fn market(side: Side, qty: Decimal, reduce_only: bool) -> Self {
        Self { side, qty, price: None, post_only: false, reduce_only, client_order_id: None }
    }

    pub fn post_only(side: Side, qty: Decimal, price: Decimal, reduce_only: bool) -> Self {
        Self { side, qty, price: Some(price), post_only: true, reduce_only, client_order_id: None }
    }

    pub fn with_client_order_id(mut self, id: String) -> Self {
        self.client_order_id = Some(id);
        self
    }

    /// Supplied id, or a freshly generated one.
    pub fn resolve_client_order_id(&self) -> String {
        self.client_order_id.clone().unwrap_or_else(client_order_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakerOrder {
    pub quote_id: String,
    pub side: Side,
    pub is_reduce_only: bool,
    pub max_slippage: Decimal,
}

/// Taker venue response; the payload is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakerAck {
    pub order_ref: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakerPosition {
    pub instrument: String,
    pub qty: Decimal,
    pub avg_entry_price: Option<Decimal>,
}

#[async_trait]
pub trait MakerGateway: Send + Sync {
    /// Returns the client order id the venue accepted.
    async fn place_order(&self, order: MakerOrder) -> Result<String, OrderError>;
    async fn cancel_order(&self, client_order_id: &str) -> Result<(), OrderError>;
}

#[async_trait]
pub trait TakerGateway: Send + Sync {
    async fn fetch_quote(&self, qty: Decimal) -> Result<Quote, ApiError>;
    async fn place_market_order(&self, order: TakerOrder) -> Result<TakerAck, OrderError>;
    async fn positions(&self) -> Result<Vec<TakerPosition>, ApiError>;
}

// -----------------------------------------------------------------------------
// Mock maker venue: ACK after latency; market orders fill at once, resting
// orders fill after `fill_ms` unless cancelled first.
// -----------------------------------------------------------------------------
pub struct MockMaker {
    latency: Duration,
    fill_after: Duration,
    events_tx: mpsc::Sender<MarketEvent>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl MockMaker {
    pub fn new(events_tx: mpsc::Sender<MarketEvent>, latency_ms: u64, fill_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            fill_after: Duration::from_millis(fill_ms),
            events_tx,
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl MakerGateway for MockMaker {
    async fn place_order(&self, order: MakerOrder) -> Result<String, OrderError> {
        let cl_id = order.resolve_client_order_id();
        sleep(self.latency).await;

        let fill = MakerFill {
            qty: order.qty,
            is_buyer: order.side == Side::Buy,
            client_order_id: cl_id.clone(),
            price: order.price,
            cumulative_qty: Some(order.qty),
        };
        match order.price {
            None => {
                let _ = self.events_tx.send(MarketEvent::MakerFill(fill)).await;
            }
            Some(_) => {
                self.open.lock().insert(cl_id.clone());
                let open = self.open.clone();
                let tx = self.events_tx.clone();
                let fill_after = self.fill_after;
                tokio::spawn(async move {
                    sleep(fill_after).await;
                    // only fills if nobody cancelled it meanwhile
                    if open.lock().remove(&fill.client_order_id) {
                        let _ = tx.send(MarketEvent::MakerFill(fill)).await;
                    }
                });
            }
        }
        debug!(%cl_id, side = order.side.as_str(), qty = %order.qty, "mock maker ACK");
        Ok(cl_id)
    }

    async fn cancel_order(&self, client_order_id: &str) -> Result<(), OrderError> {
        sleep(self.latency).await;
        if self.open.lock().remove(client_order_id) {
            Ok(())
        } else {
            Err(OrderError::Rejected(format!("unknown order {client_order_id}")))
        }
    }
}

// -----------------------------------------------------------------------------
// Mock taker venue: random-walk quotes around 100.00 and instant market fills.
// -----------------------------------------------------------------------------
pub struct MockTaker {
    latency: Duration,
    mid: Mutex<Decimal>,
    seq: AtomicU64,
    /// qty of the most recent quote; a market order executes that size
    quoted_qty: Mutex<Decimal>,
    position: Mutex<Decimal>,
}

impl MockTaker {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            mid: Mutex::new(Decimal::new(100_00, 2)),
            seq: AtomicU64::new(0),
            quoted_qty: Mutex::new(Decimal::ZERO),
            position: Mutex::new(Decimal::ZERO),
        }
    }
}

#[async_trait]
impl TakerGateway for MockTaker {
    async fn fetch_quote(&self, qty: Decimal) -> Result<Quote, ApiError> {
        if qty <= Decimal::ZERO {
            return Err(ApiError::Validation(format!("qty must be positive, got {qty}")));
        }
        sleep(self.latency).await;
        let step = Decimal::new(rand::thread_rng().gen_range(-3..=3), 2);
        let mid = {
            let mut m = self.mid.lock();
            *m = (*m + step).max(Decimal::new(50_00, 2));
            *m
        };
        *self.quoted_qty.lock() = qty;
        let half = Decimal::new(1, 2);
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(Quote { bid: mid - half, ask: mid + half, quote_id: format!("mock-{n}"), mark_price: Some(mid), index_price: None })
    }

    async fn place_market_order(&self, order: TakerOrder) -> Result<TakerAck, OrderError> {
        sleep(self.latency).await;
        if order.quote_id.is_empty() {
            warn!("mock taker: empty quote id");
            return Err(OrderError::MissingQuote);
        }
        let qty = *self.quoted_qty.lock();
        {
            let mut pos = self.position.lock();
            *pos += if order.side == Side::Buy { qty } else { -qty };
        }
        Ok(TakerAck {
            order_ref: order.quote_id.clone(),
            payload: serde_json::json!({ "status": "filled", "side": order.side.as_str() }),
        })
    }

    async fn positions(&self) -> Result<Vec<TakerPosition>, ApiError> {
        let mid = *self.mid.lock();
        Ok(vec![TakerPosition { instrument: "mock".into(), qty: *self.position.lock(), avg_entry_price: Some(mid) }])
    }
}
