// ===============================
// src/coordinator.rs
// ===============================
//
// Execution coordinator. One `tokio::sync::Mutex<Book>` is the execution guard:
// - evaluation ticks (`try_entry` / `try_exit` / `evaluate`) only `try_lock` it
//   and give up with `Skipped(Busy)` when another execution holds it;
// - maker fills and shutdown wait for it, a fill is never skipped.
//
// Cheap checks (state, gap) run first against the published `PositionView` and
// the price snapshot; both are re-validated once the guard is held.
// `Entering` / `Exiting` only exist while the guard is held and are never
// published.
//
// An unbalanced result (one leg filled, the other failed) halts further entries
// and exits until `acknowledge_unbalanced()`. Fills keep being hedged.
//
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ExecutionMode, TradeConfig};
use crate::domain::{
    ActiveOrder, BookTop, Direction, DualLegReport, Event, MakerFill, PositionState, PositionView, Quote, Side,
    UnbalancedReport, Venue,
};
use crate::error::{ExecutionError, OrderError};
use crate::gateway::{client_order_id, MakerGateway, MakerOrder, TakerAck, TakerGateway, TakerOrder};
use crate::metrics::{
    EXECUTIONS, GAP, HALTED, MAKER_FILLS, PNL_REALIZED, PNL_UNREALIZED, POSITION_STATE, RESTING_ORDERS,
    TICKS_SKIPPED, UNBALANCED,
};
use crate::state::{Book, PriceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    WrongState,
    NoSignal,
    InsufficientData,
    Busy,
    Halted,
    ShuttingDown,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::WrongState => "wrong_state",
            SkipReason::NoSignal => "no_signal",
            SkipReason::InsufficientData => "insufficient_data",
            SkipReason::Busy => "busy",
            SkipReason::Halted => "halted",
            SkipReason::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Entered(DualLegReport),
    Exited(DualLegReport),
    /// resting maker order posted
    Placed(ActiveOrder),
    /// resting maker order moved to the new touch
    Replaced(ActiveOrder),
    /// resting maker order pulled: signal gone or wrong direction (client order id)
    Cancelled(String),
    /// resting maker order already at the right price
    Held,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Hedged(DualLegReport),
    Ignored(&'static str),
}

/// Joined result of the two legs of one execution.
#[derive(Debug)]
pub enum LegOutcome {
    Both { maker_id: String, taker: TakerAck },
    MakerOnly { maker_id: String, taker_err: OrderError },
    TakerOnly { taker: TakerAck, maker_err: OrderError },
    Neither { maker_err: OrderError, taker_err: OrderError },
}

pub fn resolve_legs(maker: Result<String, OrderError>, taker: Result<TakerAck, OrderError>) -> LegOutcome {
    match (maker, taker) {
        (Ok(maker_id), Ok(taker)) => LegOutcome::Both { maker_id, taker },
        (Ok(maker_id), Err(taker_err)) => LegOutcome::MakerOnly { maker_id, taker_err },
        (Err(maker_err), Ok(taker)) => LegOutcome::TakerOnly { taker, maker_err },
        (Err(maker_err), Err(taker_err)) => LegOutcome::Neither { maker_err, taker_err },
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T, OrderError>>) -> Result<T, OrderError> {
    tokio::time::timeout(limit, fut).await.unwrap_or(Err(OrderError::Timeout(limit)))
}

// Price a market order executes against: sells hit the bid, buys lift the ask.
fn touch(prices: &PriceSnapshot, venue: Venue, side: Side) -> Option<Decimal> {
    match (venue, side) {
        (Venue::Maker, Side::Sell) => prices.maker_bid,
        (Venue::Maker, Side::Buy) => prices.maker_ask,
        (Venue::Taker, Side::Buy) => prices.taker_ask,
        (Venue::Taker, Side::Sell) => prices.taker_bid,
    }
}

fn book_leg(book: &mut Book, venue: Venue, side: Side, qty: Decimal, px: Option<Decimal>) {
    match px {
        Some(px) => book.ledger.on_fill(venue, side, qty, px),
        None => warn!(venue = venue.as_str(), side = side.as_str(), %qty, "no price for leg, PnL not booked"),
    }
}

// A maker order the venue refused will never report fills. A timed-out one still might.
fn forget_rejected(book: &mut Book, cl_id: &str, maker_err: &OrderError) {
    if !matches!(maker_err, OrderError::Timeout(_)) {
        book.own_orders.remove(cl_id);
    }
}

fn state_code(s: PositionState) -> i64 {
    match s {
        PositionState::Flat => 0,
        PositionState::Entering => 1,
        PositionState::InPosition => 2,
        PositionState::Exiting => 3,
    }
}

pub struct Coordinator {
    maker: Arc<dyn MakerGateway>,
    taker: Arc<dyn TakerGateway>,
    cfg: TradeConfig,
    prices: RwLock<PriceSnapshot>,
    book: Mutex<Book>,
    view_tx: watch::Sender<PositionView>,
    halted: AtomicBool,
    stopping: AtomicBool,
    recorder: Option<mpsc::Sender<Event>>,
}

impl Coordinator {
    pub fn new(maker: Arc<dyn MakerGateway>, taker: Arc<dyn TakerGateway>, cfg: TradeConfig) -> Self {
        let (view_tx, _) = watch::channel(PositionView::default());
        Self {
            maker,
            taker,
            cfg,
            prices: RwLock::new(PriceSnapshot::default()),
            book: Mutex::new(Book::default()),
            view_tx,
            halted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    // ---------------------------------------------------------------------
    // Price state
    // ---------------------------------------------------------------------

    /// Returns true when the maker top of book changed (worth an evaluation).
    pub fn update_maker_book(&self, top: BookTop) -> bool {
        let changed = self.prices.write().apply_maker(top);
        if changed {
            self.observe_prices();
        }
        changed
    }

    pub fn update_taker_quote(&self, quote: Quote) {
        self.prices.write().apply_taker(quote);
        self.observe_prices();
    }

    fn observe_prices(&self) {
        let p = self.prices.read().clone();
        let (entry, exit) = (p.entry_gap(), p.exit_gap());
        if let Some(g) = entry.and_then(|g| g.to_f64()) {
            GAP.with_label_values(&["entry"]).set(g);
        }
        if let Some(g) = exit.and_then(|g| g.to_f64()) {
            GAP.with_label_values(&["exit"]).set(g);
        }
        self.record(Event::Prices {
            ts: Utc::now(),
            maker_bid: p.maker_bid,
            maker_ask: p.maker_ask,
            taker_bid: p.taker_bid,
            taker_ask: p.taker_ask,
            taker_spread: p.taker_quote.as_ref().map(Quote::spread),
            entry_gap: entry,
            exit_gap: exit,
        });
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    pub fn snapshot(&self) -> PositionView { self.view_tx.borrow().clone() }

    pub fn subscribe(&self) -> watch::Receiver<PositionView> { self.view_tx.subscribe() }

    pub fn is_halted(&self) -> bool { self.halted.load(Ordering::Acquire) }

    /// Re-publishes the view with fresh unrealized PnL unless an execution is running.
    pub fn mark_to_market(&self) {
        if let Ok(book) = self.book.try_lock() {
            self.publish(&book);
        }
    }

    fn publish(&self, book: &Book) {
        let view = {
            let p = self.prices.read();
            book.view(&p)
        };
        POSITION_STATE.set(state_code(view.state));
        PNL_REALIZED.set(view.realized_pnl.to_f64().unwrap_or(0.0));
        PNL_UNREALIZED.set(view.unrealized_pnl.and_then(|u| u.to_f64()).unwrap_or(0.0));
        self.view_tx.send_replace(view);
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            // recorder lagging: drop rather than stall trading
            let _ = tx.try_send(ev);
        }
    }

    // ---------------------------------------------------------------------
    // Ticks
    // ---------------------------------------------------------------------

    pub async fn try_entry(&self) -> Result<TickOutcome, ExecutionError> {
        self.tick(Direction::Entry).await
    }

    pub async fn try_exit(&self) -> Result<TickOutcome, ExecutionError> {
        self.tick(Direction::Exit).await
    }

    /// Exit when holding a position, otherwise look for an entry.
    pub async fn evaluate(&self) -> Result<TickOutcome, ExecutionError> {
        let state = self.view_tx.borrow().state;
        if state == PositionState::InPosition {
            self.try_exit().await
        } else {
            self.try_entry().await
        }
    }

    async fn tick(&self, dir: Direction) -> Result<TickOutcome, ExecutionError> {
        let res = self.tick_guarded(dir).await;
        if let Ok(TickOutcome::Skipped(reason)) = &res {
            TICKS_SKIPPED.with_label_values(&[reason.as_str()]).inc();
        }
        res
    }

    fn gate(&self) -> Option<SkipReason> {
        if self.stopping.load(Ordering::Acquire) {
            Some(SkipReason::ShuttingDown)
        } else if self.halted.load(Ordering::Acquire) {
            Some(SkipReason::Halted)
        } else {
            None
        }
    }

    fn check_signal(&self, dir: Direction, prices: &PriceSnapshot) -> Result<(), SkipReason> {
        let (gap, threshold) = match dir {
            Direction::Entry => (prices.entry_gap(), self.cfg.open_threshold),
            Direction::Exit => (prices.exit_gap(), self.cfg.close_threshold),
        };
        match gap {
            None => Err(SkipReason::InsufficientData),
            Some(g) if g <= threshold => Err(SkipReason::NoSignal),
            Some(_) => Ok(()),
        }
    }

    async fn tick_guarded(&self, dir: Direction) -> Result<TickOutcome, ExecutionError> {
        if let Some(reason) = self.gate() {
            return Ok(TickOutcome::Skipped(reason));
        }
        let required = match dir {
            Direction::Entry => PositionState::Flat,
            Direction::Exit => PositionState::InPosition,
        };
        let (state, has_order) = {
            let v = self.view_tx.borrow();
            (v.state, v.active_order.is_some())
        };
        if state != required {
            return Ok(TickOutcome::Skipped(SkipReason::WrongState));
        }
        let resting = self.cfg.mode == ExecutionMode::Resting;
        let signal = {
            let p = self.prices.read();
            self.check_signal(dir, &p)
        };
        if let Err(reason) = signal {
            // a resting order must still be managed when the signal fades
            if !(resting && has_order) {
                return Ok(TickOutcome::Skipped(reason));
            }
        }

        let Ok(mut book) = self.book.try_lock() else {
            return Ok(TickOutcome::Skipped(SkipReason::Busy));
        };
        if let Some(reason) = self.gate() {
            return Ok(TickOutcome::Skipped(reason));
        }
        if book.state != required {
            return Ok(TickOutcome::Skipped(SkipReason::WrongState));
        }

        let res = if resting {
            self.work_resting(&mut book, dir).await
        } else {
            self.execute_dual_leg(&mut book, dir).await
        };
        self.publish(&book);
        res
    }

    // ---------------------------------------------------------------------
    // Market mode: both legs at once
    // ---------------------------------------------------------------------

    async fn execute_dual_leg(&self, book: &mut Book, dir: Direction) -> Result<TickOutcome, ExecutionError> {
        let prices = self.prices.read().clone();
        if let Err(reason) = self.check_signal(dir, &prices) {
            return Ok(TickOutcome::Skipped(reason));
        }
        let Some(quote) = prices.taker_quote.clone() else {
            return Ok(TickOutcome::Skipped(SkipReason::InsufficientData));
        };
        let qty = match dir {
            Direction::Entry => self.cfg.order_amount,
            Direction::Exit => book.qty,
        };
        if qty <= Decimal::ZERO {
            return Ok(TickOutcome::Skipped(SkipReason::WrongState));
        }
        let (idle, working) = match dir {
            Direction::Entry => (PositionState::Flat, PositionState::Entering),
            Direction::Exit => (PositionState::InPosition, PositionState::Exiting),
        };

        let cl_id = client_order_id();
        book.track_own_order(cl_id.clone(), qty);
        book.state = working;
        info!(
            direction = dir.as_str(), %qty, quote_id = %quote.quote_id,
            entry_gap = ?prices.entry_gap(), exit_gap = ?prices.exit_gap(),
            "dual leg: sending"
        );

        let maker_order = MakerOrder::market(dir.maker_side(), qty, dir.reduce_only()).with_client_order_id(cl_id.clone());
        let taker_order = TakerOrder {
            quote_id: quote.quote_id.clone(),
            side: dir.taker_side(),
            is_reduce_only: dir.reduce_only(),
            max_slippage: self.cfg.max_slippage,
        };
        let limit = self.cfg.leg_timeout;
        let (maker_res, taker_res) = tokio::join!(
            bounded(limit, self.maker.place_order(maker_order)),
            bounded(limit, self.taker.place_market_order(taker_order)),
        );

        match resolve_legs(maker_res, taker_res) {
            LegOutcome::Both { maker_id, taker } => {
                book_leg(book, Venue::Maker, dir.maker_side(), qty, touch(&prices, Venue::Maker, dir.maker_side()));
                book_leg(book, Venue::Taker, dir.taker_side(), qty, touch(&prices, Venue::Taker, dir.taker_side()));
                match dir {
                    Direction::Entry => {
                        book.state = PositionState::InPosition;
                        book.qty = qty;
                        book.maker_order_id = Some(maker_id.clone());
                    }
                    Direction::Exit => {
                        book.state = PositionState::Flat;
                        book.qty = Decimal::ZERO;
                        book.maker_order_id = None;
                    }
                }
                let report = DualLegReport {
                    direction: dir,
                    qty,
                    maker_order_id: maker_id,
                    taker_order_id: taker.order_ref,
                    entry_gap: prices.entry_gap(),
                    exit_gap: prices.exit_gap(),
                };
                EXECUTIONS.with_label_values(&[dir.as_str(), "ok"]).inc();
                info!(direction = dir.as_str(), %qty, maker = %report.maker_order_id, taker = %report.taker_order_id, "dual leg: both filled");
                self.record(Event::Execution { ts: Utc::now(), report: report.clone() });
                Ok(match dir {
                    Direction::Entry => TickOutcome::Entered(report),
                    Direction::Exit => TickOutcome::Exited(report),
                })
            }
            LegOutcome::Neither { maker_err, taker_err } => {
                forget_rejected(book, &cl_id, &maker_err);
                book.state = idle;
                EXECUTIONS.with_label_values(&[dir.as_str(), "failed"]).inc();
                Err(ExecutionError::Placement {
                    direction: dir,
                    action: "dual_leg",
                    reason: format!("maker: {maker_err}; taker: {taker_err}"),
                })
            }
            LegOutcome::MakerOnly { maker_id, taker_err } => {
                book_leg(book, Venue::Maker, dir.maker_side(), qty, touch(&prices, Venue::Maker, dir.maker_side()));
                book.state = idle;
                book.maker_order_id = Some(maker_id.clone());
                Err(self.raise_unbalanced(book, UnbalancedReport {
                    direction: dir,
                    filled_venue: Venue::Maker,
                    filled_order_id: maker_id,
                    failed_venue: Venue::Taker,
                    failure: taker_err.to_string(),
                    qty,
                    at: Utc::now(),
                }))
            }
            LegOutcome::TakerOnly { taker, maker_err } => {
                forget_rejected(book, &cl_id, &maker_err);
                book_leg(book, Venue::Taker, dir.taker_side(), qty, touch(&prices, Venue::Taker, dir.taker_side()));
                book.state = idle;
                Err(self.raise_unbalanced(book, UnbalancedReport {
                    direction: dir,
                    filled_venue: Venue::Taker,
                    filled_order_id: taker.order_ref,
                    failed_venue: Venue::Maker,
                    failure: maker_err.to_string(),
                    qty,
                    at: Utc::now(),
                }))
            }
        }
    }

    fn raise_unbalanced(&self, book: &mut Book, report: UnbalancedReport) -> ExecutionError {
        book.unbalanced = Some(report.clone());
        self.halted.store(true, Ordering::Release);
        UNBALANCED.inc();
        HALTED.set(1);
        EXECUTIONS.with_label_values(&[report.direction.as_str(), "unbalanced"]).inc();
        self.record(Event::Unbalanced { ts: Utc::now(), report: report.clone() });
        ExecutionError::Unbalanced(report)
    }

    // ---------------------------------------------------------------------
    // Resting mode: post-only maker order, hedged on fill
    // ---------------------------------------------------------------------

    async fn work_resting(&self, book: &mut Book, dir: Direction) -> Result<TickOutcome, ExecutionError> {
        let prices = self.prices.read().clone();
        let signal = self.check_signal(dir, &prices);
        // entry rests a sell at the maker ask, exit a buy at the maker bid
        let target = match dir {
            Direction::Entry => prices.maker_ask,
            Direction::Exit => prices.maker_bid,
        };
        let limit = self.cfg.leg_timeout;

        let Some(order) = book.active_order.clone() else {
            if let Err(reason) = signal {
                return Ok(TickOutcome::Skipped(reason));
            }
            let Some(px) = target else {
                return Ok(TickOutcome::Skipped(SkipReason::InsufficientData));
            };
            let qty = match dir {
                Direction::Entry => self.cfg.order_amount,
                Direction::Exit => book.qty,
            };
            let request = MakerOrder::post_only(dir.maker_side(), qty, px, dir.reduce_only())
                .with_client_order_id(client_order_id());
            return match bounded(limit, self.maker.place_order(request)).await {
                Ok(id) => {
                    let placed = ActiveOrder {
                        client_order_id: id,
                        side: dir.maker_side(),
                        price: px,
                        qty,
                        reduce_only: dir.reduce_only(),
                        placed_at: Utc::now(),
                    };
                    info!(direction = dir.as_str(), cl_id = %placed.client_order_id, price = %px, %qty, "resting order placed");
                    book.active_order = Some(placed.clone());
                    RESTING_ORDERS.with_label_values(&["placed"]).inc();
                    Ok(TickOutcome::Placed(placed))
                }
                Err(e) => {
                    RESTING_ORDERS.with_label_values(&["place_failed"]).inc();
                    Err(ExecutionError::Placement { direction: dir, action: "place", reason: e.to_string() })
                }
            };
        };

        if order.side != dir.maker_side() {
            self.cancel_resting(dir, &order.client_order_id).await?;
            book.active_order = None;
            RESTING_ORDERS.with_label_values(&["cancelled"]).inc();
            warn!(direction = dir.as_str(), cl_id = %order.client_order_id, side = order.side.as_str(), "resting order from the other direction cancelled");
            return Ok(TickOutcome::Cancelled(order.client_order_id));
        }

        if signal.is_err() {
            self.cancel_resting(dir, &order.client_order_id).await?;
            book.active_order = None;
            RESTING_ORDERS.with_label_values(&["cancelled"]).inc();
            info!(direction = dir.as_str(), cl_id = %order.client_order_id, "signal gone, resting order cancelled");
            return Ok(TickOutcome::Cancelled(order.client_order_id));
        }

        match target {
            Some(px) if px != order.price => {
                self.cancel_resting(dir, &order.client_order_id).await?;
                let request = MakerOrder::post_only(order.side, order.qty, px, order.reduce_only)
                    .with_client_order_id(client_order_id());
                match bounded(limit, self.maker.place_order(request)).await {
                    Ok(id) => {
                        debug!(old = %order.client_order_id, new = %id, from = %order.price, to = %px, "resting order replaced");
                        let replaced = ActiveOrder { client_order_id: id, price: px, placed_at: Utc::now(), ..order };
                        book.active_order = Some(replaced.clone());
                        RESTING_ORDERS.with_label_values(&["replaced"]).inc();
                        Ok(TickOutcome::Replaced(replaced))
                    }
                    Err(e) => {
                        // old order is gone and the new one never made it
                        book.active_order = None;
                        RESTING_ORDERS.with_label_values(&["replace_failed"]).inc();
                        Err(ExecutionError::Placement { direction: dir, action: "replace", reason: e.to_string() })
                    }
                }
            }
            _ => Ok(TickOutcome::Held),
        }
    }

    // On failure the order is still live as far as we know; the caller keeps tracking it.
    async fn cancel_resting(&self, dir: Direction, cl_id: &str) -> Result<(), ExecutionError> {
        bounded(self.cfg.leg_timeout, self.maker.cancel_order(cl_id)).await.map_err(|e| {
            RESTING_ORDERS.with_label_values(&["cancel_failed"]).inc();
            ExecutionError::Placement { direction: dir, action: "cancel", reason: e.to_string() }
        })
    }

    // ---------------------------------------------------------------------
    // Fill reconciliation
    // ---------------------------------------------------------------------

    /// Hedges a maker fill on the taker venue. Waits for the execution guard.
    pub async fn on_maker_fill(&self, fill: MakerFill) -> Result<FillOutcome, ExecutionError> {
        if fill.qty <= Decimal::ZERO {
            return Ok(FillOutcome::Ignored("non_positive_qty"));
        }
        let mut book = self.book.lock().await;
        let res = self.hedge_fill(&mut book, fill).await;
        self.publish(&book);
        res
    }

    async fn hedge_fill(&self, book: &mut Book, fill: MakerFill) -> Result<FillOutcome, ExecutionError> {
        if book.settle_own_fill(&fill.client_order_id, fill.qty) {
            debug!(cl_id = %fill.client_order_id, qty = %fill.qty, "fill of a dual-leg order, already hedged");
            return Ok(FillOutcome::Ignored("dual_leg_order"));
        }
        let (maker_side, dir) = if fill.is_buyer {
            (Side::Buy, Direction::Exit)
        } else {
            (Side::Sell, Direction::Entry)
        };
        let taker_side = maker_side.opposite();
        MAKER_FILLS.with_label_values(&[maker_side.as_str()]).inc();

        let prices = self.prices.read().clone();
        book_leg(book, Venue::Maker, maker_side, fill.qty, fill.price.or_else(|| touch(&prices, Venue::Maker, maker_side)));

        // first fill of the working order: stop tracking it, pull what is left
        let mut remainder = None;
        if book.active_order.as_ref().is_some_and(|o| o.client_order_id == fill.client_order_id) {
            if let Some(order) = book.active_order.take() {
                if fill.cumulative_qty.unwrap_or(fill.qty) < order.qty {
                    remainder = Some(order.client_order_id);
                }
            }
        }

        let prev = book.state;
        book.state = match dir {
            Direction::Entry => PositionState::Entering,
            Direction::Exit => PositionState::Exiting,
        };
        let hedge = bounded(self.cfg.leg_timeout, async {
            let quote = self.taker.fetch_quote(fill.qty).await?;
            let ack = self
                .taker
                .place_market_order(TakerOrder {
                    quote_id: quote.quote_id.clone(),
                    side: taker_side,
                    is_reduce_only: dir.reduce_only(),
                    max_slippage: self.cfg.max_slippage,
                })
                .await?;
            Ok::<_, OrderError>((quote, ack))
        })
        .await;

        let outcome = match hedge {
            Ok((quote, ack)) => {
                let taker_px = match taker_side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                book_leg(book, Venue::Taker, taker_side, fill.qty, Some(taker_px));
                match dir {
                    Direction::Entry => {
                        book.qty += fill.qty;
                        book.state = PositionState::InPosition;
                        book.maker_order_id = Some(fill.client_order_id.clone());
                    }
                    Direction::Exit => {
                        book.qty = (book.qty - fill.qty).max(Decimal::ZERO);
                        if book.qty.is_zero() {
                            book.state = PositionState::Flat;
                            book.maker_order_id = None;
                        } else {
                            book.state = PositionState::InPosition;
                        }
                    }
                }
                let report = DualLegReport {
                    direction: dir,
                    qty: fill.qty,
                    maker_order_id: fill.client_order_id.clone(),
                    taker_order_id: ack.order_ref,
                    entry_gap: prices.entry_gap(),
                    exit_gap: prices.exit_gap(),
                };
                EXECUTIONS.with_label_values(&[dir.as_str(), "hedged"]).inc();
                info!(direction = dir.as_str(), qty = %fill.qty, maker = %report.maker_order_id, taker = %report.taker_order_id, "maker fill hedged");
                self.record(Event::Execution { ts: Utc::now(), report: report.clone() });
                Ok(FillOutcome::Hedged(report))
            }
            Err(e) => {
                book.state = prev;
                Err(self.raise_unbalanced(book, UnbalancedReport {
                    direction: dir,
                    filled_venue: Venue::Maker,
                    filled_order_id: fill.client_order_id.clone(),
                    failed_venue: Venue::Taker,
                    failure: e.to_string(),
                    qty: fill.qty,
                    at: Utc::now(),
                }))
            }
        };

        // an order still resting for the other direction must not outlive the transition
        let next = match book.state {
            PositionState::InPosition => Direction::Exit,
            _ => Direction::Entry,
        };
        if let Some(stale) = book.active_order.clone().filter(|o| o.side != next.maker_side()) {
            match bounded(self.cfg.leg_timeout, self.maker.cancel_order(&stale.client_order_id)).await {
                Ok(()) => {
                    book.active_order = None;
                    RESTING_ORDERS.with_label_values(&["cancelled"]).inc();
                    info!(cl_id = %stale.client_order_id, side = stale.side.as_str(), "stale resting order cancelled after fill");
                }
                Err(e) => warn!(cl_id = %stale.client_order_id, error = %e, "cancel of stale resting order failed, next tick retries"),
            }
        }

        if let Some(cl_id) = remainder {
            match bounded(self.cfg.leg_timeout, self.maker.cancel_order(&cl_id)).await {
                Ok(()) => {
                    RESTING_ORDERS.with_label_values(&["remainder_cancelled"]).inc();
                }
                Err(e) => warn!(%cl_id, error = %e, "cancel of partially filled order failed"),
            }
        }
        outcome
    }

    // ---------------------------------------------------------------------
    // Operator / lifecycle
    // ---------------------------------------------------------------------

    /// Clears the unbalanced alarm after the operator reconciled both venues.
    pub async fn acknowledge_unbalanced(&self) -> Option<UnbalancedReport> {
        let mut book = self.book.lock().await;
        let report = book.unbalanced.take();
        self.halted.store(false, Ordering::Release);
        HALTED.set(0);
        if let Some(r) = &report {
            info!(direction = r.direction.as_str(), filled = r.filled_venue.as_str(), order = %r.filled_order_id, "unbalanced position acknowledged, trading resumes");
        }
        self.publish(&book);
        report
    }

    /// Stops new executions, waits for the one in flight, pulls any resting order.
    pub async fn shutdown(&self) -> PositionView {
        self.stopping.store(true, Ordering::Release);
        let mut book = self.book.lock().await;
        if let Some(order) = book.active_order.take() {
            match bounded(self.cfg.leg_timeout, self.maker.cancel_order(&order.client_order_id)).await {
                Ok(()) => info!(cl_id = %order.client_order_id, "resting order cancelled on shutdown"),
                Err(e) => warn!(cl_id = %order.client_order_id, error = %e, "cancel on shutdown failed, order may still rest"),
            }
        }
        self.publish(&book);
        let view = self.snapshot();
        info!(state = ?view.state, qty = %view.qty, realized = %view.realized_pnl, round_trips = view.round_trips, "coordinator stopped");
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::gateway::TakerPosition;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use tokio::time::sleep;

    #[derive(Default)]
    struct FakeMaker {
        delay: Duration,
        place_results: PlMutex<VecDeque<Result<String, OrderError>>>,
        cancel_results: PlMutex<VecDeque<Result<(), OrderError>>>,
        placed: PlMutex<Vec<MakerOrder>>,
        cancelled: PlMutex<Vec<String>>,
    }

    impl FakeMaker {
        fn slow(ms: u64) -> Self { Self { delay: Duration::from_millis(ms), ..Default::default() } }
        fn push_place(&self, r: Result<String, OrderError>) { self.place_results.lock().push_back(r); }
        fn placed(&self) -> Vec<MakerOrder> { self.placed.lock().clone() }
        fn cancelled(&self) -> Vec<String> { self.cancelled.lock().clone() }
    }

    #[async_trait]
    impl MakerGateway for FakeMaker {
        async fn place_order(&self, order: MakerOrder) -> Result<String, OrderError> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let id = order.resolve_client_order_id();
            self.placed.lock().push(order);
            let scripted = self.place_results.lock().pop_front();
            scripted.unwrap_or(Ok(id))
        }

        async fn cancel_order(&self, client_order_id: &str) -> Result<(), OrderError> {
            self.cancelled.lock().push(client_order_id.to_string());
            let scripted = self.cancel_results.lock().pop_front();
            scripted.unwrap_or(Ok(()))
        }
    }

    #[derive(Default)]
    struct FakeTaker {
        fetch_results: PlMutex<VecDeque<Result<Quote, ApiError>>>,
        place_results: PlMutex<VecDeque<Result<TakerAck, OrderError>>>,
        orders: PlMutex<Vec<TakerOrder>>,
    }

    impl FakeTaker {
        fn push_place(&self, r: Result<TakerAck, OrderError>) { self.place_results.lock().push_back(r); }
        fn orders(&self) -> Vec<TakerOrder> { self.orders.lock().clone() }
    }

    #[async_trait]
    impl TakerGateway for FakeTaker {
        async fn fetch_quote(&self, _qty: Decimal) -> Result<Quote, ApiError> {
            let scripted = self.fetch_results.lock().pop_front();
            scripted.unwrap_or_else(|| Ok(quote(dec!(99.98), dec!(99.99))))
        }

        async fn place_market_order(&self, order: TakerOrder) -> Result<TakerAck, OrderError> {
            let n = {
                let mut orders = self.orders.lock();
                orders.push(order);
                orders.len() - 1
            };
            let scripted = self.place_results.lock().pop_front();
            scripted.unwrap_or_else(|| Ok(TakerAck { order_ref: format!("t-{n}"), payload: serde_json::Value::Null }))
        }

        async fn positions(&self) -> Result<Vec<TakerPosition>, ApiError> { Ok(vec![]) }
    }

    fn quote(bid: Decimal, ask: Decimal) -> Quote {
        Quote { bid, ask, quote_id: "q-1".into(), mark_price: None, index_price: None }
    }

    fn cfg(mode: ExecutionMode) -> TradeConfig {
        TradeConfig {
            open_threshold: dec!(0.00075),
            close_threshold: dec!(-0.00068),
            order_amount: dec!(0.001),
            max_slippage: dec!(0.005),
            mode,
            leg_timeout: Duration::from_secs(1),
        }
    }

    fn setup(mode: ExecutionMode, maker: FakeMaker, taker: FakeTaker) -> (Arc<Coordinator>, Arc<FakeMaker>, Arc<FakeTaker>) {
        let (maker, taker) = (Arc::new(maker), Arc::new(taker));
        let c = Coordinator::new(maker.clone(), taker.clone(), cfg(mode));
        (Arc::new(c), maker, taker)
    }

    // entry gap ~ +0.0011, exit gap ~ -0.0013
    fn entry_prices(c: &Coordinator) {
        c.update_maker_book(BookTop { best_bid: dec!(100.10), best_ask: dec!(100.11) });
        c.update_taker_quote(quote(dec!(99.98), dec!(99.99)));
    }

    // entry gap ~ -0.0001, exit gap ~ -0.0001
    fn exit_prices(c: &Coordinator) {
        c.update_maker_book(BookTop { best_bid: dec!(100.00), best_ask: dec!(100.01) });
        c.update_taker_quote(quote(dec!(100.00), dec!(100.01)));
    }

    fn sell_fill(id: &str, qty: Decimal) -> MakerFill {
        MakerFill { qty, is_buyer: false, client_order_id: id.to_string(), price: Some(dec!(100.11)), cumulative_qty: None }
    }

    // ---- market mode ----

    #[tokio::test(start_paused = true)]
    async fn concurrent_entries_issue_one_dual_leg() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::slow(50), FakeTaker::default());
        entry_prices(&c);

        let (a, b) = tokio::join!(c.try_entry(), c.try_entry());
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, TickOutcome::Entered(_))).count(), 1);
        assert!(outcomes.contains(&TickOutcome::Skipped(SkipReason::Busy)));
        assert_eq!(maker.placed().len(), 1);
        assert_eq!(taker.orders().len(), 1);
        assert_eq!(c.snapshot().state, PositionState::InPosition);
    }

    #[tokio::test]
    async fn no_signal_and_missing_data_do_nothing() {
        let (c, maker, _) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Skipped(SkipReason::InsufficientData));
        exit_prices(&c);
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Skipped(SkipReason::NoSignal));
        assert!(maker.placed().is_empty());
    }

    #[tokio::test]
    async fn round_trip_enters_then_exits() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        let mut views = c.subscribe();
        entry_prices(&c);
        let entered = match c.try_entry().await.unwrap() {
            TickOutcome::Entered(r) => r,
            other => panic!("expected entry, got {other:?}"),
        };
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::InPosition);
        assert_eq!(view.qty, dec!(0.001));
        assert_eq!(view.maker_order_id.as_deref(), Some(entered.maker_order_id.as_str()));
        assert!(views.has_changed().unwrap());
        assert_eq!(views.borrow_and_update().state, PositionState::InPosition);

        let placed = maker.placed();
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].price, None);
        assert!(!placed[0].reduce_only);
        let orders = taker.orders();
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].quote_id, "q-1");
        assert!(!orders[0].is_reduce_only);

        exit_prices(&c);
        assert!(matches!(c.try_exit().await.unwrap(), TickOutcome::Exited(_)));
        let placed = maker.placed();
        assert_eq!(placed[1].side, Side::Buy);
        assert!(placed[1].reduce_only);
        assert!(taker.orders()[1].is_reduce_only);

        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert!(view.qty.is_zero());
        assert_eq!(view.round_trips, 1);
        // maker: sold 100.10, bought 100.01; taker: bought 99.99, sold 100.00
        assert_eq!(view.realized_pnl, dec!(0.0001));
    }

    #[tokio::test]
    async fn exit_while_flat_is_a_no_op() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        exit_prices(&c);
        for _ in 0..3 {
            assert_eq!(c.try_exit().await.unwrap(), TickOutcome::Skipped(SkipReason::WrongState));
        }
        assert!(maker.placed().is_empty());
        assert!(taker.orders().is_empty());
        assert_eq!(c.snapshot().state, PositionState::Flat);
    }

    #[tokio::test]
    async fn evaluate_dispatches_on_position_state() {
        let (c, _, _) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        entry_prices(&c);
        assert!(matches!(c.evaluate().await.unwrap(), TickOutcome::Entered(_)));
        exit_prices(&c);
        assert!(matches!(c.evaluate().await.unwrap(), TickOutcome::Exited(_)));
    }

    #[tokio::test]
    async fn maker_only_fill_is_unbalanced_and_halts() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        taker.push_place(Err(OrderError::Rejected("insufficient margin".into())));
        entry_prices(&c);

        let report = match c.try_entry().await {
            Err(ExecutionError::Unbalanced(r)) => r,
            other => panic!("expected unbalanced, got {other:?}"),
        };
        assert_eq!(report.filled_venue, Venue::Maker);
        assert_eq!(report.failed_venue, Venue::Taker);
        assert_eq!(Some(report.filled_order_id.clone()), maker.placed()[0].client_order_id);
        assert!(report.failure.contains("insufficient margin"));

        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert_eq!(view.unbalanced, Some(report.clone()));
        assert!(c.is_halted());

        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Skipped(SkipReason::Halted));
        assert_eq!(c.acknowledge_unbalanced().await, Some(report));
        assert!(c.snapshot().unbalanced.is_none());
        assert!(matches!(c.try_entry().await.unwrap(), TickOutcome::Entered(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn taker_only_fill_is_unbalanced_even_when_maker_times_out() {
        let (c, _, _) = setup(ExecutionMode::Market, FakeMaker::slow(5_000), FakeTaker::default());
        entry_prices(&c);

        let report = match c.try_entry().await {
            Err(ExecutionError::Unbalanced(r)) => r,
            other => panic!("expected unbalanced, got {other:?}"),
        };
        assert_eq!(report.filled_venue, Venue::Taker);
        assert_eq!(report.filled_order_id, "t-0");
        assert!(report.failure.contains("timed out"));
        assert_eq!(c.snapshot().state, PositionState::Flat);
    }

    #[tokio::test]
    async fn both_legs_failing_returns_to_flat_without_alarm() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        maker.push_place(Err(OrderError::Rejected("margin".into())));
        taker.push_place(Err(OrderError::Api(ApiError::Server { status: 503, body: String::new() })));
        entry_prices(&c);

        match c.try_entry().await {
            Err(ExecutionError::Placement { direction, action, .. }) => {
                assert_eq!(direction, Direction::Entry);
                assert_eq!(action, "dual_leg");
            }
            other => panic!("expected placement failure, got {other:?}"),
        }
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert!(view.unbalanced.is_none());
        assert!(!c.is_halted());
        assert!(matches!(c.try_entry().await.unwrap(), TickOutcome::Entered(_)));
    }

    #[tokio::test]
    async fn partial_exit_failure_stays_in_position() {
        let (c, _, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        entry_prices(&c);
        c.try_entry().await.unwrap();

        taker.push_place(Err(OrderError::Rejected("no liquidity".into())));
        exit_prices(&c);
        assert!(matches!(c.try_exit().await, Err(ExecutionError::Unbalanced(_))));
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::InPosition);
        assert_eq!(view.qty, dec!(0.001));
        assert!(view.unbalanced.is_some());
    }

    // ---- resting mode ----

    async fn place_resting(c: &Coordinator) -> ActiveOrder {
        entry_prices(c);
        match c.try_entry().await.unwrap() {
            TickOutcome::Placed(o) => o,
            other => panic!("expected placement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resting_entry_posts_at_maker_ask_and_holds() {
        let (c, maker, taker) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let order = place_resting(&c).await;
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.price, dec!(100.11));
        assert!(!order.reduce_only);

        let sent = &maker.placed()[0];
        assert!(sent.post_only);
        assert_eq!(sent.price, Some(dec!(100.11)));
        assert!(taker.orders().is_empty());

        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert_eq!(view.active_order, Some(order));
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Held);
    }

    #[tokio::test]
    async fn resting_order_follows_the_touch() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let old = place_resting(&c).await;

        c.update_maker_book(BookTop { best_bid: dec!(100.12), best_ask: dec!(100.13) });
        let new = match c.try_entry().await.unwrap() {
            TickOutcome::Replaced(o) => o,
            other => panic!("expected replace, got {other:?}"),
        };
        assert_eq!(maker.cancelled(), vec![old.client_order_id.clone()]);
        assert_ne!(new.client_order_id, old.client_order_id);
        assert_eq!(new.price, dec!(100.13));
        assert_eq!((new.side, new.qty, new.reduce_only), (old.side, old.qty, old.reduce_only));
        assert_eq!(c.snapshot().active_order, Some(new));
    }

    #[tokio::test]
    async fn resting_order_is_pulled_when_signal_fades() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let old = place_resting(&c).await;

        c.update_taker_quote(quote(dec!(100.10), dec!(100.11)));
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Cancelled(old.client_order_id.clone()));
        assert_eq!(maker.cancelled(), vec![old.client_order_id]);
        assert!(c.snapshot().active_order.is_none());
        // nothing left to manage
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Skipped(SkipReason::NoSignal));
    }

    #[tokio::test]
    async fn failed_replacement_clears_the_order() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        maker.push_place(Ok("r-1".into()));
        maker.push_place(Err(OrderError::Rejected("post-only would cross".into())));
        place_resting(&c).await;

        c.update_maker_book(BookTop { best_bid: dec!(100.12), best_ask: dec!(100.13) });
        assert!(matches!(
            c.try_entry().await,
            Err(ExecutionError::Placement { action: "replace", .. })
        ));
        assert_eq!(maker.cancelled(), vec!["r-1".to_string()]);
        assert!(c.snapshot().active_order.is_none());
    }

    #[tokio::test]
    async fn failed_cancel_keeps_tracking_the_order() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let old = place_resting(&c).await;
        maker.cancel_results.lock().push_back(Err(OrderError::Rejected("unknown order".into())));

        c.update_maker_book(BookTop { best_bid: dec!(100.12), best_ask: dec!(100.13) });
        assert!(matches!(
            c.try_entry().await,
            Err(ExecutionError::Placement { action: "cancel", .. })
        ));
        assert_eq!(maker.placed().len(), 1);
        assert_eq!(c.snapshot().active_order, Some(old));
    }

    // ---- fills ----

    #[tokio::test]
    async fn resting_fills_are_hedged_through_a_round_trip() {
        let (c, maker, taker) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let entry = place_resting(&c).await;

        let hedged = c.on_maker_fill(sell_fill(&entry.client_order_id, dec!(0.001))).await.unwrap();
        assert!(matches!(hedged, FillOutcome::Hedged(ref r) if r.direction == Direction::Entry));
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::InPosition);
        assert_eq!(view.qty, dec!(0.001));
        assert!(view.active_order.is_none());
        // fully filled: nothing to cancel
        assert!(maker.cancelled().is_empty());
        assert_eq!(taker.orders()[0].side, Side::Buy);
        assert!(!taker.orders()[0].is_reduce_only);

        exit_prices(&c);
        let exit = match c.try_exit().await.unwrap() {
            TickOutcome::Placed(o) => o,
            other => panic!("expected exit placement, got {other:?}"),
        };
        assert_eq!(exit.side, Side::Buy);
        assert_eq!(exit.price, dec!(100.00));
        assert!(exit.reduce_only);

        let fill = MakerFill {
            qty: dec!(0.001),
            is_buyer: true,
            client_order_id: exit.client_order_id,
            price: None,
            cumulative_qty: Some(dec!(0.001)),
        };
        assert!(matches!(c.on_maker_fill(fill).await.unwrap(), FillOutcome::Hedged(_)));
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert!(view.qty.is_zero());
        assert_eq!(view.round_trips, 1);
        assert_eq!(taker.orders()[1].side, Side::Sell);
        assert!(taker.orders()[1].is_reduce_only);
    }

    #[tokio::test]
    async fn partial_fill_cancels_the_remainder() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let entry = place_resting(&c).await;

        c.on_maker_fill(sell_fill(&entry.client_order_id, dec!(0.0004))).await.unwrap();
        assert_eq!(maker.cancelled(), vec![entry.client_order_id.clone()]);
        let view = c.snapshot();
        assert_eq!(view.qty, dec!(0.0004));
        assert!(view.active_order.is_none());

        // a late partial of the same order is still hedged
        c.on_maker_fill(sell_fill(&entry.client_order_id, dec!(0.0001))).await.unwrap();
        assert_eq!(c.snapshot().qty, dec!(0.0005));
    }

    #[tokio::test]
    async fn venue_cumulative_qty_decides_the_remainder() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let entry = place_resting(&c).await;

        // the stream already reports the order done, nothing left to pull
        let fill = MakerFill { cumulative_qty: Some(dec!(0.001)), ..sell_fill(&entry.client_order_id, dec!(0.0004)) };
        c.on_maker_fill(fill).await.unwrap();
        assert!(maker.cancelled().is_empty());
        assert!(c.snapshot().active_order.is_none());
    }

    #[tokio::test]
    async fn fill_on_a_replaced_order_retires_the_replacement() {
        let (c, maker, taker) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let old = place_resting(&c).await;
        c.update_maker_book(BookTop { best_bid: dec!(100.12), best_ask: dec!(100.13) });
        let new = match c.try_entry().await.unwrap() {
            TickOutcome::Replaced(o) => o,
            other => panic!("expected replace, got {other:?}"),
        };

        // the old order filled before its cancel reached the venue
        assert!(matches!(c.on_maker_fill(sell_fill(&old.client_order_id, dec!(0.001))).await.unwrap(), FillOutcome::Hedged(_)));
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::InPosition);
        assert_eq!(view.qty, dec!(0.001));
        assert!(view.active_order.is_none());
        assert_eq!(maker.cancelled(), vec![old.client_order_id, new.client_order_id]);
        assert_eq!(taker.orders().len(), 1);

        exit_prices(&c);
        let exit = match c.try_exit().await.unwrap() {
            TickOutcome::Placed(o) => o,
            other => panic!("expected exit placement, got {other:?}"),
        };
        assert_eq!((exit.side, exit.price, exit.qty, exit.reduce_only), (Side::Buy, dec!(100.00), dec!(0.001), true));
        let sent = maker.placed().last().cloned().unwrap();
        assert_eq!(sent.side, Side::Buy);
        assert!(sent.reduce_only);
    }

    #[tokio::test]
    async fn exit_tick_cancels_a_leftover_entry_order() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let old = place_resting(&c).await;
        c.update_maker_book(BookTop { best_bid: dec!(100.12), best_ask: dec!(100.13) });
        let new = match c.try_entry().await.unwrap() {
            TickOutcome::Replaced(o) => o,
            other => panic!("expected replace, got {other:?}"),
        };
        maker.cancel_results.lock().push_back(Err(OrderError::Rejected("venue busy".into())));

        c.on_maker_fill(sell_fill(&old.client_order_id, dec!(0.001))).await.unwrap();
        // cancel failed: still tracked, still a sell
        assert_eq!(c.snapshot().active_order, Some(new.clone()));

        exit_prices(&c);
        assert_eq!(c.try_exit().await.unwrap(), TickOutcome::Cancelled(new.client_order_id.clone()));
        assert!(c.snapshot().active_order.is_none());
        // no sell was re-posted while holding the position
        assert!(maker.placed().iter().skip(2).all(|o| o.side == Side::Buy));

        match c.try_exit().await.unwrap() {
            TickOutcome::Placed(o) => assert_eq!((o.side, o.reduce_only), (Side::Buy, true)),
            other => panic!("expected exit placement, got {other:?}"),
        }
        assert_eq!(c.snapshot().state, PositionState::InPosition);
    }

    #[tokio::test]
    async fn failed_hedge_is_unbalanced() {
        let (c, _, taker) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let entry = place_resting(&c).await;
        taker.fetch_results.lock().push_back(Err(ApiError::RateLimited { status: 429, body: String::new() }));

        match c.on_maker_fill(sell_fill(&entry.client_order_id, dec!(0.001))).await {
            Err(ExecutionError::Unbalanced(r)) => {
                assert_eq!(r.filled_venue, Venue::Maker);
                assert_eq!(r.filled_order_id, entry.client_order_id);
            }
            other => panic!("expected unbalanced, got {other:?}"),
        }
        assert_eq!(c.snapshot().state, PositionState::Flat);
        assert!(c.is_halted());
    }

    #[tokio::test]
    async fn own_market_order_fills_are_not_hedged_twice() {
        let (c, maker, taker) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        entry_prices(&c);
        c.try_entry().await.unwrap();
        let id = maker.placed()[0].client_order_id.clone().unwrap();

        let out = c.on_maker_fill(sell_fill(&id, dec!(0.001))).await.unwrap();
        assert_eq!(out, FillOutcome::Ignored("dual_leg_order"));
        assert_eq!(taker.orders().len(), 1);
        assert_eq!(c.snapshot().qty, dec!(0.001));
        // fully reported: the id is no longer remembered
        assert!(c.book.lock().await.own_orders.is_empty());

        let zero = c.on_maker_fill(sell_fill("other", Decimal::ZERO)).await.unwrap();
        assert_eq!(zero, FillOutcome::Ignored("non_positive_qty"));
    }

    #[tokio::test]
    async fn rejected_maker_leg_is_not_remembered() {
        let (c, maker, _) = setup(ExecutionMode::Market, FakeMaker::default(), FakeTaker::default());
        maker.push_place(Err(OrderError::Rejected("margin".into())));
        entry_prices(&c);
        assert!(matches!(c.try_entry().await, Err(ExecutionError::Unbalanced(_))));
        assert!(c.book.lock().await.own_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fill_waits_for_the_execution_holding_the_guard() {
        let (c, _, taker) = setup(ExecutionMode::Market, FakeMaker::slow(100), FakeTaker::default());
        entry_prices(&c);
        let entry = {
            let c = c.clone();
            tokio::spawn(async move { c.try_entry().await })
        };
        sleep(Duration::from_millis(10)).await;

        let buy = MakerFill { qty: dec!(0.001), is_buyer: true, client_order_id: "ext-1".into(), price: Some(dec!(100.01)), cumulative_qty: None };
        let fill = {
            let c = c.clone();
            tokio::spawn(async move { c.on_maker_fill(buy).await })
        };
        sleep(Duration::from_millis(50)).await;
        // maker leg still in flight: the hedge has not run
        assert!(!fill.is_finished());
        assert_eq!(taker.orders().len(), 1);

        assert!(matches!(entry.await.unwrap().unwrap(), TickOutcome::Entered(_)));
        match fill.await.unwrap().unwrap() {
            FillOutcome::Hedged(r) => assert_eq!(r.direction, Direction::Exit),
            other => panic!("expected hedge, got {other:?}"),
        }
        let orders = taker.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!((orders[1].side, orders[1].is_reduce_only), (Side::Sell, true));
        let view = c.snapshot();
        assert_eq!(view.state, PositionState::Flat);
        assert!(view.qty.is_zero());
    }

    // ---- lifecycle ----

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_execution_in_flight() {
        let (c, _, _) = setup(ExecutionMode::Market, FakeMaker::slow(100), FakeTaker::default());
        entry_prices(&c);
        let entry = {
            let c = c.clone();
            tokio::spawn(async move { c.try_entry().await })
        };
        sleep(Duration::from_millis(10)).await;

        let view = c.shutdown().await;
        assert_eq!(view.state, PositionState::InPosition);
        assert!(matches!(entry.await.unwrap().unwrap(), TickOutcome::Entered(_)));
        assert_eq!(c.try_entry().await.unwrap(), TickOutcome::Skipped(SkipReason::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_pulls_the_resting_order() {
        let (c, maker, _) = setup(ExecutionMode::Resting, FakeMaker::default(), FakeTaker::default());
        let order = place_resting(&c).await;
        let view = c.shutdown().await;
        assert!(view.active_order.is_none());
        assert_eq!(maker.cancelled(), vec![order.client_order_id]);
    }
}
