// ===============================
// src/supervisor.rs
// ===============================
//
// Event loop between the feeds and the coordinator:
// - maker book / taker quote -> update prices -> spawn one evaluation tick
//   (bounded: beyond `max_inflight_ticks` the tick is dropped, a newer price
//   update will trigger another one)
// - maker fill -> spawn a hedge, never dropped
// - every spawned task is joined and its result logged; unbalanced at error
//
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, FillOutcome, TickOutcome};
use crate::domain::MarketEvent;
use crate::error::ExecutionError;
use crate::metrics::TICKS_SKIPPED;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStats {
    pub ticks_spawned: u64,
    pub ticks_dropped: u64,
    pub fills: u64,
    pub unbalanced: u64,
    pub placement_failures: u64,
}

impl SupervisorStats {
    fn observe_error(&mut self, what: &str, e: &ExecutionError) {
        match e {
            ExecutionError::Unbalanced(_) => {
                self.unbalanced += 1;
                error!(error = %e, "{what}: manual reconciliation required, trading halted");
            }
            ExecutionError::Placement { .. } => {
                self.placement_failures += 1;
                warn!(error = %e, "{what}: placement failed");
            }
        }
    }

    fn observe_tick(&mut self, done: Result<Result<TickOutcome, ExecutionError>, JoinError>) {
        match done {
            Ok(Ok(TickOutcome::Skipped(reason))) => debug!(reason = reason.as_str(), "tick skipped"),
            Ok(Ok(outcome)) => debug!(?outcome, "tick done"),
            Ok(Err(e)) => self.observe_error("tick", &e),
            Err(e) => error!(?e, "tick task failed"),
        }
    }

    fn observe_fill(&mut self, done: Result<Result<FillOutcome, ExecutionError>, JoinError>) {
        match done {
            Ok(Ok(outcome)) => debug!(?outcome, "fill done"),
            Ok(Err(e)) => self.observe_error("fill", &e),
            Err(e) => error!(?e, "fill task failed"),
        }
    }
}

pub async fn run(
    coordinator: Arc<Coordinator>,
    mut rx: mpsc::Receiver<MarketEvent>,
    max_inflight_ticks: usize,
    mut shutdown: watch::Receiver<bool>,
) -> SupervisorStats {
    let mut stats = SupervisorStats::default();
    let mut ticks: JoinSet<Result<TickOutcome, ExecutionError>> = JoinSet::new();
    let mut fills: JoinSet<Result<FillOutcome, ExecutionError>> = JoinSet::new();

    let spawn_tick = |ticks: &mut JoinSet<Result<TickOutcome, ExecutionError>>, stats: &mut SupervisorStats| {
        if ticks.len() >= max_inflight_ticks {
            stats.ticks_dropped += 1;
            TICKS_SKIPPED.with_label_values(&["saturated"]).inc();
            return;
        }
        stats.ticks_spawned += 1;
        let c = coordinator.clone();
        ticks.spawn(async move { c.evaluate().await });
    };

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(MarketEvent::MakerBook(top)) => {
                    if coordinator.update_maker_book(top) {
                        spawn_tick(&mut ticks, &mut stats);
                    }
                }
                Some(MarketEvent::TakerQuote(q)) => {
                    coordinator.update_taker_quote(q);
                    spawn_tick(&mut ticks, &mut stats);
                }
                Some(MarketEvent::MakerFill(f)) => {
                    stats.fills += 1;
                    let c = coordinator.clone();
                    fills.spawn(async move { c.on_maker_fill(f).await });
                }
                None => break,
            },
            Some(done) = ticks.join_next(), if !ticks.is_empty() => stats.observe_tick(done),
            Some(done) = fills.join_next(), if !fills.is_empty() => stats.observe_fill(done),
            _ = shutdown.changed() => break,
        }
    }

    // fills already queued still get hedged
    while let Ok(ev) = rx.try_recv() {
        if let MarketEvent::MakerFill(f) = ev {
            stats.fills += 1;
            let c = coordinator.clone();
            fills.spawn(async move { c.on_maker_fill(f).await });
        }
    }
    info!(ticks = ticks.len(), fills = fills.len(), "supervisor draining");
    while let Some(done) = ticks.join_next().await {
        stats.observe_tick(done);
    }
    while let Some(done) = fills.join_next().await {
        stats.observe_fill(done);
    }
    info!(?stats, "supervisor stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, TradeConfig};
    use crate::domain::{BookTop, MakerFill, PositionState, Quote};
    use crate::gateway::{MockMaker, MockTaker};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::sleep;

    fn coordinator(maker_latency_ms: u64) -> (Arc<Coordinator>, mpsc::Receiver<MarketEvent>) {
        let (fill_tx, fill_rx) = mpsc::channel(64);
        let cfg = TradeConfig {
            open_threshold: dec!(0.00075),
            close_threshold: dec!(-0.00068),
            order_amount: dec!(0.001),
            max_slippage: dec!(0.005),
            mode: ExecutionMode::Market,
            leg_timeout: Duration::from_secs(5),
        };
        let c = Coordinator::new(
            Arc::new(MockMaker::new(fill_tx, maker_latency_ms, 1_000)),
            Arc::new(MockTaker::new(1)),
            cfg,
        );
        (Arc::new(c), fill_rx)
    }

    fn book(bid: Decimal) -> MarketEvent {
        MarketEvent::MakerBook(BookTop { best_bid: bid, best_ask: bid + dec!(0.01) })
    }

    #[tokio::test(start_paused = true)]
    async fn price_updates_drive_an_entry() {
        let (c, _fills) = coordinator(1);
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let sup = tokio::spawn(run(c.clone(), rx, 4, stop_rx));

        tx.send(book(dec!(100.10))).await.unwrap();
        let quote = Quote { bid: dec!(99.98), ask: dec!(99.99), quote_id: "q-1".into(), mark_price: None, index_price: None };
        tx.send(MarketEvent::TakerQuote(quote)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(c.snapshot().state, PositionState::InPosition);
        stop_tx.send(true).unwrap();
        let stats = sup.await.unwrap();
        assert!(stats.ticks_spawned >= 1);
        assert_eq!(stats.unbalanced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_beyond_the_bound_are_dropped() {
        let (c, _fills) = coordinator(100);
        let (tx, rx) = mpsc::channel(16);
        for i in 0..5 {
            tx.send(book(dec!(100) + Decimal::new(i, 2))).await.unwrap();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let sup = tokio::spawn(run(c, rx, 1, stop_rx));
        sleep(Duration::from_secs(1)).await;
        stop_tx.send(true).unwrap();

        let stats = sup.await.unwrap();
        assert_eq!(stats.ticks_spawned + stats.ticks_dropped, 5);
        assert!(stats.ticks_dropped >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_fills_are_hedged_after_shutdown() {
        let (c, _fills) = coordinator(1);
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        tx.send(MarketEvent::MakerFill(MakerFill {
            qty: dec!(0.001),
            is_buyer: false,
            client_order_id: "resting-1".into(),
            price: Some(dec!(100)),
            cumulative_qty: None,
        }))
        .await
        .unwrap();
        stop_tx.send(true).unwrap();

        let stats = run(c.clone(), rx, 4, stop_rx).await;
        assert_eq!(stats.fills, 1);
        assert_eq!(c.snapshot().state, PositionState::InPosition);
        assert_eq!(c.snapshot().qty, dec!(0.001));
    }
}
