// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters, all funnelled into the supervisor's event channel:
// - run_mock        : maker book random walk
// - run_binance     : maker book from Binance futures WS bookTicker
// - run_taker_poll  : taker indicative quotes polled on a fixed cadence,
//                     backing off on consecutive failures
//
// Every loop exits when the shutdown watch flips.
//
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt; // for .next()
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::parse_book_ticker;
use crate::domain::{BookTop, MarketEvent};
use crate::gateway::TakerGateway;
use crate::metrics::{BIN_WS_CONNECTED, BIN_WS_RECONNECTS, MAKER_TICKS};

const MOCK_TICK: Duration = Duration::from_millis(20);

/// Random-walk maker book around 100.00, one cent wide (~50 ticks/s).
pub async fn run_mock(tx: mpsc::Sender<MarketEvent>, mut shutdown: watch::Receiver<bool>) {
    let mut px_bid: i64 = 100_00; // cents
    loop {
        // don't hold ThreadRng across .await
        let step = rand::thread_rng().gen_range(-3..=3);
        px_bid = (px_bid + step).max(50_00);
        let top = BookTop { best_bid: Decimal::new(px_bid, 2), best_ask: Decimal::new(px_bid + 1, 2) };
        // book updates are droppable: a newer one is coming
        if tx.try_send(MarketEvent::MakerBook(top)).is_ok() {
            MAKER_TICKS.inc();
        }
        tokio::select! {
            _ = sleep(MOCK_TICK) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Binance futures bookTicker for `symbol`.
/// `ws_base` e.g. wss://fstream.binance.com/ws (mainnet) or wss://stream.binancefuture.com/ws (testnet).
pub async fn run_binance(
    tx: mpsc::Sender<MarketEvent>,
    symbol: String,
    ws_base: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = format!("{}@bookTicker", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, "connecting binance bookTicker");
        match connect_async(url.clone()).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to bookTicker");
                BIN_WS_CONNECTED.with_label_values(&["book"]).set(1);
                attempt = 0; // reset backoff

                loop {
                    let frame = tokio::select! {
                        f = ws.next() => f,
                        _ = shutdown.changed() => {
                            BIN_WS_CONNECTED.with_label_values(&["book"]).set(0);
                            return;
                        }
                    };
                    match frame {
                        Some(Ok(m)) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            if let Some(top) = parse_book_ticker(&txt) {
                                if tx.try_send(MarketEvent::MakerBook(top)).is_ok() {
                                    MAKER_TICKS.inc();
                                }
                            }
                        }
                        Some(Ok(_)) => {} // ignore non-text frames
                        Some(Err(e)) => {
                            error!(?e, "ws read error");
                            break;
                        }
                        None => break,
                    }
                }
                BIN_WS_CONNECTED.with_label_values(&["book"]).set(0);
                info!("bookTicker disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }
        BIN_WS_RECONNECTS.with_label_values(&["book"]).inc();

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);                  // 0..=6
        let factor = 1u64 << shift;                  // 1,2,4,...,64
        let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        tokio::select! {
            _ = sleep(Duration::from_millis(base_ms + jitter)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Delay before the next poll after `failures` consecutive failed polls.
pub fn poll_delay(interval: Duration, backoff_max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(backoff_max.max(interval))
}

/// Polls the taker venue for an indicative quote of `qty` and forwards it.
pub async fn run_taker_poll(
    taker: Arc<dyn TakerGateway>,
    qty: Decimal,
    interval: Duration,
    backoff_max: Duration,
    tx: mpsc::Sender<MarketEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        let fetched = tokio::select! {
            r = taker.fetch_quote(qty) => r,
            _ = shutdown.changed() => return,
        };
        match fetched {
            Ok(q) => {
                if failures > 0 {
                    info!(failures, "taker quotes recovered");
                }
                failures = 0;
                debug!(quote_id = %q.quote_id, mid = %q.mid(), spread = %q.spread(), "taker quote");
                if tx.send(MarketEvent::TakerQuote(q)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(error = %e, class = e.class().as_str(), failures, "taker quote failed");
            }
        }
        tokio::select! {
            _ = sleep(poll_delay(interval, backoff_max, failures)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockTaker;
    use rust_decimal_macros::dec;

    #[test]
    fn poll_delay_backs_off_and_caps() {
        let i = Duration::from_millis(100);
        let cap = Duration::from_millis(5_000);
        assert_eq!(poll_delay(i, cap, 0), i);
        assert_eq!(poll_delay(i, cap, 1), Duration::from_millis(200));
        assert_eq!(poll_delay(i, cap, 3), Duration::from_millis(800));
        assert_eq!(poll_delay(i, cap, 10), cap);
        assert_eq!(poll_delay(i, cap, u32::MAX), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn taker_poll_forwards_quotes_and_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let taker: Arc<dyn TakerGateway> = Arc::new(MockTaker::new(1));
        let h = tokio::spawn(run_taker_poll(
            taker,
            dec!(0.001),
            Duration::from_millis(100),
            Duration::from_secs(5),
            tx,
            stop_rx,
        ));

        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(MarketEvent::TakerQuote(_))));
        }
        stop_tx.send(true).unwrap();
        h.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mock_feed_emits_one_cent_books() {
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let h = tokio::spawn(run_mock(tx, stop_rx));
        match rx.recv().await {
            Some(MarketEvent::MakerBook(top)) => assert_eq!(top.best_ask - top.best_bid, dec!(0.01)),
            other => panic!("expected book, got {other:?}"),
        }
        stop_tx.send(true).unwrap();
        h.await.unwrap();
    }
}
