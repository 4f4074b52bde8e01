// ===============================
// src/main.rs
// ===============================
/*
 # configured modes / symbol
 curl -s localhost:9898/metrics | egrep '^config_(mode|symbol)'

 # position state, gaps, executions
 curl -s localhost:9898/metrics | egrep '^(position_state|gap|executions_total|unbalanced_total)'
*/
/*
=============================================================================
Project : xvenue_arb: event-driven maker/taker cross-venue arbitrage in Rust
Module  : main.rs
Version : 0.1.0
Author  : xvenue_arb contributors
License : MIT (see Cargo.toml)

Summary : Streams maker-venue best bid/ask and polls taker-venue indicative
          quotes, opens a hedged position when the venues diverge and closes
          it when they converge, with single-flight dual-leg execution,
          unbalanced-leg alarms, Prometheus metrics and JSONL recording.
=============================================================================
*/
mod binance;          // signer + wire models for Binance futures
mod config;
mod coordinator;
mod domain;
mod error;
mod feed;
mod gap;
mod gateway;          // gateway traits + mock venues
mod gateway_binance;  // Binance futures maker venue (REST + user data stream)
mod metrics;
mod positions;
mod recorder;
mod retry;
mod state;
mod supervisor;
mod taker;            // taker venue REST client

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, timeout, Duration, MissedTickBehavior},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{MarketMode, TakerMode};
use crate::coordinator::Coordinator;
use crate::domain::{Event, MarketEvent};
use crate::gateway::{MakerGateway, MockMaker, MockTaker, TakerGateway};

// mock venue timings
const MOCK_MAKER_LATENCY_MS: u64 = 5;
const MOCK_MAKER_FILL_MS: u64 = 3_000;
const MOCK_TAKER_LATENCY_MS: u64 = 20;
// taker positions are logged every N status ticks
const POSITIONS_EVERY: u64 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = config::load().context("invalid configuration")?;
    let trade = args.trade();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        taker_mode = args.taker_mode.as_str(),
        execution_mode = trade.mode.as_str(),
        symbol = %args.symbol,
        underlying = %args.underlying,
        open_threshold = %trade.open_threshold,
        close_threshold = %trade.close_threshold,
        order_amount = %trade.order_amount,
        "startup config"
    );
    for (component, mode) in [
        ("feed", args.feed_mode.as_str()),
        ("venue", args.venue_mode.as_str()),
        ("taker", args.taker_mode.as_str()),
        ("execution", trade.mode.as_str()),
    ] {
        metrics::CONFIG_MODE.with_label_values(&[component, mode]).set(1);
    }
    metrics::CONFIG_SYMBOL.with_label_values(&[args.symbol.as_str()]).set(1);

    // ---- Buses ----
    let (events_tx, events_rx) = mpsc::channel::<MarketEvent>(4096);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recorder = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));

    // ---- Maker venue ----
    let maker: Arc<dyn MakerGateway> = match args.venue_mode {
        MarketMode::Mock => Arc::new(MockMaker::new(events_tx.clone(), MOCK_MAKER_LATENCY_MS, MOCK_MAKER_FILL_MS)),
        MarketMode::BinanceTestnet | MarketMode::BinanceMainnet => {
            // validate() guarantees both are present in these modes
            let key = args.binance_api_key.clone().unwrap_or_default();
            let secret = args.binance_api_secret.clone().unwrap_or_default();
            let bin = Arc::new(
                gateway_binance::BinanceMaker::new(
                    &args.rest_url(),
                    &key,
                    &secret,
                    args.binance_recv_window,
                    &args.symbol,
                    Duration::from_millis(args.request_timeout_ms),
                )
                .context("maker venue client")?,
            );
            let ws_base = args.binance_ws_url.clone().unwrap_or_else(|| args.venue_mode.default_ws_url().to_string());
            tasks.push(tokio::spawn(gateway_binance::run_user_stream(
                bin.clone(),
                ws_base,
                events_tx.clone(),
                shutdown_rx.clone(),
            )));
            bin
        }
    };

    // ---- Taker venue ----
    let taker: Arc<dyn TakerGateway> = match args.taker_mode {
        TakerMode::Mock => Arc::new(MockTaker::new(MOCK_TAKER_LATENCY_MS)),
        TakerMode::Live => Arc::new(
            taker::TakerClient::new(
                &args.taker_base_url,
                args.taker_cookie.as_deref().unwrap_or_default(),
                args.instrument(),
                args.retry(),
                Duration::from_millis(args.request_timeout_ms),
            )
            .context("taker venue client")?,
        ),
    };

    // ---- Coordinator ----
    let mut coordinator = Coordinator::new(maker, taker.clone(), trade.clone());
    if recorder.is_some() {
        coordinator = coordinator.with_recorder(rec_tx.clone());
    }
    let coordinator = Arc::new(coordinator);

    // ---- Feeds ----
    match args.feed_mode {
        MarketMode::Mock => tasks.push(tokio::spawn(feed::run_mock(events_tx.clone(), shutdown_rx.clone()))),
        MarketMode::BinanceTestnet | MarketMode::BinanceMainnet => tasks.push(tokio::spawn(feed::run_binance(
            events_tx.clone(),
            args.symbol.clone(),
            args.ws_url(),
            shutdown_rx.clone(),
        ))),
    }
    tasks.push(tokio::spawn(feed::run_taker_poll(
        taker.clone(),
        trade.order_amount,
        Duration::from_millis(args.quote_fetch_interval_ms),
        Duration::from_millis(args.quote_fetch_backoff_max_ms),
        events_tx.clone(),
        shutdown_rx.clone(),
    )));
    drop(events_tx);

    // ---- Supervisor ----
    let supervisor = tokio::spawn(supervisor::run(
        coordinator.clone(),
        events_rx,
        args.max_inflight_ticks,
        shutdown_rx.clone(),
    ));

    // ---- Status ----
    tasks.push(tokio::spawn(status_loop(
        coordinator.clone(),
        taker,
        Duration::from_millis(args.status_check_interval_ms),
        shutdown_rx.clone(),
    )));

    let _ = rec_tx.try_send(Event::Note { ts: Utc::now(), text: "started".into() });

    // ---- Wait for Ctrl-C ----
    tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);

    let stats = supervisor.await.context("supervisor task")?;
    for t in tasks {
        let _ = t.await;
    }
    let view = coordinator.shutdown().await;
    if let Some(report) = &view.unbalanced {
        warn!(?report, "exiting with an UNBALANCED position, reconcile manually");
    }
    info!(?stats, state = ?view.state, qty = %view.qty, realized_pnl = %view.realized_pnl, "final snapshot");

    let _ = rec_tx.try_send(Event::Note { ts: Utc::now(), text: format!("stopped: {:?}", view.state) });
    drop(coordinator);
    drop(rec_tx);
    if let Some(h) = recorder {
        let _ = timeout(Duration::from_secs(2), h).await;
    }
    Ok(())
}

/// Periodic position log; every few rounds also asks the taker venue what it holds.
async fn status_loop(
    coordinator: Arc<Coordinator>,
    taker: Arc<dyn TakerGateway>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rounds: u64 = 0;
    loop {
        select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        rounds += 1;
        coordinator.mark_to_market();
        let view = coordinator.snapshot();
        info!(
            state = ?view.state,
            qty = %view.qty,
            entry_gap = ?view.entry_gap,
            exit_gap = ?view.exit_gap,
            realized_pnl = %view.realized_pnl,
            unrealized_pnl = ?view.unrealized_pnl,
            round_trips = view.round_trips,
            resting = view.active_order.is_some(),
            halted = coordinator.is_halted(),
            "status"
        );
        if rounds % POSITIONS_EVERY == 0 {
            // retried internally; abandoned on shutdown
            let res = select! {
                r = taker.positions() => r,
                _ = shutdown.changed() => return,
            };
            match res {
                Ok(ps) => info!(positions = ?ps, "taker venue positions"),
                Err(e) => warn!(error = %e, "taker positions query failed"),
            }
        }
    }
}
