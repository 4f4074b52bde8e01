// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static MAKER_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("maker_ticks_total", "maker venue book updates").unwrap());

pub static TAKER_QUOTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("taker_quotes_total", "taker venue quote polls (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static QUOTE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("quote_retries_total", "venue REST retries by failure class"),
        &["class"],
    )
    .unwrap()
});

pub static GAP: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("gap", "latest normalized gap (label: kind=entry|exit)"), &["kind"]).unwrap()
});

// -------- Coordinator --------
pub static TICKS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_skipped_total", "evaluation ticks that did nothing (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("executions_total", "dual-leg executions (labels: direction, result)"),
        &["direction", "result"],
    )
    .unwrap()
});

pub static LEGS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("legs_total", "order legs (labels: venue, result)"), &["venue", "result"])
        .unwrap()
});

// Leg latency from send -> venue response (milliseconds)
pub static LEG_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("leg_latency_ms", "order leg round trip (ms)")
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 10000.0]),
        &["venue"],
    )
    .unwrap()
});

pub static RESTING_ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("resting_orders_total", "resting maker order actions (label: action)"),
        &["action"],
    )
    .unwrap()
});

pub static MAKER_FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("maker_fills_total", "maker fills hedged (label: side)"), &["side"]).unwrap()
});

pub static UNBALANCED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("unbalanced_total", "one leg filled, the other failed").unwrap());

/// 0=flat 1=entering 2=in_position 3=exiting
pub static POSITION_STATE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("position_state", "coordinator position state").unwrap());

pub static HALTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("halted", "1 while an unbalanced position awaits the operator").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL (quote currency)").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL (quote currency)").unwrap());

// -------- Maker venue user-data stream health (used by gateway_binance) --------
pub static BIN_WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("binance_ws_connected", "1 if WS userDataStream connected, 0 otherwise"),
        &["stream"],
    )
    .unwrap()
});

pub static BIN_WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("binance_ws_reconnects_total", "Number of reconnects per WS stream"),
        &["stream"],
    )
    .unwrap()
});

pub static BIN_LISTEN_KEEPALIVE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("binance_listenkey_keepalive_total", "listenKey keepalive calls (label: result)"),
        &["result"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_mode", "configured modes (labels: component, mode)"),
        &["component", "mode"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured maker symbol (label: symbol)"), &["symbol"])
        .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(MAKER_TICKS.clone())),
        REGISTRY.register(Box::new(TAKER_QUOTES.clone())),
        REGISTRY.register(Box::new(QUOTE_RETRIES.clone())),
        REGISTRY.register(Box::new(GAP.clone())),
        REGISTRY.register(Box::new(TICKS_SKIPPED.clone())),
        REGISTRY.register(Box::new(EXECUTIONS.clone())),
        REGISTRY.register(Box::new(LEGS.clone())),
        REGISTRY.register(Box::new(LEG_LATENCY.clone())),
        REGISTRY.register(Box::new(RESTING_ORDERS.clone())),
        REGISTRY.register(Box::new(MAKER_FILLS.clone())),
        REGISTRY.register(Box::new(UNBALANCED.clone())),
        REGISTRY.register(Box::new(POSITION_STATE.clone())),
        REGISTRY.register(Box::new(HALTED.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        // maker venue WS health
        REGISTRY.register(Box::new(BIN_WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(BIN_WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(BIN_LISTEN_KEEPALIVE.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        if let Err(e) = m {
            tracing::warn!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, exporter disabled");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening on / and /metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
