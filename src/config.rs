// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : xvenue_arb: event-driven maker/taker cross-venue arbitrage in Rust
Module  : config.rs
Version : 0.1.0
Author  : xvenue_arb contributors
License : MIT (see Cargo.toml)

Summary : Streams maker-venue best bid/ask and polls taker-venue indicative
          quotes, opens a hedged position when the venues diverge and closes
          it when they converge, with single-flight dual-leg execution,
          unbalanced-leg alarms, Prometheus metrics and JSONL recording.
=============================================================================
*/
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;

use crate::domain::Instrument;
use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Maker venue source: market data feed and order entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum MarketMode {
    Mock,
    BinanceTestnet,
    BinanceMainnet,
}

impl MarketMode {
    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "wss://stream.binancefuture.com/ws", // unused in mock
            MarketMode::BinanceTestnet => "wss://stream.binancefuture.com/ws",
            MarketMode::BinanceMainnet => "wss://fstream.binance.com/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "https://testnet.binancefuture.com", // placeholder
            MarketMode::BinanceTestnet => "https://testnet.binancefuture.com",
            MarketMode::BinanceMainnet => "https://fapi.binance.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::BinanceTestnet => "binance_testnet",
            MarketMode::BinanceMainnet => "binance_mainnet",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TakerMode {
    Mock,
    Live,
}

impl TakerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakerMode::Mock => "mock",
            TakerMode::Live => "live",
        }
    }
}

/// How the maker leg is worked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// both legs as market orders, fired together
    Market,
    /// maker leg rests as a post-only limit; taker leg hedges each fill
    Resting,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Market => "market",
            ExecutionMode::Resting => "resting",
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "xvenue_arb", version, about = "maker/taker cross-venue arbitrage engine")]
pub struct Args {
    // ===== Signal =====
    #[arg(long, env = "OPEN_THRESHOLD", default_value = "0.00075", allow_negative_numbers = true)]
    pub open_threshold: Decimal,
    #[arg(long, env = "CLOSE_THRESHOLD", default_value = "-0.00068", allow_negative_numbers = true)]
    pub close_threshold: Decimal,

    // ===== Sizing / execution =====
    #[arg(long, env = "DEFAULT_ORDER_AMOUNT", default_value = "0.001")]
    pub order_amount: Decimal,
    #[arg(long, env = "MAX_SLIPPAGE", default_value = "0.005")]
    pub max_slippage: Decimal,
    #[arg(long, env = "EXECUTION_MODE", value_enum, default_value = "market")]
    pub execution_mode: ExecutionMode,
    #[arg(long, env = "LEG_TIMEOUT_MS", default_value_t = 10_000)]
    pub leg_timeout_ms: u64,
    #[arg(long, env = "MAX_INFLIGHT_TICKS", default_value_t = 8)]
    pub max_inflight_ticks: usize,

    // ===== Taker polling =====
    #[arg(long, env = "QUOTE_FETCH_INTERVAL_MS", default_value_t = 100)]
    pub quote_fetch_interval_ms: u64,
    #[arg(long, env = "QUOTE_FETCH_BACKOFF_MAX_MS", default_value_t = 5_000)]
    pub quote_fetch_backoff_max_ms: u64,
    #[arg(long, env = "STATUS_CHECK_INTERVAL_MS", default_value_t = 2_000)]
    pub status_check_interval_ms: u64,

    // ===== Quote client retry =====
    #[arg(long, env = "MAX_RETRIES_NETWORK", default_value_t = 3)]
    pub max_retries_network: u32,
    #[arg(long, env = "MAX_RETRIES_5XX", default_value_t = 2)]
    pub max_retries_5xx: u32,
    #[arg(long, env = "MAX_RETRIES_429", default_value_t = 5)]
    pub max_retries_429: u32,
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 1_000)]
    pub backoff_base_ms: u64,
    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    // ===== Maker venue =====
    #[arg(long, env = "FEED_MODE", value_enum, default_value = "mock")]
    pub feed_mode: MarketMode,
    #[arg(long, env = "VENUE_MODE", value_enum, default_value = "mock")]
    pub venue_mode: MarketMode,
    #[arg(long, env = "SYMBOL", default_value = "BTCUSDT")]
    pub symbol: String,
    #[arg(long, env = "BINANCE_WS_URL")]
    pub binance_ws_url: Option<String>,
    #[arg(long, env = "BINANCE_REST_URL")]
    pub binance_rest_url: Option<String>,
    #[arg(long, env = "BINANCE_API_KEY", hide_env_values = true)]
    pub binance_api_key: Option<String>,
    #[arg(long, env = "BINANCE_API_SECRET", hide_env_values = true)]
    pub binance_api_secret: Option<String>,
    #[arg(long, env = "BINANCE_RECV_WINDOW", default_value_t = 5_000)]
    pub binance_recv_window: u64,

    // ===== Taker venue =====
    #[arg(long, env = "TAKER_MODE", value_enum, default_value = "mock")]
    pub taker_mode: TakerMode,
    #[arg(long, env = "VARIATIONAL_BASE_URL", default_value = "https://omni.variational.io")]
    pub taker_base_url: String,
    #[arg(long, env = "VARIATIONAL_COOKIE", hide_env_values = true)]
    pub taker_cookie: Option<String>,
    #[arg(long, env = "UNDERLYING", default_value = "BTC")]
    pub underlying: String,
    #[arg(long, env = "SETTLEMENT_ASSET", default_value = "USDC")]
    pub settlement_asset: String,
    #[arg(long, env = "FUNDING_INTERVAL_S", default_value_t = 3600)]
    pub funding_interval_s: u32,

    // ===== files/metrics =====
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

/// Parameters the coordinator reads on every tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeConfig {
    pub open_threshold: Decimal,
    pub close_threshold: Decimal,
    pub order_amount: Decimal,
    pub max_slippage: Decimal,
    pub mode: ExecutionMode,
    pub leg_timeout: Duration,
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order_amount <= Decimal::ZERO {
            return Err(ConfigError::NotPositive("DEFAULT_ORDER_AMOUNT"));
        }
        if self.max_slippage <= Decimal::ZERO || self.max_slippage >= Decimal::ONE {
            return Err(ConfigError::OutOfRange { name: "MAX_SLIPPAGE", value: self.max_slippage.to_string() });
        }
        if self.quote_fetch_interval_ms == 0 {
            return Err(ConfigError::NotPositive("QUOTE_FETCH_INTERVAL_MS"));
        }
        if self.leg_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("LEG_TIMEOUT_MS"));
        }
        if self.max_inflight_ticks == 0 {
            return Err(ConfigError::NotPositive("MAX_INFLIGHT_TICKS"));
        }
        if self.venue_mode != MarketMode::Mock {
            if self.binance_api_key.is_none() {
                return Err(ConfigError::Missing("BINANCE_API_KEY"));
            }
            if self.binance_api_secret.is_none() {
                return Err(ConfigError::Missing("BINANCE_API_SECRET"));
            }
        }
        if self.taker_mode == TakerMode::Live && self.taker_cookie.is_none() {
            return Err(ConfigError::Missing("VARIATIONAL_COOKIE"));
        }
        Ok(())
    }

    pub fn trade(&self) -> TradeConfig {
        TradeConfig {
            open_threshold: self.open_threshold,
            close_threshold: self.close_threshold,
            order_amount: self.order_amount,
            max_slippage: self.max_slippage,
            mode: self.execution_mode,
            leg_timeout: Duration::from_millis(self.leg_timeout_ms),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries_network: self.max_retries_network,
            max_retries_5xx: self.max_retries_5xx,
            max_retries_429: self.max_retries_429,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::perpetual(&self.underlying, &self.settlement_asset, self.funding_interval_s)
    }

    pub fn ws_url(&self) -> String {
        self.binance_ws_url.clone().unwrap_or_else(|| self.feed_mode.default_ws_url().to_string())
    }

    pub fn rest_url(&self) -> String {
        self.binance_rest_url.clone().unwrap_or_else(|| self.venue_mode.default_rest_url().to_string())
    }
}

pub fn load() -> Result<Args, ConfigError> {
    // .env first so clap sees OPEN_THRESHOLD etc.
    let _ = dotenv();
    let args = Args::parse();
    args.validate()?;
    Ok(args)
}
