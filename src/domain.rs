// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue { Maker, Taker }

impl Venue {
    pub fn as_str(&self) -> &'static str { match self { Venue::Maker => "maker", Venue::Taker => "taker" } }
}

/// Which half of a round trip an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction { Entry, Exit }

impl Direction {
    /// Maker-side order direction. Entry sells the maker venue, exit buys it back.
    pub fn maker_side(&self) -> Side { match self { Direction::Entry => Side::Sell, Direction::Exit => Side::Buy } }
    pub fn taker_side(&self) -> Side { self.maker_side().opposite() }
    pub fn reduce_only(&self) -> bool { matches!(self, Direction::Exit) }
    pub fn as_str(&self) -> &'static str { match self { Direction::Entry => "entry", Direction::Exit => "exit" } }
}

/// Best bid/ask pushed by the maker venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTop { pub best_bid: Decimal, pub best_ask: Decimal }

/// Indicative quote from the taker venue. Never mutated; the next poll supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub quote_id: String,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
}

impl Quote {
    pub fn mid(&self) -> Decimal { (self.bid + self.ask) / Decimal::TWO }
    pub fn spread(&self) -> Decimal { self.ask - self.bid }
}

/// Taker-venue instrument descriptor sent with every quote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub underlying: String,
    pub funding_interval_s: u32,
    pub settlement_asset: String,
    pub instrument_type: String,
}

impl Instrument {
    pub fn perpetual(underlying: &str, settlement_asset: &str, funding_interval_s: u32) -> Self {
        Self {
            underlying: underlying.to_string(),
            funding_interval_s,
            settlement_asset: settlement_asset.to_string(),
            instrument_type: "perpetual_future".to_string(),
        }
    }
}

/// Fill notification from the maker venue's private stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerFill {
    pub qty: Decimal,
    pub is_buyer: bool,
    pub client_order_id: String,
    pub price: Option<Decimal>,
    /// venue-reported cumulative filled qty of the order, when the stream carries it
    #[serde(default)]
    pub cumulative_qty: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionState {
    #[default]
    Flat,
    Entering,
    InPosition,
    Exiting,
}

/// Resting maker order tracked by the coordinator (resting mode only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub reduce_only: bool,
    pub placed_at: DateTime<Utc>,
}

/// One leg that went through while its counterpart did not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnbalancedReport {
    pub direction: Direction,
    pub filled_venue: Venue,
    pub filled_order_id: String,
    pub failed_venue: Venue,
    pub failure: String,
    pub qty: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualLegReport {
    pub direction: Direction,
    pub qty: Decimal,
    pub maker_order_id: String,
    pub taker_order_id: String,
    pub entry_gap: Option<Decimal>,
    pub exit_gap: Option<Decimal>,
}

/// Read-only view of the coordinator for the host process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub state: PositionState,
    pub qty: Decimal,
    pub maker_order_id: Option<String>,
    pub active_order: Option<ActiveOrder>,
    pub unbalanced: Option<UnbalancedReport>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Option<Decimal>,
    pub round_trips: u64,
    pub entry_gap: Option<Decimal>,
    pub exit_gap: Option<Decimal>,
}

/// Inputs to the supervisor loop.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    MakerBook(BookTop),
    TakerQuote(Quote),
    MakerFill(MakerFill),
}

/// Records written by the optional JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Prices {
        ts: DateTime<Utc>,
        maker_bid: Option<Decimal>,
        maker_ask: Option<Decimal>,
        taker_bid: Option<Decimal>,
        taker_ask: Option<Decimal>,
        taker_spread: Option<Decimal>,
        entry_gap: Option<Decimal>,
        exit_gap: Option<Decimal>,
    },
    Execution { ts: DateTime<Utc>, report: DualLegReport },
    Unbalanced { ts: DateTime<Utc>, report: UnbalancedReport },
    Note { ts: DateTime<Utc>, text: String },
}
