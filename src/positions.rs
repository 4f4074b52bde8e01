// ===============================
// src/positions.rs (PnL & inventory per venue)
// ===============================
//
// Leg prices are the prices the coordinator executed against: maker fills carry
// their own price; market legs are booked at the touch they were sent against
// (maker bid/ask, taker quote ask/bid).
//
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Side, Venue};
use crate::state::PriceSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    /// signed qty: positive long, negative short
    pub qty: Decimal,
    pub avg_cost_px: Decimal,
    pub realized_pnl: Decimal,
}

impl VenuePosition {
    fn on_fill(&mut self, side: Side, qty: Decimal, px: Decimal) {
        let signed_qty = match side { Side::Buy => qty, Side::Sell => -qty };
        let prev_qty = self.qty;
        let new_qty = prev_qty + signed_qty;

        if prev_qty.is_zero() || prev_qty.is_sign_positive() == signed_qty.is_sign_positive() {
            // same direction -> update avg cost
            self.avg_cost_px = if prev_qty.is_zero() {
                px
            } else {
                (self.avg_cost_px * prev_qty.abs() + px * qty) / (prev_qty.abs() + qty)
            };
            self.qty = new_qty;
        } else {
            // opposite direction -> realize PnL on the closed part
            let qty_closed = qty.min(prev_qty.abs());
            let signed_closed = if prev_qty.is_sign_positive() { qty_closed } else { -qty_closed };
            self.realized_pnl += (px - self.avg_cost_px) * signed_closed;
            self.qty = new_qty;
            if self.qty.is_zero() {
                self.avg_cost_px = Decimal::ZERO;
            } else if self.qty.is_sign_positive() != prev_qty.is_sign_positive() {
                // flipped through zero: remainder opened at this price
                self.avg_cost_px = px;
            }
        }
    }

    fn unrealized(&self, mark: Decimal) -> Decimal {
        if self.qty.is_zero() { Decimal::ZERO } else { (mark - self.avg_cost_px) * self.qty }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlLedger {
    pub maker: VenuePosition,
    pub taker: VenuePosition,
    round_trips: u64,
}

impl PnlLedger {
    pub fn on_fill(&mut self, venue: Venue, side: Side, qty: Decimal, px: Decimal) {
        let was_open = !self.maker.qty.is_zero();
        match venue {
            Venue::Maker => self.maker.on_fill(side, qty, px),
            Venue::Taker => self.taker.on_fill(side, qty, px),
        }
        if venue == Venue::Maker && was_open && self.maker.qty.is_zero() {
            self.round_trips += 1;
        }
    }

    pub fn realized_pnl(&self) -> Decimal { self.maker.realized_pnl + self.taker.realized_pnl }

    pub fn round_trips(&self) -> u64 { self.round_trips }

    /// Marks both venue positions at their current mids; `None` while a venue
    /// with an open position has no price.
    pub fn unrealized_pnl(&self, prices: &PriceSnapshot) -> Option<Decimal> {
        let mid = |bid: Option<Decimal>, ask: Option<Decimal>| Some((bid? + ask?) / Decimal::TWO);
        let mut total = Decimal::ZERO;
        if !self.maker.qty.is_zero() {
            total += self.maker.unrealized(mid(prices.maker_bid, prices.maker_ask)?);
        }
        if !self.taker.qty.is_zero() {
            total += self.taker.unrealized(mid(prices.taker_bid, prices.taker_ask)?);
        }
        Some(total)
    }
}
