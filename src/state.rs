// ===============================
// src/state.rs
// ===============================
//
// PriceSnapshot : latest prices from both venues. Maker fields are written by
//                 the maker feed path only, taker fields by the poll path only.
// Book          : everything behind the execution guard (position state,
//                 open qty, resting order, unbalanced alarm, PnL ledger).
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{ActiveOrder, BookTop, PositionState, PositionView, Quote, UnbalancedReport};
use crate::gap::{entry_gap, exit_gap};
use crate::positions::PnlLedger;

#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    pub maker_bid: Option<Decimal>,
    pub maker_ask: Option<Decimal>,
    pub taker_bid: Option<Decimal>,
    pub taker_ask: Option<Decimal>,
    pub taker_quote: Option<Quote>,
    pub maker_updated_at: Option<DateTime<Utc>>,
    pub taker_updated_at: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    /// Returns true when either side of the maker book moved.
    pub fn apply_maker(&mut self, top: BookTop) -> bool {
        let changed = self.maker_bid != Some(top.best_bid) || self.maker_ask != Some(top.best_ask);
        self.maker_bid = Some(top.best_bid);
        self.maker_ask = Some(top.best_ask);
        self.maker_updated_at = Some(Utc::now());
        changed
    }

    pub fn apply_taker(&mut self, quote: Quote) {
        self.taker_bid = Some(quote.bid);
        self.taker_ask = Some(quote.ask);
        self.taker_quote = Some(quote);
        self.taker_updated_at = Some(Utc::now());
    }

    pub fn entry_gap(&self) -> Option<Decimal> { entry_gap(self.maker_bid, self.taker_ask) }

    pub fn exit_gap(&self) -> Option<Decimal> { exit_gap(self.taker_bid, self.maker_ask) }
}

/// State owned by the execution guard.
#[derive(Debug, Default)]
pub struct Book {
    pub state: PositionState,
    /// open maker-side qty (short on the maker venue, long on the taker venue)
    pub qty: Decimal,
    pub maker_order_id: Option<String>,
    pub active_order: Option<ActiveOrder>,
    pub unbalanced: Option<UnbalancedReport>,
    /// maker ids of dual-leg market orders and the qty still to be reported
    /// filled; their fills are already hedged
    pub own_orders: HashMap<String, Decimal>,
    pub ledger: PnlLedger,
}

impl Book {
    pub fn view(&self, prices: &PriceSnapshot) -> PositionView {
        PositionView {
            state: self.state,
            qty: self.qty,
            maker_order_id: self.maker_order_id.clone(),
            active_order: self.active_order.clone(),
            unbalanced: self.unbalanced.clone(),
            realized_pnl: self.ledger.realized_pnl(),
            unrealized_pnl: self.ledger.unrealized_pnl(prices),
            round_trips: self.ledger.round_trips(),
            entry_gap: prices.entry_gap(),
            exit_gap: prices.exit_gap(),
        }
    }

    pub fn track_own_order(&mut self, client_order_id: String, qty: Decimal) {
        self.own_orders.insert(client_order_id, qty);
    }

    /// True when the fill belongs to a dual-leg order. The id is forgotten once
    /// its whole qty has been reported.
    pub fn settle_own_fill(&mut self, client_order_id: &str, qty: Decimal) -> bool {
        let Some(left) = self.own_orders.get_mut(client_order_id) else {
            return false;
        };
        *left -= qty;
        if *left <= Decimal::ZERO {
            self.own_orders.remove(client_order_id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn maker_update_reports_changes_only() {
        let mut p = PriceSnapshot::default();
        let top = BookTop { best_bid: dec!(100), best_ask: dec!(100.5) };
        assert!(p.apply_maker(top));
        assert!(!p.apply_maker(top));
        assert!(p.apply_maker(BookTop { best_bid: dec!(100), best_ask: dec!(100.6) }));
    }

    #[test]
    fn gaps_need_both_venues() {
        let mut p = PriceSnapshot::default();
        p.apply_maker(BookTop { best_bid: dec!(100), best_ask: dec!(100.1) });
        assert_eq!(p.entry_gap(), None);
        assert_eq!(p.exit_gap(), None);
        p.apply_taker(Quote { bid: dec!(99.8), ask: dec!(99.9), quote_id: "q1".into(), mark_price: None, index_price: None });
        assert!(p.entry_gap().unwrap() > Decimal::ZERO);
        assert!(p.exit_gap().unwrap() < Decimal::ZERO);
    }

    #[test]
    fn own_orders_are_forgotten_once_filled() {
        let mut b = Book::default();
        b.track_own_order("a".into(), dec!(1.0));
        assert!(b.settle_own_fill("a", dec!(0.4)));
        assert_eq!(b.own_orders.get("a"), Some(&dec!(0.6)));
        assert!(b.settle_own_fill("a", dec!(0.6)));
        assert!(b.own_orders.is_empty());
        // unknown and already settled ids are not ours
        assert!(!b.settle_own_fill("a", dec!(0.1)));
        assert!(!b.settle_own_fill("b", dec!(0.1)));
    }
}
