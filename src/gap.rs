// ===============================
// src/gap.rs
// ===============================
//
// Entry/exit signals: price divergence between the two venues, normalized by
// the mid of the two prices being compared.
//
//   entry_gap = (maker_bid - taker_ask) / mid   -> sell maker, buy taker
//   exit_gap  = (taker_bid - maker_ask) / mid   -> buy maker, sell taker
//
// `None` means "not enough data". Callers never treat it as zero.
//
use rust_decimal::Decimal;

fn normalized_gap(high_leg: Option<Decimal>, low_leg: Option<Decimal>) -> Option<Decimal> {
    let (a, b) = (high_leg?, low_leg?);
    let mid = (a + b) / Decimal::TWO;
    if mid <= Decimal::ZERO {
        return None;
    }
    (a - b).checked_div(mid)
}

pub fn entry_gap(maker_bid: Option<Decimal>, taker_ask: Option<Decimal>) -> Option<Decimal> {
    normalized_gap(maker_bid, taker_ask)
}

pub fn exit_gap(taker_bid: Option<Decimal>, maker_ask: Option<Decimal>) -> Option<Decimal> {
    normalized_gap(taker_bid, maker_ask)
}
