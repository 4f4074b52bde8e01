// ===============================
// src/binance.rs
// ===============================
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;

use crate::domain::{BookTop, MakerFill};
use crate::error::ApiError;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, ApiError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Validation(format!("HMAC key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` with url-encoded values, in the given order.
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- bookTicker ----
// {"e":"bookTicker","u":400900217,"s":"BTCUSDT","b":"25.35190000","B":"31.21","a":"25.36520000","A":"40.66"}
#[derive(Debug, Deserialize)]
struct BookTicker {
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "a")]
    ask: String,
}

pub fn parse_book_ticker(txt: &str) -> Option<BookTop> {
    let t: BookTicker = serde_json::from_str(txt).ok()?;
    let best_bid = Decimal::from_str(&t.bid).ok()?;
    let best_ask = Decimal::from_str(&t.ask).ok()?;
    (best_bid > Decimal::ZERO && best_ask > Decimal::ZERO).then_some(BookTop { best_bid, best_ask })
}

// ---- Minimal user-data stream models ----
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    #[serde(default)]
    pub e: Option<String>,
    #[serde(rename = "o", default)]
    pub o: Option<OrderTradeUpdate>,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
pub struct OrderTradeUpdate {
    pub s: String, // symbol
    pub c: String, // clientOrderId
    pub S: String, // side: BUY / SELL
    pub x: String, // execution type: NEW, TRADE, CANCELED, ...
    #[serde(default)]
    pub L: Option<String>, // last filled price
    #[serde(default)]
    pub l: Option<String>, // last filled qty
    #[serde(default)]
    pub z: Option<String>, // cum filled qty
}

/// Trade executions only; other order updates yield `None`.
pub fn parse_fill(txt: &str, symbol: &str) -> Option<MakerFill> {
    let env: WsEnvelope = serde_json::from_str(txt).ok()?;
    if env.e.as_deref() != Some("ORDER_TRADE_UPDATE") {
        return None;
    }
    let o = env.o?;
    if o.x != "TRADE" || !o.s.eq_ignore_ascii_case(symbol) {
        return None;
    }
    let qty = Decimal::from_str(o.l.as_deref()?).ok()?;
    Some(MakerFill {
        qty,
        is_buyer: o.S == "BUY",
        client_order_id: o.c,
        price: o.L.as_deref().and_then(|p| Decimal::from_str(p).ok()),
        cumulative_qty: o.z.as_deref().and_then(|z| Decimal::from_str(z).ok()),
    })
}
