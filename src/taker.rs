// ===============================
// src/taker.rs (taker venue REST client)
// ===============================
//
// Endpoints (all JSON, cookie `vr-token` auth):
// - POST /api/quotes/indicative  {instrument, qty}            -> {bid, ask, quote_id, mark_price?, index_price?}
// - POST /api/orders/new/market  {quote_id, side, is_reduce_only, max_slippage}
// - GET  /api/positions          -> [..] or {"positions": [..]}
//
// Quotes and positions go through the retry policy. Market orders are sent once:
// they are not idempotent and a retried order could fill twice.
//
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{Instrument, Quote};
use crate::error::{ApiError, OrderError};
use crate::gateway::{TakerAck, TakerGateway, TakerOrder, TakerPosition};
use crate::metrics::{LEGS, LEG_LATENCY, TAKER_QUOTES};
use crate::retry::{retry_with_backoff, RetryConfig};

const QUOTES_PATH: &str = "/api/quotes/indicative";
const ORDERS_PATH: &str = "/api/orders/new/market";
const POSITIONS_PATH: &str = "/api/positions";

pub struct TakerClient {
    http: reqwest::Client,
    base_url: String,
    instrument: Instrument,
    retry: RetryConfig,
}

impl TakerClient {
    pub fn new(
        base_url: &str,
        cookie: &str,
        instrument: Instrument,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&format!("vr-token={cookie}"))
            .map_err(|e| ApiError::Validation(format!("bad cookie value: {e}")))?;
        headers.insert(COOKIE, cookie);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(concat!("xvenue_arb/", env!("CARGO_PKG_VERSION"))));

        let http = reqwest::Client::builder().default_headers(headers).timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), instrument, retry })
    }

    pub async fn fetch_indicative_quote(&self, instrument: &Instrument, qty: Decimal) -> Result<Quote, ApiError> {
        if qty <= Decimal::ZERO {
            return Err(ApiError::Validation(format!("qty must be positive, got {qty}")));
        }
        let url = format!("{}{}", self.base_url, QUOTES_PATH);
        let body = json!({ "instrument": instrument, "qty": qty.normalize().to_string() });

        let (http, url, body) = (&self.http, &url, &body);
        let res = retry_with_backoff(&self.retry, "indicative quote", move || async move {
            let rsp = http.post(url).json(body).send().await?;
            parse_quote(&read_json(rsp).await?)
        })
        .await;

        TAKER_QUOTES.with_label_values(&[if res.is_ok() { "ok" } else { "err" }]).inc();
        res
    }

    /// Single attempt; see module notes.
    pub async fn submit_market_order(&self, order: &TakerOrder) -> Result<TakerAck, OrderError> {
        if order.quote_id.is_empty() {
            return Err(OrderError::MissingQuote);
        }
        let max_slippage = order
            .max_slippage
            .to_f64()
            .ok_or_else(|| ApiError::Validation(format!("max_slippage {}", order.max_slippage)))?;
        let body = json!({
            "quote_id": order.quote_id,
            "side": order.side.as_str(),
            "is_reduce_only": order.is_reduce_only,
            "max_slippage": max_slippage,
        });

        let started = Instant::now();
        let url = format!("{}{}", self.base_url, ORDERS_PATH);
        let res = async {
            let rsp = self.http.post(&url).json(&body).send().await.map_err(ApiError::from)?;
            read_json(rsp).await
        }
        .await;
        LEG_LATENCY.with_label_values(&["taker"]).observe(started.elapsed().as_secs_f64() * 1000.0);

        let payload = res?;
        let order_ref = order_ref(&payload).unwrap_or_else(|| order.quote_id.clone());
        info!(quote_id = %order.quote_id, side = order.side.as_str(), %order_ref, "taker market order accepted");
        Ok(TakerAck { order_ref, payload })
    }

    pub async fn get_all_positions(&self) -> Result<Vec<TakerPosition>, ApiError> {
        let url = format!("{}{}", self.base_url, POSITIONS_PATH);
        let (http, url) = (&self.http, &url);
        retry_with_backoff(&self.retry, "positions", move || async move {
            let rsp = http.get(url).send().await?;
            parse_positions(&read_json(rsp).await?)
        })
        .await
    }
}

#[async_trait]
impl TakerGateway for TakerClient {
    async fn fetch_quote(&self, qty: Decimal) -> Result<Quote, ApiError> {
        self.fetch_indicative_quote(&self.instrument, qty).await
    }

    async fn place_market_order(&self, order: TakerOrder) -> Result<TakerAck, OrderError> {
        let res = self.submit_market_order(&order).await;
        LEGS.with_label_values(&["taker", if res.is_ok() { "ok" } else { "err" }]).inc();
        res
    }

    async fn positions(&self) -> Result<Vec<TakerPosition>, ApiError> {
        self.get_all_positions().await
    }
}

// Non-2xx -> classified ApiError with the body text; 2xx -> parsed JSON.
async fn read_json(rsp: reqwest::Response) -> Result<Value, ApiError> {
    let status = rsp.status();
    if !status.is_success() {
        let body = rsp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), %body, "taker venue error response");
        return Err(ApiError::from_status(status.as_u16(), body));
    }
    Ok(rsp.json::<Value>().await?)
}

/// Number or numeric string; absent, null and "" are `None`.
fn decimal_field(v: &Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => parse_decimal(s.trim()),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).ok().or_else(|| Decimal::from_scientific(s).ok())
}

pub(crate) fn parse_quote(v: &Value) -> Result<Quote, ApiError> {
    let bid = decimal_field(v, "bid").ok_or_else(|| ApiError::Decode(format!("quote without bid: {v}")))?;
    let ask = decimal_field(v, "ask").ok_or_else(|| ApiError::Decode(format!("quote without ask: {v}")))?;
    let quote_id = v
        .get("quote_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Decode(format!("quote without quote_id: {v}")))?
        .to_string();
    Ok(Quote {
        bid,
        ask,
        quote_id,
        mark_price: decimal_field(v, "mark_price"),
        index_price: decimal_field(v, "index_price"),
    })
}

pub(crate) fn parse_positions(v: &Value) -> Result<Vec<TakerPosition>, ApiError> {
    let items = v
        .as_array()
        .or_else(|| v.get("positions").and_then(Value::as_array))
        .or_else(|| v.get("result").and_then(Value::as_array))
        .ok_or_else(|| ApiError::Decode(format!("unexpected positions payload: {v}")))?;

    Ok(items
        .iter()
        .filter_map(|p| {
            let instrument = match p.get("instrument") {
                Some(Value::String(s)) => s.clone(),
                Some(obj @ Value::Object(_)) => obj.get("underlying").and_then(Value::as_str)?.to_string(),
                _ => p.get("underlying").and_then(Value::as_str)?.to_string(),
            };
            let qty = decimal_field(p, "qty").or_else(|| decimal_field(p, "size"))?;
            Some(TakerPosition { instrument, qty, avg_entry_price: decimal_field(p, "avg_entry_price") })
        })
        .collect())
}

fn order_ref(payload: &Value) -> Option<String> {
    ["order_id", "id", "rfq_id"].iter().find_map(|k| match payload.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
