// ===============================
// src/gateway_binance.rs
// ===============================
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, Duration},
};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::binance::{build_query, parse_fill, sign_query, timestamp_ms};
use crate::domain::{MarketEvent, Side};
use crate::error::{ApiError, OrderError};
use crate::gateway::{MakerGateway, MakerOrder};
use crate::metrics::{BIN_LISTEN_KEEPALIVE, BIN_WS_CONNECTED, BIN_WS_RECONNECTS, LEGS, LEG_LATENCY};

const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";
const ORDER_PATH: &str = "/fapi/v1/order";
// listenKey expires after 60 min without a keepalive
const KEEPALIVE_EVERY: Duration = Duration::from_secs(30 * 60);

/// Binance USDⓈ-M futures maker venue (signed REST order entry).
pub struct BinanceMaker {
    http: reqwest::Client,
    rest_base: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
    symbol: String,
}

impl BinanceMaker {
    pub fn new(
        rest_base: &str,
        api_key: &str,
        api_secret: &str,
        recv_window: u64,
        symbol: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            recv_window,
            symbol: symbol.to_ascii_uppercase(),
        })
    }

    // Signed request: params + timestamp + recvWindow, then signature last.
    async fn signed(&self, method: Method, path: &str, mut params: Vec<(&str, String)>) -> Result<Value, ApiError> {
        params.push(("timestamp", timestamp_ms().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = build_query(&params);
        let sig = sign_query(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.rest_base, path, query, sig);

        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            tracing::error!(%status, %body, path, "binance request failed");
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(rsp.json::<Value>().await?)
    }

    // listenKey endpoints take the API key header only, no signature.
    async fn listen_key_call(&self, method: Method) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.rest_base, LISTEN_KEY_PATH);
        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(rsp.json::<Value>().await?)
    }

    pub async fn create_listen_key(&self) -> Result<String, ApiError> {
        let v = self.listen_key_call(Method::POST).await?;
        v.get("listenKey")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode(format!("no listenKey in {v}")))
    }

    pub async fn keepalive_listen_key(&self) -> Result<(), ApiError> {
        self.listen_key_call(Method::PUT).await.map(|_| ())
    }

    async fn place(&self, order: &MakerOrder, cl_id: &str) -> Result<String, OrderError> {
        let side = match order.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", side.to_string()),
            ("quantity", order.qty.normalize().to_string()),
            ("newClientOrderId", cl_id.to_string()),
        ];
        match order.price {
            None => params.push(("type", "MARKET".to_string())),
            Some(px) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("price", px.normalize().to_string()));
                // GTX = post-only: rejected instead of crossing the book
                params.push(("timeInForce", if order.post_only { "GTX" } else { "GTC" }.to_string()));
            }
        }
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let v = self.signed(Method::POST, ORDER_PATH, params).await?;
        // GTX orders that would cross come back as EXPIRED rather than an error
        if v.get("status").and_then(Value::as_str) == Some("EXPIRED") {
            return Err(OrderError::Rejected(format!("post-only order {cl_id} would cross")));
        }
        Ok(v.get("clientOrderId").and_then(Value::as_str).unwrap_or(cl_id).to_string())
    }
}

#[async_trait]
impl MakerGateway for BinanceMaker {
    async fn place_order(&self, order: MakerOrder) -> Result<String, OrderError> {
        let cl_id = order.resolve_client_order_id();
        let started = Instant::now();
        let res = self.place(&order, &cl_id).await;
        LEG_LATENCY.with_label_values(&["maker"]).observe(started.elapsed().as_secs_f64() * 1000.0);
        LEGS.with_label_values(&["maker", if res.is_ok() { "ok" } else { "err" }]).inc();
        match &res {
            Ok(id) => tracing::info!(cl_id = %id, side = order.side.as_str(), qty = %order.qty, "order sent OK"),
            Err(e) => tracing::error!(%cl_id, error = %e, "order send failed"),
        }
        res
    }

    async fn cancel_order(&self, client_order_id: &str) -> Result<(), OrderError> {
        let params = vec![("symbol", self.symbol.clone()), ("origClientOrderId", client_order_id.to_string())];
        self.signed(Method::DELETE, ORDER_PATH, params).await?;
        tracing::info!(%client_order_id, "order cancelled");
        Ok(())
    }
}

/// Private fill stream: listenKey + keepalive + WS reconnect loop.
/// Trade executions are forwarded as `MarketEvent::MakerFill`.
pub async fn run_user_stream(
    maker: Arc<BinanceMaker>,
    ws_base: String,
    events_tx: mpsc::Sender<MarketEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listen_key = match maker.create_listen_key().await {
        Ok(k) => k,
        Err(e) => {
            tracing::error!(error = %e, "create listenKey failed, fills will not be hedged");
            return;
        }
    };

    let keepalive = {
        let maker = maker.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(KEEPALIVE_EVERY) => {}
                    _ = shutdown.changed() => return,
                }
                match maker.keepalive_listen_key().await {
                    Ok(()) => BIN_LISTEN_KEEPALIVE.with_label_values(&["ok"]).inc(),
                    Err(e) => {
                        BIN_LISTEN_KEEPALIVE.with_label_values(&["err"]).inc();
                        tracing::warn!(error = %e, "listenKey keepalive failed");
                    }
                }
            }
        })
    };

    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), listen_key);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(?e, "bad userDataStream url");
            keepalive.abort();
            return;
        }
    };

    loop {
        tracing::info!("connecting userDataStream");
        match connect_async(url.clone()).await {
            Ok((mut ws, _)) => {
                BIN_WS_CONNECTED.with_label_values(&["user"]).set(1);
                loop {
                    let msg = tokio::select! {
                        m = ws.next() => m,
                        _ = shutdown.changed() => {
                            BIN_WS_CONNECTED.with_label_values(&["user"]).set(0);
                            keepalive.abort();
                            return;
                        }
                    };
                    match msg {
                        Some(Ok(m)) if m.is_text() => {
                            let txt = m.into_text().unwrap_or_default();
                            if let Some(fill) = parse_fill(&txt, &maker.symbol) {
                                tracing::info!(cl_id = %fill.client_order_id, qty = %fill.qty, buyer = fill.is_buyer, "maker fill");
                                // fills must not be dropped: await capacity
                                if events_tx.send(MarketEvent::MakerFill(fill)).await.is_err() {
                                    keepalive.abort();
                                    return;
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(?e, "userDataStream ws error");
                            break;
                        }
                        None => break,
                    }
                }
                BIN_WS_CONNECTED.with_label_values(&["user"]).set(0);
                tracing::warn!("userDataStream disconnected, reconnecting");
            }
            Err(e) => tracing::error!(?e, "connect userDataStream failed"),
        }
        BIN_WS_RECONNECTS.with_label_values(&["user"]).inc();
        tokio::select! {
            _ = sleep(Duration::from_secs(2)) => {}
            _ = shutdown.changed() => {
                keepalive.abort();
                return;
            }
        }
    }
}
