// =============================================================================
// Binance adapter — HMAC-SHA256 signed REST, mapped to the Broker contract
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the router and Binance servers.
//
// Binance error bodies ({"code": -2010, "msg": "..."}) are mapped onto the
// typed broker errors: -2010/-1013 order rejections, -1121 invalid symbol,
// everything else a generic API error carrying the code.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::brokers::{order_side, Broker, BrokerError, BrokerPosition, MarginInfo, OrderAck};
use crate::types::{
    AccountBalances, BrokerAuth, BrokerKind, InstrumentType, Order, OrderStatus, OrderType,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub struct BinanceBroker {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    connected: RwLock<bool>,
}

impl BinanceBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(auth: &BrokerAuth) -> Self {
        let api_key = auth.api_key.clone().unwrap_or_default();
        let secret = auth.api_secret.clone().unwrap_or_default();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
            connected: RwLock::new(false),
        }
    }

    #[cfg(test)]
    fn with_base_url(auth: &BrokerAuth, base_url: impl Into<String>) -> Self {
        let mut broker = Self::new(auth);
        broker.base_url = base_url.into();
        broker
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Error mapping
    // -------------------------------------------------------------------------

    /// Map a non-success Binance response body onto a typed broker error.
    fn map_api_error(status: reqwest::StatusCode, body: &serde_json::Value) -> BrokerError {
        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("no message")
            .to_string();

        match code {
            // -2010 NEW_ORDER_REJECTED, -1013 invalid quantity/price filters.
            -2010 | -1013 => BrokerError::Rejected { reason: msg },
            -1121 => BrokerError::InvalidSymbol(msg),
            0 => BrokerError::Api {
                code: status.to_string(),
                message: msg,
            },
            other => BrokerError::Api {
                code: other.to_string(),
                message: msg,
            },
        }
    }

    async fn read_body(resp: reqwest::Response) -> Result<(reqwest::StatusCode, serde_json::Value), BrokerError> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to parse response: {e}")))?;
        Ok((status, body))
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value, BrokerError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("GET {path} failed: {e}")))?;
        let (status, body) = Self::read_body(resp).await?;
        if !status.is_success() {
            return Err(Self::map_api_error(status, &body));
        }
        Ok(body)
    }

    /// Quantity formatted without scientific notation or a trailing dot.
    fn format_quantity(quantity: f64) -> String {
        let formatted = format!("{quantity:.8}");
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }

    /// Number of decimals implied by a LOT_SIZE step string like "0.00100000".
    fn step_size_decimals(step: &str) -> u32 {
        match step.split('.').nth(1) {
            Some(frac) => match frac.find('1') {
                Some(idx) => idx as u32 + 1,
                None => 0,
            },
            None => 0,
        }
    }
}

#[async_trait]
impl Broker for BinanceBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Binance
    }

    /// GET /api/v3/ping, then validate credentials with a signed account
    /// call.
    #[instrument(skip(self), name = "binance::connect")]
    async fn connect(&self) -> Result<(), BrokerError> {
        let url = format!("{}/api/v3/ping", self.base_url);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("ping failed: {e}")))?;

        if self.api_key.is_empty() || self.secret.is_empty() {
            return Err(BrokerError::Connection(
                "missing Binance API credentials".into(),
            ));
        }

        self.signed_get("/api/v3/account", "").await?;
        *self.connected.write() = true;
        debug!("Binance session established");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// POST /api/v3/order (signed).
    #[instrument(skip(self, order), fields(order_id = %order.order_id), name = "binance::place_order")]
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        let side = order_side(order);
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            order.instrument,
            side,
            match order.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
                OrderType::Stop => "STOP_LOSS",
                OrderType::StopLimit => "STOP_LOSS_LIMIT",
            },
            Self::format_quantity(order.quantity)
        );

        if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
            params.push_str(&format!("&price={}&timeInForce=GTC", order.price));
        }
        if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) && order.stop_price > 0.0 {
            params.push_str(&format!("&stopPrice={}", order.stop_price));
        }
        params.push_str(&format!("&newClientOrderId={}", order.order_id));

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol = %order.instrument, side, quantity = order.quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("POST /api/v3/order failed: {e}")))?;
        let (status, body) = Self::read_body(resp).await?;
        if !status.is_success() {
            return Err(Self::map_api_error(status, &body));
        }

        let broker_order_id = body
            .get("orderId")
            .and_then(|v| v.as_u64())
            .map(|id| id.to_string())
            .ok_or_else(|| BrokerError::Api {
                code: "MISSING_ORDER_ID".into(),
                message: format!("order response without orderId: {body}"),
            })?;

        let executed_qty: f64 = body
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let cumulative_quote: f64 = body
            .get("cummulativeQuoteQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let avg_fill_price = if executed_qty > 0.0 {
            cumulative_quote / executed_qty
        } else {
            0.0
        };

        let status = match body.get("status").and_then(|v| v.as_str()) {
            Some("FILLED") => OrderStatus::Filled,
            Some("PARTIALLY_FILLED") => OrderStatus::PartiallyFilled,
            Some("REJECTED") => {
                return Err(BrokerError::Rejected {
                    reason: "order rejected by exchange".into(),
                })
            }
            Some("CANCELED") => OrderStatus::Cancelled,
            _ => OrderStatus::Submitted,
        };

        debug!(broker_order_id = %broker_order_id, ?status, executed_qty, "order placed");

        Ok(OrderAck {
            broker_order_id,
            status,
            filled_quantity: executed_qty,
            avg_fill_price,
        })
    }

    /// DELETE /api/v3/order (signed). The symbol is unknown at this layer,
    /// so the origClientOrderId lookup path is used via openOrders.
    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        // Find the working order to recover its symbol.
        let open = self.signed_get("/api/v3/openOrders", "").await?;
        let Some(entry) = open.as_array().and_then(|orders| {
            orders.iter().find(|o| {
                o.get("orderId")
                    .and_then(|v| v.as_u64())
                    .map(|id| id.to_string())
                    .as_deref()
                    == Some(broker_order_id)
            })
        }) else {
            warn!(broker_order_id, "cancel: order not found among open orders");
            return Ok(false);
        };
        let symbol = entry
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let params = format!("symbol={symbol}&orderId={broker_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("DELETE /api/v3/order failed: {e}")))?;
        let (status, body) = Self::read_body(resp).await?;
        if !status.is_success() {
            return Err(Self::map_api_error(status, &body));
        }

        debug!(broker_order_id, symbol = %symbol, "order cancelled");
        Ok(true)
    }

    /// Spot "positions" are the non-zero, non-quote asset balances.
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let account = self.signed_get("/api/v3/account", "").await?;
        let balances = account
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BrokerError::Api {
                code: "BAD_RESPONSE".into(),
                message: "account response missing balances".into(),
            })?;

        let mut positions = Vec::new();
        for entry in balances {
            let asset = entry.get("asset").and_then(|v| v.as_str()).unwrap_or("");
            let free: f64 = entry
                .get("free")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let locked: f64 = entry
                .get("locked")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let total = free + locked;
            if total > 0.0 && asset != "USDT" && asset != "BUSD" {
                positions.push(BrokerPosition {
                    instrument: format!("{asset}USDT"),
                    quantity: total,
                    avg_price: 0.0,
                    unrealized_pnl: 0.0,
                });
            }
        }
        Ok(positions)
    }

    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
        let account = self.signed_get("/api/v3/account", "").await?;
        let mut cash = 0.0;
        if let Some(balances) = account.get("balances").and_then(|v| v.as_array()) {
            for entry in balances {
                let asset = entry.get("asset").and_then(|v| v.as_str()).unwrap_or("");
                if asset == "USDT" || asset == "BUSD" {
                    let free: f64 = entry
                        .get("free")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    let locked: f64 = entry
                        .get("locked")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    cash += free + locked;
                }
            }
        }

        Ok(AccountBalances {
            equity: cash,
            cash_balance: cash,
            margin_used: 0.0,
            margin_available: cash,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin_utilization_pct: 0.0,
        })
    }

    /// Spot trading is unleveraged; margin equals free cash.
    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
        let balances = self.get_account_balance().await?;
        Ok(MarginInfo {
            margin_used: balances.margin_used,
            margin_available: balances.margin_available,
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
        let body = self.signed_get("/api/v3/openOrders", "").await?;
        Ok(body
            .as_array()
            .map(|orders| {
                orders
                    .iter()
                    .filter_map(|o| o.get("orderId").and_then(|v| v.as_u64()))
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// GET /api/v3/exchangeInfo — quantity precision from the LOT_SIZE
    /// filter's stepSize.
    #[instrument(skip(self), name = "binance::get_quantity_precision")]
    async fn get_quantity_precision(
        &self,
        symbol: &str,
        instrument_type: InstrumentType,
    ) -> Result<u32, BrokerError> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("GET exchangeInfo failed: {e}")))?;
        let (status, body) = Self::read_body(resp).await?;
        if !status.is_success() {
            return Err(Self::map_api_error(status, &body));
        }

        let info = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| BrokerError::InvalidSymbol(symbol.to_string()))?;

        let step = info
            .get("filters")
            .and_then(|v| v.as_array())
            .and_then(|filters| {
                filters.iter().find(|f| {
                    f.get("filterType").and_then(|v| v.as_str()) == Some("LOT_SIZE")
                })
            })
            .and_then(|f| f.get("stepSize"))
            .and_then(|v| v.as_str());

        let precision = match step {
            Some(step) => Self::step_size_decimals(step),
            None => match instrument_type {
                InstrumentType::Crypto => 8,
                _ => 0,
            },
        };

        debug!(symbol, precision, "quantity precision resolved");
        Ok(precision)
    }
}

impl std::fmt::Debug for BinanceBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceBroker")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
