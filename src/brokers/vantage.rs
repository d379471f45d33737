// =============================================================================
// Vantage adapter — bearer-token REST
// =============================================================================
//
// Vantage exposes a conventional JSON API for its CFD/forex accounts. The
// access token and API host come from the account's authentication blob.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::brokers::{order_side, Broker, BrokerError, BrokerPosition, MarginInfo, OrderAck};
use crate::types::{
    AccountBalances, BrokerAuth, BrokerKind, InstrumentType, Order, OrderStatus, OrderType,
};

pub struct VantageBroker {
    client: reqwest::Client,
    base_url: String,
    has_credentials: bool,
    connected: RwLock<bool>,
}

impl VantageBroker {
    pub fn new(auth: &BrokerAuth) -> Self {
        let token = auth.access_token.clone().unwrap_or_default();
        let host = auth
            .host
            .clone()
            .unwrap_or_else(|| "api.vantagemarkets.com".into());

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: format!("https://{host}/api/v1"),
            has_credentials: !token.is_empty(),
            connected: RwLock::new(false),
        }
    }

    async fn unwrap_response(resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to parse response: {e}")))?;
        if status.is_success() {
            return Ok(body);
        }
        let message = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Vantage error")
            .to_string();
        Err(match status.as_u16() {
            400 | 422 => BrokerError::Rejected { reason: message },
            404 => BrokerError::InvalidSymbol(message),
            _ => BrokerError::Api {
                code: status.to_string(),
                message,
            },
        })
    }
}

#[async_trait]
impl Broker for VantageBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Vantage
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.has_credentials {
            return Err(BrokerError::Connection("missing Vantage access token".into()));
        }
        let url = format!("{}/account", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("Vantage unreachable: {e}")))?;
        Self::unwrap_response(resp).await?;
        *self.connected.write() = true;
        debug!("Vantage session validated");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        let payload = serde_json::json!({
            "symbol": order.instrument,
            "side": order_side(order),
            "type": order.order_type.to_string(),
            "volume": order.quantity,
            "price": if order.order_type == OrderType::Market { None } else { Some(order.price) },
            "stop_price": if order.stop_price > 0.0 { Some(order.stop_price) } else { None },
            "client_ref": order.order_id,
        });

        let url = format!("{}/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("order submission failed: {e}")))?;
        let body = Self::unwrap_response(resp).await?;

        let broker_order_id = body
            .get("order_id")
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .ok_or_else(|| BrokerError::Api {
                code: "MISSING_ORDER_ID".into(),
                message: format!("Vantage response without order_id: {body}"),
            })?;

        let filled_quantity = body
            .get("filled_volume")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let avg_fill_price = body
            .get("avg_fill_price")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let status = match body.get("status").and_then(|v| v.as_str()) {
            Some("filled") => OrderStatus::Filled,
            Some("partially_filled") => OrderStatus::PartiallyFilled,
            _ => OrderStatus::Submitted,
        };

        debug!(order_id = %order.order_id, broker_order_id = %broker_order_id, ?status, "order placed on Vantage");

        Ok(OrderAck {
            broker_order_id,
            status,
            filled_quantity,
            avg_fill_price,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, broker_order_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("cancel failed: {e}")))?;
        match Self::unwrap_response(resp).await {
            Ok(_) => Ok(true),
            Err(BrokerError::InvalidSymbol(_)) | Err(BrokerError::Api { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/positions", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("positions fetch failed: {e}")))?;
        let body = Self::unwrap_response(resp).await?;

        Ok(body
            .get("positions")
            .and_then(|v| v.as_array())
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| BrokerPosition {
                        instrument: p
                            .get("symbol")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        quantity: p.get("volume").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        avg_price: p.get("open_price").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        unrealized_pnl: p.get("profit").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
        let url = format!("{}/account", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("account fetch failed: {e}")))?;
        let body = Self::unwrap_response(resp).await?;

        let equity = body.get("equity").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let balance = body.get("balance").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let margin_used = body.get("margin").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let free_margin = body
            .get("free_margin")
            .and_then(|v| v.as_f64())
            .unwrap_or((equity - margin_used).max(0.0));

        Ok(AccountBalances {
            equity,
            cash_balance: balance,
            margin_used,
            margin_available: free_margin,
            unrealized_pnl: equity - balance,
            realized_pnl: 0.0,
            margin_utilization_pct: AccountBalances::utilization_pct(margin_used, equity),
        })
    }

    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
        let balances = self.get_account_balance().await?;
        Ok(MarginInfo {
            margin_used: balances.margin_used,
            margin_available: balances.margin_available,
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
        let url = format!("{}/orders?status=working", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("orders fetch failed: {e}")))?;
        let body = Self::unwrap_response(resp).await?;
        Ok(body
            .get("orders")
            .and_then(|v| v.as_array())
            .map(|orders| {
                orders
                    .iter()
                    .filter_map(|o| o.get("order_id"))
                    .map(|v| match v.as_str() {
                        Some(s) => s.to_string(),
                        None => v.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Forex volume is quoted in whole units; crypto CFDs take 8 decimals.
    async fn get_quantity_precision(
        &self,
        _symbol: &str,
        instrument_type: InstrumentType,
    ) -> Result<u32, BrokerError> {
        Ok(match instrument_type {
            InstrumentType::Crypto => 8,
            _ => 0,
        })
    }
}

impl std::fmt::Debug for VantageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VantageBroker")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}
