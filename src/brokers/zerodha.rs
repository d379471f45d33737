// =============================================================================
// Zerodha adapter — Kite Connect REST
// =============================================================================
//
// Authorization header is `token {api_key}:{access_token}`; the access token
// is minted daily by the (out-of-band) login flow and arrives via the
// account's authentication blob.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::brokers::{order_side, Broker, BrokerError, BrokerPosition, MarginInfo, OrderAck};
use crate::types::{
    AccountBalances, BrokerAuth, BrokerKind, InstrumentType, Order, OrderStatus, OrderType,
};

const KITE_BASE_URL: &str = "https://api.kite.trade";

pub struct ZerodhaBroker {
    client: reqwest::Client,
    base_url: String,
    has_credentials: bool,
    connected: RwLock<bool>,
}

impl ZerodhaBroker {
    pub fn new(auth: &BrokerAuth) -> Self {
        let api_key = auth.api_key.clone().unwrap_or_default();
        let access_token = auth.access_token.clone().unwrap_or_default();
        let has_credentials = !api_key.is_empty() && !access_token.is_empty();

        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static("3"));
        if let Ok(val) = HeaderValue::from_str(&format!("token {api_key}:{access_token}")) {
            headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: KITE_BASE_URL.to_string(),
            has_credentials,
            connected: RwLock::new(false),
        }
    }

    /// Kite wraps every payload as {"status": ..., "data": ...} and errors as
    /// {"status": "error", "message": ..., "error_type": ...}.
    async fn unwrap_response(resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to parse response: {e}")))?;

        if status.is_success() && body.get("status").and_then(|v| v.as_str()) == Some("success") {
            return Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null));
        }

        let message = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Kite error")
            .to_string();
        let error_type = body
            .get("error_type")
            .and_then(|v| v.as_str())
            .unwrap_or("GeneralException");

        Err(match error_type {
            "OrderException" | "MarginException" => BrokerError::Rejected { reason: message },
            "InputException" if message.to_lowercase().contains("instrument") => {
                BrokerError::InvalidSymbol(message)
            }
            _ => BrokerError::Api {
                code: error_type.to_string(),
                message,
            },
        })
    }

    fn map_order_type(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "SL-M",
            OrderType::StopLimit => "SL",
        }
    }
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Zerodha
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.has_credentials {
            return Err(BrokerError::Connection(
                "missing Kite api_key/access_token".into(),
            ));
        }
        let url = format!("{}/user/profile", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("Kite unreachable: {e}")))?;
        Self::unwrap_response(resp).await?;
        *self.connected.write() = true;
        debug!("Kite session validated");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// POST /orders/regular (form-encoded).
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        let exchange = order.exchange.clone().unwrap_or_else(|| "NSE".to_string());
        let mut form: Vec<(&str, String)> = vec![
            ("tradingsymbol", order.instrument.clone()),
            ("exchange", exchange),
            ("transaction_type", order_side(order).to_string()),
            ("order_type", Self::map_order_type(order.order_type).to_string()),
            ("quantity", format!("{}", order.quantity as i64)),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
            ("tag", order.order_id.clone()),
        ];
        if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
            form.push(("price", format!("{}", order.price)));
        }
        if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            form.push(("trigger_price", format!("{}", order.stop_price)));
        }

        let url = format!("{}/orders/regular", self.base_url);
        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("order submission failed: {e}")))?;

        let data = Self::unwrap_response(resp).await?;
        let broker_order_id = data
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Api {
                code: "MISSING_ORDER_ID".into(),
                message: format!("Kite response without order_id: {data}"),
            })?;

        debug!(order_id = %order.order_id, broker_order_id = %broker_order_id, "order placed on Kite");

        // Kite never fills synchronously on the placement call.
        Ok(OrderAck {
            broker_order_id,
            status: OrderStatus::Submitted,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
        })
    }

    /// DELETE /orders/regular/{order_id}.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        let url = format!("{}/orders/regular/{}", self.base_url, broker_order_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("cancel failed: {e}")))?;
        match Self::unwrap_response(resp).await {
            Ok(_) => Ok(true),
            Err(BrokerError::Api { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// GET /portfolio/positions — net day positions.
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/portfolio/positions", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("positions fetch failed: {e}")))?;
        let data = Self::unwrap_response(resp).await?;

        let mut positions = Vec::new();
        if let Some(net) = data.get("net").and_then(|v| v.as_array()) {
            for entry in net {
                let quantity = entry.get("quantity").and_then(|v| v.as_f64()).unwrap_or(0.0);
                if quantity == 0.0 {
                    continue;
                }
                positions.push(BrokerPosition {
                    instrument: entry
                        .get("tradingsymbol")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    quantity,
                    avg_price: entry
                        .get("average_price")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                    unrealized_pnl: entry.get("pnl").and_then(|v| v.as_f64()).unwrap_or(0.0),
                });
            }
        }
        Ok(positions)
    }

    /// GET /user/margins — equity segment.
    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
        let url = format!("{}/user/margins", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("margins fetch failed: {e}")))?;
        let data = Self::unwrap_response(resp).await?;
        let equity_segment = data.get("equity").cloned().unwrap_or_default();

        let net = equity_segment.get("net").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let cash = equity_segment
            .get("available")
            .and_then(|v| v.get("cash"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let used = equity_segment
            .get("utilised")
            .and_then(|v| v.get("debits"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        Ok(AccountBalances {
            equity: net,
            cash_balance: cash,
            margin_used: used,
            margin_available: (net - used).max(0.0),
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin_utilization_pct: AccountBalances::utilization_pct(used, net),
        })
    }

    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
        let balances = self.get_account_balance().await?;
        Ok(MarginInfo {
            margin_used: balances.margin_used,
            margin_available: balances.margin_available,
        })
    }

    /// GET /orders — open (non-terminal) order ids.
    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
        let url = format!("{}/orders", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("orders fetch failed: {e}")))?;
        let data = Self::unwrap_response(resp).await?;

        Ok(data
            .as_array()
            .map(|orders| {
                orders
                    .iter()
                    .filter(|o| {
                        matches!(
                            o.get("status").and_then(|v| v.as_str()),
                            Some("OPEN") | Some("TRIGGER PENDING") | Some("AMO REQ RECEIVED")
                        )
                    })
                    .filter_map(|o| o.get("order_id").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// NSE lots are whole units across the board.
    async fn get_quantity_precision(
        &self,
        _symbol: &str,
        _instrument_type: InstrumentType,
    ) -> Result<u32, BrokerError> {
        Ok(0)
    }
}

impl std::fmt::Debug for ZerodhaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZerodhaBroker")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_mapping() {
        assert_eq!(ZerodhaBroker::map_order_type(OrderType::Market), "MARKET");
        assert_eq!(ZerodhaBroker::map_order_type(OrderType::Limit), "LIMIT");
        assert_eq!(ZerodhaBroker::map_order_type(OrderType::Stop), "SL-M");
        assert_eq!(ZerodhaBroker::map_order_type(OrderType::StopLimit), "SL");
    }

    #[test]
    fn missing_credentials_detected_at_construction() {
        let broker = ZerodhaBroker::new(&BrokerAuth::default());
        assert!(!broker.has_credentials);
        assert!(!broker.is_connected());
    }
}
