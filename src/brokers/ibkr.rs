// =============================================================================
// IBKR adapter — Client Portal gateway REST
// =============================================================================
//
// Talks to a locally running Client Portal gateway (default
// https://127.0.0.1:5000/v1/api). The gateway owns the TWS session; this
// adapter validates the session on connect and keeps order ids returned by
// /iserver for cancellation.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::brokers::{order_side, Broker, BrokerError, BrokerPosition, MarginInfo, OrderAck};
use crate::types::{
    AccountBalances, BrokerAuth, BrokerKind, InstrumentType, Order, OrderStatus, OrderType,
};

pub struct IbkrBroker {
    account_id: String,
    base_url: String,
    client: reqwest::Client,
    connected: RwLock<bool>,
}

impl IbkrBroker {
    pub fn new(account_id: &str, auth: &BrokerAuth) -> Self {
        let host = auth.host.clone().unwrap_or_else(|| "127.0.0.1".into());
        let port = auth.port.unwrap_or(5000);

        // The gateway serves a self-signed certificate on localhost.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            account_id: account_id.to_string(),
            base_url: format!("https://{host}:{port}/v1/api"),
            client,
            connected: RwLock::new(false),
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("GET {path} failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to parse {path} response: {e}")))?;
        if !status.is_success() {
            return Err(BrokerError::Api {
                code: status.to_string(),
                message: body.to_string(),
            });
        }
        Ok(body)
    }

    fn map_order_type(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
            OrderType::Stop => "STP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }

    fn map_sec_type(instrument_type: InstrumentType) -> &'static str {
        match instrument_type {
            InstrumentType::Stock | InstrumentType::Etf => "STK",
            InstrumentType::Option => "OPT",
            InstrumentType::Future => "FUT",
            InstrumentType::Forex => "CASH",
            InstrumentType::Crypto => "CRYPTO",
        }
    }
}

#[async_trait]
impl Broker for IbkrBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Ibkr
    }

    /// POST /tickle validates and keeps the gateway session alive.
    async fn connect(&self) -> Result<(), BrokerError> {
        let url = format!("{}/tickle", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("gateway unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(BrokerError::Connection(format!(
                "gateway session invalid: {}",
                resp.status()
            )));
        }

        let auth_status = self.get_json("/iserver/auth/status").await?;
        let authenticated = auth_status
            .get("authenticated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !authenticated {
            return Err(BrokerError::Connection(
                "gateway session not authenticated — log in to Client Portal".into(),
            ));
        }

        *self.connected.write() = true;
        debug!(account_id = %self.account_id, "IBKR gateway session validated");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// POST /iserver/account/{accountId}/orders.
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        let mut native = serde_json::json!({
            "acctId": self.account_id,
            "conidex": format!("@SMART:{}", order.instrument),
            "secType": Self::map_sec_type(order.instrument_type),
            "cOID": order.order_id,
            "orderType": Self::map_order_type(order.order_type),
            "side": order_side(order),
            "quantity": order.quantity,
            "tif": "DAY",
        });
        if matches!(order.order_type, OrderType::Limit | OrderType::StopLimit) {
            native["price"] = serde_json::json!(order.price);
        }
        if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            native["auxPrice"] = serde_json::json!(order.stop_price);
        }

        let url = format!("{}/iserver/account/{}/orders", self.base_url, self.account_id);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "orders": [native] }))
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("order submission failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to parse order response: {e}")))?;

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("order submission failed")
                .to_string();
            // The gateway reports contract-resolution failures as errors.
            if message.to_lowercase().contains("contract") {
                return Err(BrokerError::InvalidSymbol(order.instrument.clone()));
            }
            return Err(BrokerError::Rejected { reason: message });
        }

        let entry = body
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(body);

        let broker_order_id = entry
            .get("order_id")
            .or_else(|| entry.get("id"))
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .ok_or_else(|| BrokerError::Api {
                code: "MISSING_ORDER_ID".into(),
                message: format!("gateway response without order id: {entry}"),
            })?;

        // The gateway acks asynchronously; fills arrive on later polls.
        debug!(order_id = %order.order_id, broker_order_id = %broker_order_id, "order submitted to gateway");
        Ok(OrderAck {
            broker_order_id,
            status: OrderStatus::Submitted,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
        })
    }

    /// DELETE /iserver/account/{accountId}/order/{orderId}.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        let url = format!(
            "{}/iserver/account/{}/order/{}",
            self.base_url, self.account_id, broker_order_id
        );
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(format!("cancel failed: {e}")))?;

        if resp.status().is_success() {
            debug!(broker_order_id, "order cancel submitted");
            Ok(true)
        } else {
            warn!(broker_order_id, status = %resp.status(), "cancel refused by gateway");
            Ok(false)
        }
    }

    /// GET /portfolio/{accountId}/positions/0.
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let body = self
            .get_json(&format!("/portfolio/{}/positions/0", self.account_id))
            .await?;
        let mut positions = Vec::new();
        if let Some(arr) = body.as_array() {
            for entry in arr {
                let quantity = entry.get("position").and_then(|v| v.as_f64()).unwrap_or(0.0);
                if quantity == 0.0 {
                    continue;
                }
                positions.push(BrokerPosition {
                    instrument: entry
                        .get("contractDesc")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    quantity,
                    avg_price: entry.get("avgCost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    unrealized_pnl: entry
                        .get("unrealizedPnl")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                });
            }
        }
        Ok(positions)
    }

    /// GET /portfolio/{accountId}/ledger.
    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
        let ledger = self
            .get_json(&format!("/portfolio/{}/ledger", self.account_id))
            .await?;
        let base = ledger.get("BASE").cloned().unwrap_or(ledger);

        let equity = base
            .get("netliquidationvalue")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let cash = base.get("cashbalance").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let unrealized = base
            .get("unrealizedpnl")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let realized = base.get("realizedpnl").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let margin = self.get_margin_info().await.unwrap_or_default();

        Ok(AccountBalances {
            equity,
            cash_balance: cash,
            margin_used: margin.margin_used,
            margin_available: margin.margin_available,
            unrealized_pnl: unrealized,
            realized_pnl: realized,
            margin_utilization_pct: AccountBalances::utilization_pct(margin.margin_used, equity),
        })
    }

    /// GET /iserver/account/{accountId}/summary.
    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
        let summary = self
            .get_json(&format!("/iserver/account/{}/summary", self.account_id))
            .await?;

        let read_amount = |key: &str| {
            summary
                .get(key)
                .and_then(|v| v.get("amount"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
        };

        Ok(MarginInfo {
            margin_used: read_amount("initMarginReq"),
            margin_available: read_amount("availableFunds"),
        })
    }

    /// GET /iserver/account/orders — ids of live orders only.
    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
        let body = self.get_json("/iserver/account/orders").await?;
        Ok(body
            .get("orders")
            .and_then(|v| v.as_array())
            .map(|orders| {
                orders
                    .iter()
                    .filter(|o| {
                        matches!(
                            o.get("status").and_then(|v| v.as_str()),
                            Some("Submitted") | Some("PreSubmitted") | Some("PendingSubmit")
                        )
                    })
                    .filter_map(|o| o.get("orderId").map(|v| v.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// IBKR trades whole units for everything this pipeline routes to it.
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

impl std::fmt::Debug for IbkrBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbkrBroker")
            .field("account_id", &self.account_id)
            .field("base_url", &self.base_url)
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
    fn sec_type_mapping() {
        assert_eq!(IbkrBroker::map_sec_type(InstrumentType::Stock), "STK");
        assert_eq!(IbkrBroker::map_sec_type(InstrumentType::Etf), "STK");
        assert_eq!(IbkrBroker::map_sec_type(InstrumentType::Future), "FUT");
        assert_eq!(IbkrBroker::map_sec_type(InstrumentType::Forex), "CASH");
    }

    #[test]
    fn order_type_mapping() {
        assert_eq!(IbkrBroker::map_order_type(OrderType::Market), "MKT");
        assert_eq!(IbkrBroker::map_order_type(OrderType::Limit), "LMT");
        assert_eq!(IbkrBroker::map_order_type(OrderType::Stop), "STP");
    }

    #[test]
    fn base_url_from_auth() {
        let auth = BrokerAuth {
            host: Some("gateway.internal".into()),
            port: Some(5001),
            ..Default::default()
        };
        let broker = IbkrBroker::new("DU1234567", &auth);
        assert_eq!(broker.base_url, "https://gateway.internal:5001/v1/api");
        assert!(!broker.is_connected());
    }
}
