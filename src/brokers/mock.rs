// =============================================================================
// Mock broker — deterministic simulated venue
// =============================================================================
//
// Used for paper accounts, the mock-brokers override, and tests. Market
// orders fill immediately at the order price; limit/stop orders rest as
// working orders until cancelled. Balances and margin are book-kept locally
// so the account poller sees coherent numbers.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::brokers::{order_side, Broker, BrokerError, BrokerPosition, MarginInfo, OrderAck};
use crate::types::{
    AccountBalances, BrokerKind, Direction, InstrumentType, Order, OrderStatus, OrderType,
};

pub struct MockBroker {
    connected: RwLock<bool>,
    balances: RwLock<AccountBalances>,
    positions: RwLock<Vec<BrokerPosition>>,
    /// broker_order_id -> resting order.
    working_orders: RwLock<HashMap<String, Order>>,
    /// When set, the next placement is rejected with this reason (test hook).
    reject_next: RwLock<Option<String>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::seeded(&AccountBalances {
            equity: 1_000_000.0,
            cash_balance: 1_000_000.0,
            margin_available: 1_000_000.0,
            ..Default::default()
        })
    }

    /// Seed the simulated account from known balances (the factory hands in
    /// the account document's last snapshot).
    pub fn seeded(balances: &AccountBalances) -> Self {
        Self {
            connected: RwLock::new(false),
            balances: RwLock::new(balances.clone()),
            positions: RwLock::new(Vec::new()),
            working_orders: RwLock::new(HashMap::new()),
            reject_next: RwLock::new(None),
        }
    }

    /// Make the next `place_order` fail with a broker rejection.
    pub fn reject_next(&self, reason: impl Into<String>) {
        *self.reject_next.write() = Some(reason.into());
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if *self.connected.read() {
            Ok(())
        } else {
            Err(BrokerError::Connection("mock broker not connected".into()))
        }
    }

    fn book_fill(&self, order: &Order, fill_price: f64) {
        let signed_qty = match order.direction {
            Direction::Long => order.quantity,
            Direction::Short => -order.quantity,
        };
        let mut positions = self.positions.write();
        let mut flat = false;
        match positions.iter_mut().find(|p| p.instrument == order.instrument) {
            Some(pos) => {
                let delta = if order.action.is_reducing() { -signed_qty } else { signed_qty };
                pos.quantity += delta;
                flat = pos.quantity.abs() < 1e-9;
            }
            None => positions.push(BrokerPosition {
                instrument: order.instrument.clone(),
                quantity: signed_qty,
                avg_price: fill_price,
                unrealized_pnl: 0.0,
            }),
        }
        if flat {
            positions.retain(|p| p.instrument != order.instrument);
        }

        let mut balances = self.balances.write();
        if order.action.is_reducing() {
            balances.margin_used = (balances.margin_used - order.margin_used).max(0.0);
        } else {
            balances.margin_used += order.margin_used;
        }
        balances.margin_available = (balances.equity - balances.margin_used).max(0.0);
        balances.margin_utilization_pct =
            AccountBalances::utilization_pct(balances.margin_used, balances.equity);
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Mock
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        *self.connected.write() = true;
        debug!("mock broker connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.write() = false;
        debug!("mock broker disconnected");
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        self.ensure_connected()?;

        if let Some(reason) = self.reject_next.write().take() {
            return Err(BrokerError::Rejected { reason });
        }
        if order.quantity <= 0.0 {
            return Err(BrokerError::Rejected {
                reason: format!("non-positive quantity {}", order.quantity),
            });
        }
        if order.instrument.is_empty() {
            return Err(BrokerError::InvalidSymbol(String::new()));
        }

        let broker_order_id = format!("MOCK-{}", Uuid::new_v4());

        match order.order_type {
            OrderType::Market => {
                // Synthetic immediate fill at the signal price.
                let fill_price = order.price;
                self.book_fill(order, fill_price);
                info!(
                    order_id = %order.order_id,
                    broker_order_id = %broker_order_id,
                    side = order_side(order),
                    quantity = order.quantity,
                    fill_price,
                    "mock fill"
                );
                Ok(OrderAck {
                    broker_order_id,
                    status: OrderStatus::Filled,
                    filled_quantity: order.quantity,
                    avg_fill_price: fill_price,
                })
            }
            OrderType::Limit | OrderType::Stop | OrderType::StopLimit => {
                self.working_orders
                    .write()
                    .insert(broker_order_id.clone(), order.clone());
                debug!(
                    order_id = %order.order_id,
                    broker_order_id = %broker_order_id,
                    order_type = %order.order_type,
                    "mock order resting"
                );
                Ok(OrderAck {
                    broker_order_id,
                    status: OrderStatus::Submitted,
                    filled_quantity: 0.0,
                    avg_fill_price: 0.0,
                })
            }
        }
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        self.ensure_connected()?;
        let removed = self.working_orders.write().remove(broker_order_id).is_some();
        debug!(broker_order_id, removed, "mock cancel");
        Ok(removed)
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.positions.read().clone())
    }

    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
        self.ensure_connected()?;
        Ok(self.balances.read().clone())
    }

    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
        self.ensure_connected()?;
        let balances = self.balances.read();
        Ok(MarginInfo {
            margin_used: balances.margin_used,
            margin_available: balances.margin_available,
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.working_orders.read().keys().cloned().collect())
    }

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

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker")
            .field("connected", &*self.connected.read())
            .field("working_orders", &self.working_orders.read().len())
            .finish()
    }
}
