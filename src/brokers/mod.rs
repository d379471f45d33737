// =============================================================================
// Broker adapter layer — one capability contract for every integration
// =============================================================================
//
// Every broker exposes the same surface: connect/disconnect/is_connected,
// order placement and cancellation, positions, balances, margin, open
// orders, and per-symbol quantity precision. The execution dispatcher and
// the account poller program against `dyn Broker` only; which concrete
// adapter backs an account is decided once by the factory from the account
// document (or forced to Mock by the mock-brokers override).
// =============================================================================

pub mod binance;
pub mod ibkr;
pub mod mock;
pub mod vantage;
pub mod zerodha;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    AccountBalances, BrokerKind, Direction, InstrumentType, Order, OrderStatus, TradingAccount,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed broker failures. `Rejected` carries the broker's rejection reason;
/// `Api` carries the broker's own error code.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    #[error("broker API error {code}: {message}")]
    Api { code: String, message: String },
}

impl BrokerError {
    /// Rejections and invalid symbols are terminal for an order; connection
    /// and API errors are worth a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::InvalidSymbol(_))
    }
}

// ---------------------------------------------------------------------------
// Data carried across the adapter boundary
// ---------------------------------------------------------------------------

/// A position as the broker reports it (reconciliation view — distinct from
/// the pipeline's own position book).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: String,
    pub quantity: f64,
    pub avg_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginInfo {
    pub margin_used: f64,
    pub margin_available: f64,
}

/// Broker response to an order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
}

impl OrderAck {
    /// Whether the placement produced an immediate (full or partial) fill.
    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::PartiallyFilled)
            || self.filled_quantity > 0.0
    }
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Translate the canonical order to the broker's native form and submit
    /// it. Synchronous fills (market orders on most venues) come back in the
    /// ack.
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError>;

    /// Cancel by the broker-assigned id. `Ok(false)` means the broker no
    /// longer knows the order (already filled or expired).
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, BrokerError>;

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError>;

    async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError>;

    /// Broker-side ids of currently working orders.
    async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError>;

    /// Decimal places the venue accepts for this symbol's quantity.
    async fn get_quantity_precision(
        &self,
        symbol: &str,
        instrument_type: InstrumentType,
    ) -> Result<u32, BrokerError>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Wire-side order side. Entries trade with the position direction, exits
/// against it: LONG entry / SHORT exit are BUY, the rest SELL.
pub fn order_side(order: &Order) -> &'static str {
    let buys = match order.direction {
        Direction::Long => !order.action.is_reducing(),
        Direction::Short => order.action.is_reducing(),
    };
    if buys {
        "BUY"
    } else {
        "SELL"
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the adapter for an account. With `mock_override` every account gets
/// a Mock session seeded from its last known balances, so the whole pipeline
/// can run without touching a real venue.
pub fn create_broker(account: &TradingAccount, mock_override: bool) -> Arc<dyn Broker> {
    if mock_override || account.broker == BrokerKind::Mock {
        return Arc::new(mock::MockBroker::seeded(&account.balances));
    }

    match account.broker {
        BrokerKind::Binance => Arc::new(binance::BinanceBroker::new(&account.authentication)),
        BrokerKind::Ibkr => Arc::new(ibkr::IbkrBroker::new(
            &account.account_id,
            &account.authentication,
        )),
        BrokerKind::Zerodha => Arc::new(zerodha::ZerodhaBroker::new(&account.authentication)),
        BrokerKind::Vantage => Arc::new(vantage::VantageBroker::new(&account.authentication)),
        BrokerKind::Mock => unreachable!("handled above"),
    }
}
