// =============================================================================
// Shared types used across the Meridian trade router
// =============================================================================
//
// Every document that crosses a topic or lives in a store collection is
// defined here, so that Ingestion, Cerebro, and Execution agree on one
// canonical schema.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::positions::Position;

// ---------------------------------------------------------------------------
// Environments & modes
// ---------------------------------------------------------------------------

/// Deployment environment a signal row is tagged with. Rows for other
/// environments are ignored by the ingestion tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Staging
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Instrument taxonomy. Drives margin rules and quantity precision defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Stock,
    Etf,
    Option,
    Future,
    Forex,
    Crypto,
}

impl Default for InstrumentType {
    fn default() -> Self {
        Self::Stock
    }
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stock => write!(f, "STOCK"),
            Self::Etf => write!(f, "ETF"),
            Self::Option => write!(f, "OPTION"),
            Self::Future => write!(f, "FUTURE"),
            Self::Forex => write!(f, "FOREX"),
            Self::Crypto => write!(f, "CRYPTO"),
        }
    }
}

/// Asset class an account or strategy is permitted to trade. Accounts carry a
/// per-asset-class instrument whitelist; Cerebro matches the signal's
/// instrument type against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Options,
    Futures,
    Forex,
    Crypto,
}

impl From<InstrumentType> for AssetClass {
    fn from(it: InstrumentType) -> Self {
        match it {
            InstrumentType::Stock | InstrumentType::Etf => Self::Equity,
            InstrumentType::Option => Self::Options,
            InstrumentType::Future => Self::Futures,
            InstrumentType::Forex => Self::Forex,
            InstrumentType::Crypto => Self::Crypto,
        }
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "equity"),
            Self::Options => write!(f, "options"),
            Self::Futures => write!(f, "futures"),
            Self::Forex => write!(f, "forex"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

// ---------------------------------------------------------------------------
// Directions & actions
// ---------------------------------------------------------------------------

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The opposing direction (used for flip / opposite-close detection).
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Raw order side as strategies emit it (BUY/SELL). Together with the
/// direction it disambiguates scale-in vs scale-out when no explicit action
/// is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// What a signal intends to do to the position. May be absent on the wire, in
/// which case Cerebro infers it from current position state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Entry,
    Exit,
    ScaleIn,
    ScaleOut,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::Exit => write!(f, "EXIT"),
            Self::ScaleIn => write!(f, "SCALE_IN"),
            Self::ScaleOut => write!(f, "SCALE_OUT"),
        }
    }
}

impl SignalAction {
    /// True for actions that reduce or close a position.
    pub fn is_reducing(self) -> bool {
        matches!(self, Self::Exit | Self::ScaleOut)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Lifecycle status of an order. `PartiallyFilled` keeps the broker-side
/// spelling used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    /// FILLED and SUBMITTED orders consume allocated capital.
    pub fn consumes_capital(self) -> bool {
        matches!(self, Self::Filled | Self::Submitted | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::PartiallyFilled => write!(f, "PartiallyFilled"),
            Self::Filled => write!(f, "FILLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Brokers & accounts
// ---------------------------------------------------------------------------

/// Supported broker integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerKind {
    #[serde(rename = "IBKR")]
    Ibkr,
    Zerodha,
    Binance,
    Vantage,
    Mock,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ibkr => write!(f, "IBKR"),
            Self::Zerodha => write!(f, "Zerodha"),
            Self::Binance => write!(f, "Binance"),
            Self::Vantage => write!(f, "Vantage"),
            Self::Mock => write!(f, "Mock"),
        }
    }
}

/// Broker session health as seen by the account poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Error,
    Disconnected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Broker authentication blob. Loaded from the bootstrap file, handed to the
/// broker factory, and never logged or exposed via the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u32>,
}

/// Balance snapshot polled from the broker (or updated by Execution fills).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalances {
    #[serde(default)]
    pub equity: f64,
    #[serde(default)]
    pub cash_balance: f64,
    #[serde(default)]
    pub margin_used: f64,
    #[serde(default)]
    pub margin_available: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub margin_utilization_pct: f64,
}

impl AccountBalances {
    /// Margin utilization as a percentage of equity (0 when equity is 0).
    pub fn utilization_pct(margin_used: f64, equity: f64) -> f64 {
        if equity > 0.0 {
            (margin_used / equity) * 100.0
        } else {
            0.0
        }
    }
}

/// A trading account document. Open positions are embedded so that position
/// add/remove is a single-document update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingAccount {
    pub account_id: String,
    pub broker: BrokerKind,
    pub fund_id: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub authentication: BrokerAuth,
    /// Instrument whitelist per asset class. An account supports an asset
    /// class when its entry exists and is non-empty.
    #[serde(default)]
    pub asset_classes: HashMap<AssetClass, Vec<String>>,
    #[serde(default)]
    pub balances: AccountBalances,
    #[serde(default)]
    pub open_positions: Vec<Position>,
    #[serde(default)]
    pub connection: ConnectionState,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl TradingAccount {
    /// Whether this account may trade the given instrument type.
    pub fn supports(&self, instrument_type: InstrumentType) -> bool {
        self.asset_classes
            .get(&AssetClass::from(instrument_type))
            .map(|instruments| !instruments.is_empty())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Strategies, funds, allocations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Active,
    Inactive,
}

impl Default for StrategyStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_id: String,
    pub asset_class: AssetClass,
    /// Accounts this strategy is allowed to trade through.
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub status: StrategyStatus,
    /// Opt-in flag for the (out-of-scope) portfolio optimizer.
    #[serde(default)]
    pub optimize: bool,
}

/// A capital pool aggregating one or more accounts. `total_equity` is
/// recomputed from member accounts before every sizing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fund {
    pub fund_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_equity: f64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    PendingApproval,
    Active,
    Archived,
}

/// A fund-level allocation policy: strategy → percentage of fund equity.
/// At most one ACTIVE allocation exists per fund; weights sum to <= 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: String,
    pub fund_id: String,
    pub status: AllocationStatus,
    /// `strategy_id -> allocation_pct` (percentage of fund equity).
    #[serde(default)]
    pub allocations: HashMap<String, f64>,
}

impl Allocation {
    pub fn pct_for(&self, strategy_id: &str) -> f64 {
        self.allocations.get(strategy_id).copied().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Raw signals (the durable signal store rows)
// ---------------------------------------------------------------------------

/// One row in the raw signal store, as delivered by an external strategy
/// process. The nested `signal` payload may be an object or a single-element
/// array (the array form carries the instrument on its first leg).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignalRow {
    /// Store-assigned row id.
    pub row_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(default, rename = "signalID", skip_serializing_if = "Option::is_none")]
    pub source_signal_id: Option<String>,
    pub strategy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default, rename = "signal_sent_EPOCH", skip_serializing_if = "Option::is_none")]
    pub signal_sent_epoch: Option<i64>,
    pub environment: Environment,
    #[serde(default)]
    pub signal: serde_json::Value,
    #[serde(default)]
    pub signal_processed: bool,
}

// ---------------------------------------------------------------------------
// Canonical signal
// ---------------------------------------------------------------------------

/// One leg of a multi-leg options signal. Preserved verbatim from the raw
/// payload; Cerebro emits one order per leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLeg {
    pub ticker: String,
    pub action: String,
    #[serde(default)]
    pub qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_type: Option<String>,
}

/// The canonical signal every downstream stage consumes. Produced once by
/// the standardizer; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub strategy_id: String,
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    #[serde(default)]
    pub instrument_type: InstrumentType,
    #[serde(default)]
    pub direction: Direction,
    /// Absent means "infer from position state".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SignalAction>,
    /// Raw BUY/SELL side, kept for action inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<OrderSide>,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    /// Sizing hint only — Cerebro computes the actual quantity.
    #[serde(default)]
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legs: Option<Vec<OptionLeg>>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// A concrete instruction to a broker, derived from a signal by Cerebro and
/// mutated only by Execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub signal_id: String,
    pub strategy_id: String,
    pub fund_id: String,
    pub account_id: String,
    pub broker: BrokerKind,
    pub instrument: String,
    pub instrument_type: InstrumentType,
    pub direction: Direction,
    pub action: SignalAction,
    pub quantity: f64,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub stop_price: f64,
    pub status: OrderStatus,
    /// Futures/options contract fields, carried through from the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// quantity × price at decision time.
    #[serde(default)]
    pub notional_value: f64,
    /// Initial margin required for this order at decision time.
    #[serde(default)]
    pub margin_used: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Orders carry their parent signal id as a prefix: `{signal_id}_ORD` or
    /// `{signal_id}_ORD_{k}` for multi-fund fan-out.
    pub fn signal_id_from_order_id(order_id: &str) -> &str {
        match order_id.find("_ORD") {
            Some(idx) => &order_id[..idx],
            None => order_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution confirmations & account updates
// ---------------------------------------------------------------------------

/// Fill record published on the confirmations topic and archived in the
/// confirmations collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfirmation {
    pub order_id: String,
    pub signal_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub account_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub action: SignalAction,
    pub filled_quantity: f64,
    pub fill_price: f64,
    #[serde(default)]
    pub commission: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub margin_used: f64,
    pub strategy_id: String,
}

/// Account snapshot published on the account-updates topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub account_id: String,
    pub broker: BrokerKind,
    pub timestamp: DateTime<Utc>,
    pub balances: AccountBalances,
    pub open_position_count: usize,
    pub open_order_count: usize,
}

// ---------------------------------------------------------------------------
// Order commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Cancel,
}

/// Command delivered to the execution dispatcher on the order-commands topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCommand {
    pub command: CommandKind,
    pub order_id: String,
}
