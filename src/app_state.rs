// =============================================================================
// Central Application State — Meridian trade router
// =============================================================================
//
// Ties the shared pieces (store, bus, config) together for the ops API and
// keeps the operational telemetry the pipeline stages report into: a version
// counter bumped on meaningful mutations, and a capped ring of recent
// errors.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::Bus;
use crate::cerebro::{DecisionStatus, SignalRecord};
use crate::config::RuntimeConfig;
use crate::positions::Position;
use crate::store::Database;
use crate::types::{BrokerKind, ConnectionState, Environment, OrderStatus};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Decisions shown in the state snapshot.
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event for the ops state feed.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Shared state for every async task, wrapped in `Arc` at start-up.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,
    pub config: RwLock<RuntimeConfig>,
    pub db: Arc<Database>,
    pub bus: Bus,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, db: Arc<Database>, bus: Bus) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            db,
            bus,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error; the ring buffer is capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the pipeline state for
    /// `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();

        let accounts: Vec<AccountSummary> = self
            .db
            .accounts
            .all()
            .into_iter()
            .map(|a| AccountSummary {
                account_id: a.account_id,
                broker: a.broker,
                fund_id: a.fund_id,
                connection: a.connection,
                equity: a.balances.equity,
                margin_used: a.balances.margin_used,
                margin_available: a.balances.margin_available,
                margin_utilization_pct: a.balances.margin_utilization_pct,
                open_positions: a.open_positions.len(),
            })
            .collect();

        let open_positions: Vec<Position> = self
            .db
            .accounts
            .all()
            .into_iter()
            .flat_map(|a| a.open_positions)
            .collect();

        let mut decisions: Vec<SignalRecord> = self.db.signal_store.all();
        decisions.sort_by(|a, b| b.decided_at.cmp(&a.decided_at));
        let recent_decisions: Vec<DecisionSummary> = decisions
            .into_iter()
            .take(MAX_RECENT_DECISIONS)
            .map(|r| DecisionSummary {
                signal_id: r.signal.signal_id,
                strategy_id: r.signal.strategy_id,
                instrument: r.signal.instrument,
                status: r.status,
                reason: r.reason,
                order_count: r.order_ids.len(),
                decided_at: r.decided_at.to_rfc3339(),
            })
            .collect();

        let orders = self.db.orders.all();
        let order_counts = OrderCounts {
            pending: orders.iter().filter(|o| o.status == OrderStatus::Pending).count(),
            submitted: orders
                .iter()
                .filter(|o| o.status == OrderStatus::Submitted)
                .count(),
            filled: orders.iter().filter(|o| o.status == OrderStatus::Filled).count(),
            rejected: orders
                .iter()
                .filter(|o| o.status == OrderStatus::Rejected)
                .count(),
            cancelled: orders
                .iter()
                .filter(|o| o.status == OrderStatus::Cancelled)
                .count(),
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            environment: config.environment,
            live_trading: config.live_trading,
            mock_brokers: config.mock_brokers,
            accounts,
            open_positions,
            recent_decisions,
            order_counts,
            closed_positions: self.db.closed_positions.len(),
            raw_signals: self.db.raw_signals.len(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("accounts", &self.db.accounts.len())
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub environment: Environment,
    pub live_trading: bool,
    pub mock_brokers: bool,
    pub accounts: Vec<AccountSummary>,
    pub open_positions: Vec<Position>,
    pub recent_decisions: Vec<DecisionSummary>,
    pub order_counts: OrderCounts,
    pub closed_positions: usize,
    pub raw_signals: usize,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub broker: BrokerKind,
    pub fund_id: String,
    pub connection: ConnectionState,
    pub equity: f64,
    pub margin_used: f64,
    pub margin_available: f64,
    pub margin_utilization_pct: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    pub signal_id: String,
    pub strategy_id: String,
    pub instrument: String,
    pub status: DecisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub order_count: usize,
    pub decided_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCounts {
    pub pending: usize,
    pub submitted: usize,
    pub filled: usize,
    pub rejected: usize,
    pub cancelled: usize,
}
