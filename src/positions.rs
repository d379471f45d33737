// =============================================================================
// Position Manager — fill-driven state machine over (strategy, instrument,
// direction)
// =============================================================================
//
// Life-cycle:
//   NONE  -> OPEN            (entry fill)
//   OPEN  -> OPEN            (same-direction fill: scale-in, weighted average)
//   OPEN  -> OPEN (reduced)  (opposite fill < held quantity: partial close)
//   OPEN  -> NONE            (opposite fill >= held quantity: full close)
//   OPEN  -> NONE -> OPEN'   (opposite fill >  held quantity: flip)
//
// Positions live embedded in the owning account document, so every
// transition is a single-document update. A full close archives a mirror
// record to the closed-position store *before* the row leaves the embedded
// array; the two effects are applied inside one account update so they are
// observable together.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::Database;
use crate::types::{AccountBalances, Direction, ExecutionConfirmation};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A single tracked position, embedded in its account document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// `{strategy}_{instrument}_{direction}_{ts}`.
    pub position_id: String,
    pub strategy_id: String,
    pub account_id: String,
    pub instrument: String,
    pub direction: Direction,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    pub avg_entry_price: f64,
    /// Invariant: `avg_entry_price * quantity == total_cost_basis`.
    pub total_cost_basis: f64,
    #[serde(default)]
    pub margin_used: f64,
    pub status: PositionStatus,
    #[serde(default)]
    pub entry_order_ids: Vec<String>,
    #[serde(default)]
    pub exit_order_ids: Vec<String>,
    #[serde(default)]
    pub pnl_realized: f64,
    #[serde(default)]
    pub pnl_unrealized: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    fn new_id(strategy_id: &str, instrument: &str, direction: Direction, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}_{}",
            strategy_id,
            instrument,
            direction,
            at.format("%Y%m%d_%H%M%S")
        )
    }
}

/// Mirror record written to the closed-position archive on full close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    #[serde(flatten)]
    pub position: Position,
    pub avg_exit_price: f64,
    /// Direction-aware `(exit - entry) * quantity` at close time.
    pub gross_pnl: f64,
    pub holding_period_seconds: i64,
}

// ---------------------------------------------------------------------------
// Fill outcomes
// ---------------------------------------------------------------------------

/// What a fill did to the position book.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    Created(Position),
    ScaledIn(Position),
    ScaledOut(Position),
    Closed(ClosedPosition),
    Flipped {
        closed: ClosedPosition,
        opened: Position,
    },
    /// Reducing fill with no open position: nothing to book.
    Ignored,
}

impl FillOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::ScaledIn(_) => "scaled_in",
            Self::ScaledOut(_) => "scaled_out",
            Self::Closed(_) => "closed",
            Self::Flipped { .. } => "flipped",
            Self::Ignored => "ignored",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("account '{0}' not found")]
    UnknownAccount(String),
    #[error("fill for order '{order_id}' has non-positive quantity {quantity}")]
    InvalidFill { order_id: String, quantity: f64 },
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

/// Applies fills to the embedded position arrays and maintains the closed
/// archive. Callers (the execution dispatcher) invoke it serially; per-key
/// ordering follows from that serialization.
pub struct PositionManager {
    db: Arc<Database>,
}

impl PositionManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Find the OPEN position for `(strategy, instrument, direction)` across
    /// all accounts.
    pub fn find_open(
        &self,
        strategy_id: &str,
        instrument: &str,
        direction: Direction,
    ) -> Option<Position> {
        for account in self.db.accounts.all() {
            if let Some(pos) = account.open_positions.iter().find(|p| {
                p.status == PositionStatus::Open
                    && p.strategy_id == strategy_id
                    && p.instrument == instrument
                    && p.direction == direction
            }) {
                return Some(pos.clone());
            }
        }
        None
    }

    /// [`PositionManager::find_open`] with retries, tolerating the brief
    /// window where a fill is still being applied by the dispatcher.
    pub async fn find_open_with_retry(
        &self,
        strategy_id: &str,
        instrument: &str,
        direction: Direction,
        retries: u32,
        delay: Duration,
    ) -> Option<Position> {
        for attempt in 0..retries.max(1) {
            if let Some(pos) = self.find_open(strategy_id, instrument, direction) {
                if attempt > 0 {
                    debug!(
                        strategy_id,
                        instrument,
                        attempt = attempt + 1,
                        "position found on retry"
                    );
                }
                return Some(pos);
            }
            if attempt + 1 < retries {
                tokio::time::sleep(delay).await;
            }
        }
        None
    }

    /// All OPEN positions for a strategy across accounts.
    pub fn open_positions_for_strategy(&self, strategy_id: &str) -> Vec<Position> {
        let mut out = Vec::new();
        for account in self.db.accounts.all() {
            out.extend(
                account
                    .open_positions
                    .iter()
                    .filter(|p| p.status == PositionStatus::Open && p.strategy_id == strategy_id)
                    .cloned(),
            );
        }
        out
    }

    // -------------------------------------------------------------------------
    // Fill application
    // -------------------------------------------------------------------------

    /// Apply a fill confirmation to the position book. The whole transition
    /// runs inside one account-document update.
    pub fn apply_fill(&self, conf: &ExecutionConfirmation) -> Result<FillOutcome, PositionError> {
        if conf.filled_quantity <= 0.0 {
            return Err(PositionError::InvalidFill {
                order_id: conf.order_id.clone(),
                quantity: conf.filled_quantity,
            });
        }

        let archive = &self.db.closed_positions;
        let outcome = self
            .db
            .accounts
            .update(&conf.account_id, |account| {
                let (outcome, margin_delta) = Self::transition(
                    &mut account.open_positions,
                    archive,
                    conf,
                    Utc::now(),
                );
                Self::rebook_margin(&mut account.balances, margin_delta);
                outcome
            })
            .ok_or_else(|| PositionError::UnknownAccount(conf.account_id.clone()))?;

        info!(
            order_id = %conf.order_id,
            account_id = %conf.account_id,
            instrument = %conf.instrument,
            outcome = outcome.label(),
            filled_quantity = conf.filled_quantity,
            fill_price = conf.fill_price,
            "fill applied to position book"
        );

        Ok(outcome)
    }

    /// The state machine proper. Operates on the embedded array so callers
    /// control the enclosing account update. Returns the outcome plus the
    /// net change to the account's margin_used.
    fn transition(
        open_positions: &mut Vec<Position>,
        archive: &crate::store::Collection<ClosedPosition>,
        conf: &ExecutionConfirmation,
        now: DateTime<Utc>,
    ) -> (FillOutcome, f64) {
        let same_idx = open_positions.iter().position(|p| {
            p.status == PositionStatus::Open
                && p.strategy_id == conf.strategy_id
                && p.instrument == conf.instrument
                && p.direction == conf.direction
        });

        // Same-direction OPEN exists: scale in.
        if let Some(idx) = same_idx {
            let pos = &mut open_positions[idx];
            let old_qty = pos.quantity;
            pos.quantity += conf.filled_quantity;
            pos.total_cost_basis += conf.filled_quantity * conf.fill_price;
            pos.avg_entry_price = if pos.quantity > 0.0 {
                pos.total_cost_basis / pos.quantity
            } else {
                conf.fill_price
            };
            pos.margin_used += conf.margin_used;
            pos.entry_order_ids.push(conf.order_id.clone());

            info!(
                position_id = %pos.position_id,
                old_qty,
                new_qty = pos.quantity,
                new_avg = pos.avg_entry_price,
                "scale-in"
            );
            return (FillOutcome::ScaledIn(pos.clone()), conf.margin_used);
        }

        let opposite_idx = open_positions.iter().position(|p| {
            p.status == PositionStatus::Open
                && p.strategy_id == conf.strategy_id
                && p.instrument == conf.instrument
                && p.direction == conf.direction.opposite()
        });

        // Opposite-direction OPEN exists: reduce, close, or flip.
        if let Some(idx) = opposite_idx {
            let held_qty = open_positions[idx].quantity;

            if conf.filled_quantity < held_qty {
                // Partial close: proportional cost-basis reduction.
                let pos = &mut open_positions[idx];
                let new_qty = held_qty - conf.filled_quantity;
                let released_margin = pos.margin_used * (conf.filled_quantity / held_qty);
                pos.total_cost_basis *= new_qty / held_qty;
                pos.quantity = new_qty;
                pos.margin_used -= released_margin;
                pos.exit_order_ids.push(conf.order_id.clone());

                info!(
                    position_id = %pos.position_id,
                    held_qty,
                    new_qty,
                    "scale-out (partial close)"
                );
                return (FillOutcome::ScaledOut(pos.clone()), -released_margin);
            }

            // Full close. Archive first, then drop from the embedded array.
            let mut pos = open_positions[idx].clone();
            pos.status = PositionStatus::Closed;
            pos.closed_at = Some(now);
            pos.exit_order_ids.push(conf.order_id.clone());

            let gross_pnl = match pos.direction {
                Direction::Long => (conf.fill_price - pos.avg_entry_price) * pos.quantity,
                Direction::Short => (pos.avg_entry_price - conf.fill_price) * pos.quantity,
            };
            let closed = ClosedPosition {
                holding_period_seconds: (now - pos.opened_at).num_seconds(),
                avg_exit_price: conf.fill_price,
                gross_pnl,
                position: pos,
            };
            archive.insert(closed.position.position_id.clone(), closed.clone());
            open_positions.remove(idx);

            info!(
                position_id = %closed.position.position_id,
                gross_pnl,
                "position closed and archived"
            );

            // Oversized opposite fill: the remainder opens a new position in
            // the fill's direction.
            let released = closed.position.margin_used;
            let remainder = conf.filled_quantity - held_qty;
            if remainder > 0.0 {
                let opened = Self::create(open_positions, conf, remainder, now);
                info!(
                    position_id = %opened.position_id,
                    remainder,
                    "flip: new position opened from fill remainder"
                );
                let delta = opened.margin_used - released;
                return (FillOutcome::Flipped { closed, opened }, delta);
            }
            return (FillOutcome::Closed(closed), -released);
        }

        // A reducing fill with nothing held is an orphan (the position was
        // cleaned up out-of-band): record nothing, surface loudly.
        if conf.action.is_reducing() {
            warn!(
                order_id = %conf.order_id,
                instrument = %conf.instrument,
                "exit fill with no open position — ignored"
            );
            return (FillOutcome::Ignored, 0.0);
        }

        // No position in either direction: new entry.
        let created = Self::create(open_positions, conf, conf.filled_quantity, now);
        (FillOutcome::Created(created), conf.margin_used)
    }

    fn create(
        open_positions: &mut Vec<Position>,
        conf: &ExecutionConfirmation,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Position {
        let position = Position {
            position_id: Position::new_id(&conf.strategy_id, &conf.instrument, conf.direction, now),
            strategy_id: conf.strategy_id.clone(),
            account_id: conf.account_id.clone(),
            instrument: conf.instrument.clone(),
            direction: conf.direction,
            quantity,
            avg_entry_price: conf.fill_price,
            total_cost_basis: quantity * conf.fill_price,
            margin_used: conf.margin_used,
            status: PositionStatus::Open,
            entry_order_ids: vec![conf.order_id.clone()],
            exit_order_ids: Vec::new(),
            pnl_realized: 0.0,
            pnl_unrealized: 0.0,
            opened_at: now,
            closed_at: None,
        };
        open_positions.push(position.clone());
        position
    }

    /// Adjust the account's margin bookkeeping for the transition. The next
    /// broker poll overwrites these with authoritative numbers.
    fn rebook_margin(balances: &mut AccountBalances, margin_delta: f64) {
        balances.margin_used = (balances.margin_used + margin_delta).max(0.0);
        balances.margin_available = (balances.equity - balances.margin_used).max(0.0);
        balances.margin_utilization_pct =
            AccountBalances::utilization_pct(balances.margin_used, balances.equity);
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager").finish()
    }
}
