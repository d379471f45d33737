// =============================================================================
// Cerebro — the per-signal sizing and routing engine
// =============================================================================
//
// For each standardized signal Cerebro decides, in order:
//   (a) idempotency gate against the signal store
//   (b) what the signal does (explicit action, else inferred from positions)
//   (c) which funds back the strategy (one sizing attempt per ACTIVE
//       allocation; failures are per-fund and never block other funds)
//   (d) how much capital the signal may deploy from each fund
//   (e) which accounts are eligible, sorted by available margin
//   (f) how the capital splits across those accounts
//   (g) the broker-precision-correct quantity and margin requirement,
//       enforcing the hard margin limit (shrink or reject)
//   (h) the orders to emit, one per account, recorded before publication
//
// The full decision — inputs, per-fund numbers, selected accounts, reasons —
// is appended to the signal store, which doubles as the cross-restart
// idempotency record.
// =============================================================================

pub mod precision;
pub mod sizing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::brokers::{create_broker, Broker};
use crate::bus::{Bus, TopicReceiver};
use crate::journal;
use crate::margin::{MarginCalculator, MarginError};
use crate::positions::PositionManager;
use crate::store::Database;
use crate::types::{
    BrokerKind, Direction, InstrumentType, Order, OrderSide, OrderStatus, Signal, SignalAction,
    Strategy, StrategyStatus,
};

use precision::PrecisionService;
use sizing::{CapitalSlice, StrategyCapital};

// ---------------------------------------------------------------------------
// Decision records (the signal_store document)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    /// Orders were emitted.
    Decided,
    /// No orders; reason recorded.
    Rejected,
}

/// Per-account slice of a fund decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDecision {
    pub account_id: String,
    pub broker: BrokerKind,
    pub allocated_capital: f64,
    pub quantity: f64,
    pub margin_required: f64,
    pub order_id: String,
}

/// One independent sizing attempt against one fund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundDecision {
    pub fund_id: String,
    pub fund_equity: f64,
    pub allocation_pct: f64,
    pub allocated_capital: f64,
    pub used_capital: f64,
    pub available_capital: f64,
    #[serde(default)]
    pub accounts: Vec<AccountDecision>,
    /// Set when this fund produced no orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// The signal store row: the canonical signal plus the terminal decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal: Signal,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_action: Option<SignalAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub funds: Vec<FundDecision>,
    #[serde(default)]
    pub order_ids: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Internal flow types
// ---------------------------------------------------------------------------

/// What the signal does, after explicit-or-inferred resolution.
#[derive(Debug, Clone, Copy)]
enum Resolved {
    Entry,
    ScaleIn,
    Exit {
        close_direction: Direction,
        /// Oversized opposite signal: quantity beyond the held position
        /// re-enters in the signal's direction (flip).
        flip_remainder: f64,
    },
    ScaleOut {
        close_direction: Direction,
    },
}

impl Resolved {
    fn action(&self) -> SignalAction {
        match self {
            Self::Entry => SignalAction::Entry,
            Self::ScaleIn => SignalAction::ScaleIn,
            Self::Exit { .. } => SignalAction::Exit,
            Self::ScaleOut { .. } => SignalAction::ScaleOut,
        }
    }
}

/// How a processed delivery should be settled on the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ack,
    /// Transient infrastructure failure: redeliver.
    Retry,
}

enum FundError {
    /// Recorded against the fund; other funds proceed.
    Failed(String),
    /// Infrastructure failure (margin preview): nack the whole signal.
    Transient(String),
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct CerebroService {
    db: Arc<Database>,
    bus: Bus,
    positions: PositionManager,
    margin: MarginCalculator,
    precision: PrecisionService,
    /// Query-side adapters for precision lookups, one per account. These
    /// never place orders; order-placing sessions stay with the dispatcher.
    query_brokers: RwLock<HashMap<String, Arc<dyn Broker>>>,
    mock_brokers: bool,
    margin_limit_pct: f64,
    lookup_retries: u32,
    lookup_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl CerebroService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        bus: Bus,
        margin_preview_url: &str,
        mock_brokers: bool,
        margin_limit_pct: f64,
        precision_ttl_hours: i64,
        lookup_retries: u32,
        lookup_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            positions: PositionManager::new(db.clone()),
            margin: MarginCalculator::new(margin_preview_url, mock_brokers),
            precision: PrecisionService::new(precision_ttl_hours),
            query_brokers: RwLock::new(HashMap::new()),
            db,
            bus,
            mock_brokers,
            margin_limit_pct,
            lookup_retries,
            lookup_delay,
            shutdown,
        }
    }

    /// Consume the standardized-signals topic until shutdown.
    pub async fn run(self, mut rx: TopicReceiver<Signal>) {
        let mut shutdown = self.shutdown.clone();
        info!("cerebro: listening for standardized signals");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cerebro: shutdown signal received");
                        return;
                    }
                }
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else {
                        info!("cerebro: signal topic closed");
                        return;
                    };
                    let signal = delivery.payload.clone();
                    if delivery.attempt > 1 {
                        debug!(signal_id = %signal.signal_id, attempt = delivery.attempt, "reprocessing signal");
                    }
                    match self.process_signal(&signal).await {
                        ProcessOutcome::Ack => delivery.ack(),
                        ProcessOutcome::Retry => delivery.nack(),
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-signal pipeline
    // -------------------------------------------------------------------------

    pub(crate) async fn process_signal(&self, signal: &Signal) -> ProcessOutcome {
        // (a) Idempotency gate: a recorded decision is terminal.
        if self.db.signal_store.contains(&signal.signal_id) {
            info!(signal_id = %signal.signal_id, "duplicate signal — already decided");
            journal::record(&signal.signal_id, "DUPLICATE_BLOCKED", "decision already recorded");
            return ProcessOutcome::Ack;
        }

        // Structural validation before any sizing work.
        if let Err(reason) = self.validate(signal) {
            return self.reject(signal, None, reason);
        }
        let strategy = match self.db.strategies.get(&signal.strategy_id) {
            Some(s) if s.status == StrategyStatus::Active => s,
            Some(_) => return self.reject(signal, None, "strategy is not ACTIVE".into()),
            None => {
                return self.reject(
                    signal,
                    None,
                    format!("unknown strategy '{}'", signal.strategy_id),
                )
            }
        };

        // (b) Signal type resolution.
        let resolved = match self.resolve_action(signal).await {
            Ok(r) => r,
            Err(reason) => return self.reject(signal, None, reason),
        };
        let action = resolved.action();
        debug!(signal_id = %signal.signal_id, action = %action, "signal action resolved");

        // (c) Fund discovery.
        let allocations = sizing::active_allocations_for_strategy(&self.db, &signal.strategy_id);
        if allocations.is_empty() {
            return self.reject(
                signal,
                Some(action),
                "no ACTIVE allocation contains this strategy".into(),
            );
        }

        // (d)-(g) One independent attempt per fund.
        let mut funds = Vec::new();
        let mut orders: Vec<Order> = Vec::new();
        for allocation in &allocations {
            let result = self
                .decide_for_fund(signal, &strategy, &allocation.fund_id, resolved, orders.len())
                .await;
            match result {
                Ok((decision, fund_orders)) => {
                    orders.extend(fund_orders);
                    funds.push(decision);
                }
                Err(FundError::Transient(msg)) => {
                    warn!(
                        signal_id = %signal.signal_id,
                        fund_id = %allocation.fund_id,
                        error = %msg,
                        "transient failure during fund sizing — signal will be redelivered"
                    );
                    return ProcessOutcome::Retry;
                }
                Err(FundError::Failed(reason)) => {
                    warn!(
                        signal_id = %signal.signal_id,
                        fund_id = %allocation.fund_id,
                        reason = %reason,
                        "fund sizing failed"
                    );
                    funds.push(FundDecision {
                        fund_id: allocation.fund_id.clone(),
                        fund_equity: 0.0,
                        allocation_pct: allocation.pct_for(&signal.strategy_id),
                        allocated_capital: 0.0,
                        used_capital: 0.0,
                        available_capital: 0.0,
                        accounts: Vec::new(),
                        failure: Some(reason),
                    });
                }
            }
        }

        // (h) Record the decision, then emit.
        if orders.is_empty() {
            let reasons: Vec<String> = funds
                .iter()
                .filter_map(|f| f.failure.clone())
                .collect();
            let reason = if reasons.is_empty() {
                "no orders produced".to_string()
            } else {
                reasons.join("; ")
            };
            let record = SignalRecord {
                signal: signal.clone(),
                status: DecisionStatus::Rejected,
                resolved_action: Some(action),
                reason: Some(reason.clone()),
                funds,
                order_ids: Vec::new(),
                decided_at: Utc::now(),
            };
            self.db
                .signal_store
                .insert(signal.signal_id.clone(), record);
            journal::record(&signal.signal_id, "REJECTED", &reason);
            return ProcessOutcome::Ack;
        }

        let order_ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        let record = SignalRecord {
            signal: signal.clone(),
            status: DecisionStatus::Decided,
            resolved_action: Some(action),
            reason: None,
            funds,
            order_ids: order_ids.clone(),
            decided_at: Utc::now(),
        };
        self.db
            .signal_store
            .insert(signal.signal_id.clone(), record);

        for order in orders {
            self.db.orders.insert(order.order_id.clone(), order.clone());
            journal::record(
                &signal.signal_id,
                "ORDER_EMITTED",
                &format!(
                    "order={} account={} qty={} notional={:.2}",
                    order.order_id, order.account_id, order.quantity, order.notional_value
                ),
            );
            if let Err(e) = self.bus.trading_orders.publish(order).await {
                // Orders are persisted PENDING; a dead topic means the
                // process is shutting down and redelivery will restart us.
                warn!(error = %e, "failed to publish order — dispatcher gone");
                return ProcessOutcome::Retry;
            }
        }

        info!(
            signal_id = %signal.signal_id,
            action = %action,
            orders = order_ids.len(),
            "decision recorded and orders emitted"
        );
        journal::record(
            &signal.signal_id,
            "DECIDED",
            &format!("action={} orders={}", action, order_ids.join(",")),
        );
        ProcessOutcome::Ack
    }

    fn validate(&self, signal: &Signal) -> Result<(), String> {
        if signal.instrument.is_empty() {
            return Err("signal has no instrument".into());
        }
        if signal.instrument_type == InstrumentType::Future {
            // The broker margin preview cannot run without the contract
            // fields, so these are rejected up front in every mode.
            if signal.expiry.is_none() {
                return Err("expiry required for futures signals".into());
            }
            if signal.exchange.is_none() {
                return Err("exchange required for futures signals".into());
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        signal: &Signal,
        action: Option<SignalAction>,
        reason: String,
    ) -> ProcessOutcome {
        warn!(signal_id = %signal.signal_id, reason = %reason, "signal rejected");
        let record = SignalRecord {
            signal: signal.clone(),
            status: DecisionStatus::Rejected,
            resolved_action: action,
            reason: Some(reason.clone()),
            funds: Vec::new(),
            order_ids: Vec::new(),
            decided_at: Utc::now(),
        };
        self.db
            .signal_store
            .insert(signal.signal_id.clone(), record);
        journal::record(&signal.signal_id, "REJECTED", &reason);
        ProcessOutcome::Ack
    }

    // -------------------------------------------------------------------------
    // (b) Signal type resolution
    // -------------------------------------------------------------------------

    async fn resolve_action(&self, signal: &Signal) -> Result<Resolved, String> {
        // Explicit action wins.
        if let Some(action) = signal.action {
            return Ok(match action {
                SignalAction::Entry => Resolved::Entry,
                SignalAction::ScaleIn => Resolved::ScaleIn,
                SignalAction::Exit => Resolved::Exit {
                    close_direction: signal.direction,
                    flip_remainder: 0.0,
                },
                SignalAction::ScaleOut => Resolved::ScaleOut {
                    close_direction: signal.direction,
                },
            });
        }

        // Infer from position state, tolerating the create race.
        let same = self
            .positions
            .find_open_with_retry(
                &signal.strategy_id,
                &signal.instrument,
                signal.direction,
                self.lookup_retries,
                self.lookup_delay,
            )
            .await;
        let opposite = self.positions.find_open(
            &signal.strategy_id,
            &signal.instrument,
            signal.direction.opposite(),
        );

        match (same, opposite) {
            (None, None) => Ok(Resolved::Entry),
            (Some(position), _) => {
                // Same-direction position: the BUY/SELL side says whether the
                // signal adds or reduces.
                let Some(side) = signal.side else {
                    return Err(format!(
                        "ambiguous signal: open {} position of {} and no action or side",
                        position.direction, position.quantity
                    ));
                };
                let increases = match (signal.direction, side) {
                    (Direction::Long, OrderSide::Buy) | (Direction::Short, OrderSide::Sell) => true,
                    (Direction::Long, OrderSide::Sell) | (Direction::Short, OrderSide::Buy) => false,
                };
                if increases {
                    Ok(Resolved::ScaleIn)
                } else {
                    Ok(Resolved::ScaleOut {
                        close_direction: signal.direction,
                    })
                }
            }
            (None, Some(position)) => {
                // Opposite-direction position: this closes it; any excess
                // quantity re-enters in the signal's direction.
                let flip_remainder = (signal.quantity - position.quantity).max(0.0);
                Ok(Resolved::Exit {
                    close_direction: position.direction,
                    flip_remainder,
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // (d)-(g) Per-fund sizing
    // -------------------------------------------------------------------------

    async fn decide_for_fund(
        &self,
        signal: &Signal,
        strategy: &Strategy,
        fund_id: &str,
        resolved: Resolved,
        orders_emitted: usize,
    ) -> Result<(FundDecision, Vec<Order>), FundError> {
        let capital = sizing::strategy_capital_for_fund(&self.db, fund_id, &signal.strategy_id);
        let fund_equity = self
            .db
            .funds
            .get(fund_id)
            .map(|f| f.total_equity)
            .unwrap_or(0.0);
        let allocation_pct = self
            .db
            .allocations
            .find(|a| a.fund_id == fund_id && a.status == crate::types::AllocationStatus::Active)
            .first()
            .map(|a| a.pct_for(&signal.strategy_id))
            .unwrap_or(0.0);

        let mut decision = FundDecision {
            fund_id: fund_id.to_string(),
            fund_equity,
            allocation_pct,
            allocated_capital: capital.allocated,
            used_capital: capital.used,
            available_capital: capital.available,
            accounts: Vec::new(),
            failure: None,
        };
        let mut orders = Vec::new();

        match resolved {
            Resolved::Exit { close_direction, flip_remainder } => {
                self.exit_orders(
                    signal,
                    fund_id,
                    close_direction,
                    SignalAction::Exit,
                    None,
                    orders_emitted,
                    &mut decision,
                    &mut orders,
                );
                if orders.is_empty() {
                    decision.failure =
                        Some(format!("no open {close_direction} position in fund {fund_id}"));
                } else if flip_remainder > 0.0 {
                    // Flip: the remainder is a fresh entry in the signal's
                    // direction, sized by available capital like any entry.
                    // An entry failure must not discard the exit orders.
                    let flip = self
                        .entry_orders(
                            signal,
                            strategy,
                            fund_id,
                            signal.direction,
                            SignalAction::Entry,
                            &capital,
                            orders_emitted + orders.len(),
                            &mut decision,
                            &mut orders,
                        )
                        .await;
                    match flip {
                        Ok(()) => {}
                        Err(FundError::Transient(msg)) => return Err(FundError::Transient(msg)),
                        Err(FundError::Failed(reason)) => {
                            decision.failure = Some(format!("flip entry skipped: {reason}"));
                        }
                    }
                }
            }
            Resolved::ScaleOut { close_direction } => {
                let cap = if signal.quantity > 0.0 {
                    Some(signal.quantity)
                } else {
                    None
                };
                self.exit_orders(
                    signal,
                    fund_id,
                    close_direction,
                    SignalAction::ScaleOut,
                    cap,
                    orders_emitted,
                    &mut decision,
                    &mut orders,
                );
                if orders.is_empty() {
                    decision.failure =
                        Some(format!("no open {close_direction} position in fund {fund_id}"));
                }
            }
            Resolved::Entry | Resolved::ScaleIn => {
                if signal.price <= 0.0 {
                    return Err(FundError::Failed(
                        "entry signal has no price for sizing".into(),
                    ));
                }
                let has_legs = signal
                    .legs
                    .as_ref()
                    .map(|legs| !legs.is_empty())
                    .unwrap_or(false);
                if signal.instrument_type == InstrumentType::Option && has_legs {
                    self.leg_orders(
                        signal,
                        strategy,
                        fund_id,
                        resolved.action(),
                        orders_emitted,
                        &mut decision,
                        &mut orders,
                    )
                    .await?;
                } else {
                    self.entry_orders(
                        signal,
                        strategy,
                        fund_id,
                        signal.direction,
                        resolved.action(),
                        &capital,
                        orders_emitted,
                        &mut decision,
                        &mut orders,
                    )
                    .await?;
                }
            }
        }

        Ok((decision, orders))
    }

    /// Exit/scale-out orders: one per account holding the position in this
    /// fund, sized from the held quantity (never the capital math).
    #[allow(clippy::too_many_arguments)]
    fn exit_orders(
        &self,
        signal: &Signal,
        fund_id: &str,
        close_direction: Direction,
        action: SignalAction,
        quantity_cap: Option<f64>,
        orders_emitted: usize,
        decision: &mut FundDecision,
        orders: &mut Vec<Order>,
    ) {
        let holders = self.db.accounts.find(|account| {
            account.fund_id == fund_id
                && account.open_positions.iter().any(|p| {
                    p.strategy_id == signal.strategy_id
                        && p.instrument == signal.instrument
                        && p.direction == close_direction
                })
        });

        for account in holders {
            let held: f64 = account
                .open_positions
                .iter()
                .filter(|p| {
                    p.strategy_id == signal.strategy_id
                        && p.instrument == signal.instrument
                        && p.direction == close_direction
                })
                .map(|p| p.quantity)
                .sum();
            let quantity = match quantity_cap {
                Some(cap) => cap.min(held),
                None => held,
            };
            if quantity <= 0.0 {
                continue;
            }

            let order = self.make_order(
                signal,
                fund_id,
                &account.account_id,
                account.broker,
                close_direction,
                action,
                quantity,
                0.0,
                orders_emitted + orders.len(),
            );
            decision.accounts.push(AccountDecision {
                account_id: account.account_id.clone(),
                broker: account.broker,
                allocated_capital: 0.0,
                quantity,
                margin_required: 0.0,
                order_id: order.order_id.clone(),
            });
            orders.push(order);
        }
    }

    /// Entry/scale-in orders: distribute available capital, resolve
    /// precision, compute margin, and enforce the hard margin limit.
    #[allow(clippy::too_many_arguments)]
    async fn entry_orders(
        &self,
        signal: &Signal,
        strategy: &Strategy,
        fund_id: &str,
        direction: Direction,
        action: SignalAction,
        capital: &StrategyCapital,
        orders_emitted: usize,
        decision: &mut FundDecision,
        orders: &mut Vec<Order>,
    ) -> Result<(), FundError> {
        if capital.available <= 0.0 {
            return Err(FundError::Failed(format!(
                "no available capital (allocated {:.2}, used {:.2})",
                capital.allocated, capital.used
            )));
        }

        let eligible =
            sizing::eligible_accounts(&self.db, strategy, fund_id, signal.instrument_type);
        if eligible.is_empty() {
            return Err(FundError::Failed("no eligible account".into()));
        }

        let slices = sizing::distribute_capital(capital.available, &eligible);
        if slices.is_empty() {
            return Err(FundError::Failed(
                "eligible accounts have no available margin".into(),
            ));
        }

        let mut skipped: Vec<String> = Vec::new();
        for slice in slices {
            match self
                .account_order(signal, fund_id, direction, action, &slice, orders_emitted + orders.len())
                .await?
            {
                Some((account_decision, order)) => {
                    decision.accounts.push(account_decision);
                    orders.push(order);
                }
                None => skipped.push(slice.account_id),
            }
        }

        if orders.is_empty() {
            return Err(FundError::Failed(format!(
                "margin exhausted on every eligible account ({})",
                skipped.join(", ")
            )));
        }
        Ok(())
    }

    /// Multi-leg option orders: all legs route to the single account with
    /// the most available margin, with their explicit per-leg quantities.
    /// The combo margin comes from the broker preview — there is no per-leg
    /// estimate.
    #[allow(clippy::too_many_arguments)]
    async fn leg_orders(
        &self,
        signal: &Signal,
        strategy: &Strategy,
        fund_id: &str,
        action: SignalAction,
        orders_emitted: usize,
        decision: &mut FundDecision,
        orders: &mut Vec<Order>,
    ) -> Result<(), FundError> {
        let eligible =
            sizing::eligible_accounts(&self.db, strategy, fund_id, signal.instrument_type);
        let Some(account) = eligible.first() else {
            return Err(FundError::Failed("no eligible account".into()));
        };

        let combo_margin = match self
            .margin
            .requirement(&account.account_id, signal, 1.0)
            .await
        {
            Ok(r) => r,
            Err(MarginError::Preview(msg)) => return Err(FundError::Transient(msg)),
            Err(e) => return Err(FundError::Failed(e.to_string())),
        };

        let legs = signal.legs.as_ref().expect("caller checked legs");
        for (i, leg) in legs.iter().enumerate() {
            let quantity = PrecisionService::normalize_quantity(leg.qty, 0);
            if quantity <= 0.0 {
                warn!(
                    signal_id = %signal.signal_id,
                    leg = %leg.ticker,
                    "option leg with non-positive quantity skipped"
                );
                continue;
            }
            let direction = if leg.action.to_ascii_uppercase().starts_with("SELL") {
                Direction::Short
            } else {
                Direction::Long
            };

            // The combo's margin is booked against the first leg.
            let margin = if i == 0 { combo_margin.initial_margin } else { 0.0 };
            let mut order = self.make_order(
                signal,
                fund_id,
                &account.account_id,
                account.broker,
                direction,
                action,
                quantity,
                margin,
                orders_emitted + orders.len(),
            );
            order.instrument = leg.ticker.clone();
            if leg.expiry.is_some() {
                order.expiry = leg.expiry.clone();
            }

            decision.accounts.push(AccountDecision {
                account_id: account.account_id.clone(),
                broker: account.broker,
                allocated_capital: 0.0,
                quantity,
                margin_required: margin,
                order_id: order.order_id.clone(),
            });
            orders.push(order);
        }

        if orders.is_empty() {
            return Err(FundError::Failed("no valid option legs".into()));
        }
        Ok(())
    }

    /// Size one account's order; `None` when the account cannot take any
    /// quantity (too little capital or margin headroom).
    async fn account_order(
        &self,
        signal: &Signal,
        fund_id: &str,
        direction: Direction,
        action: SignalAction,
        slice: &CapitalSlice,
        emitted: usize,
    ) -> Result<Option<(AccountDecision, Order)>, FundError> {
        let broker = self.query_broker(&slice.account_id);
        let Some(broker) = broker else {
            return Ok(None);
        };

        let precision = self
            .precision
            .precision(
                broker.as_ref(),
                &slice.account_id,
                &signal.instrument,
                signal.instrument_type,
            )
            .await;

        let raw_quantity = slice.capital / signal.price;
        let mut quantity = PrecisionService::normalize_quantity(raw_quantity, precision);
        if quantity <= 0.0 {
            debug!(
                account_id = %slice.account_id,
                capital = slice.capital,
                "allocated capital too small for one unit"
            );
            return Ok(None);
        }

        let requirement = match self
            .margin
            .requirement(&slice.account_id, signal, quantity)
            .await
        {
            Ok(r) => r,
            Err(MarginError::Preview(msg)) => return Err(FundError::Transient(msg)),
            Err(e) => return Err(FundError::Failed(e.to_string())),
        };
        let mut initial_margin = requirement.initial_margin;

        // Hard margin limit: margin_used + required <= equity * limit.
        if let Some(account) = self.db.accounts.get(&slice.account_id) {
            let limit = account.balances.equity * self.margin_limit_pct / 100.0;
            let headroom = limit - account.balances.margin_used;
            if initial_margin > headroom {
                if headroom <= 0.0 {
                    warn!(
                        account_id = %slice.account_id,
                        margin_used = account.balances.margin_used,
                        limit,
                        "margin limit exhausted — skipping account"
                    );
                    return Ok(None);
                }
                // Shrink to fit. Margin scales linearly with quantity for
                // every rate-based rule; preview-quoted margin is treated
                // the same, which errs conservative.
                let scale = headroom / initial_margin;
                let shrunk =
                    PrecisionService::normalize_quantity(quantity * scale, precision);
                if shrunk <= 0.0 {
                    return Ok(None);
                }
                info!(
                    account_id = %slice.account_id,
                    from = quantity,
                    to = shrunk,
                    "order shrunk to fit margin limit"
                );
                initial_margin *= shrunk / quantity;
                quantity = shrunk;
            }
        }

        let order = self.make_order(
            signal,
            fund_id,
            &slice.account_id,
            slice.broker,
            direction,
            action,
            quantity,
            initial_margin,
            emitted,
        );
        let account_decision = AccountDecision {
            account_id: slice.account_id.clone(),
            broker: slice.broker,
            allocated_capital: slice.capital,
            quantity,
            margin_required: initial_margin,
            order_id: order.order_id.clone(),
        };
        Ok(Some((account_decision, order)))
    }

    #[allow(clippy::too_many_arguments)]
    fn make_order(
        &self,
        signal: &Signal,
        fund_id: &str,
        account_id: &str,
        broker: BrokerKind,
        direction: Direction,
        action: SignalAction,
        quantity: f64,
        margin_used: f64,
        emitted: usize,
    ) -> Order {
        // First order keeps the bare `_ORD` suffix; fan-out continues `_ORD_2`,
        // `_ORD_3`, ... across funds and accounts.
        let order_id = if emitted == 0 {
            format!("{}_ORD", signal.signal_id)
        } else {
            format!("{}_ORD_{}", signal.signal_id, emitted + 1)
        };
        let now = Utc::now();

        Order {
            order_id,
            signal_id: signal.signal_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            fund_id: fund_id.to_string(),
            account_id: account_id.to_string(),
            broker,
            instrument: signal.instrument.clone(),
            instrument_type: signal.instrument_type,
            direction,
            action,
            quantity,
            order_type: signal.order_type,
            price: signal.price,
            stop_price: signal.stop_loss,
            status: OrderStatus::Pending,
            expiry: signal.expiry.clone(),
            exchange: signal.exchange.clone(),
            broker_order_id: None,
            rejection_reason: None,
            notional_value: quantity * signal.price,
            margin_used,
            created_at: now,
            updated_at: now,
        }
    }

    /// Query-side broker adapter for an account (precision lookups only).
    fn query_broker(&self, account_id: &str) -> Option<Arc<dyn Broker>> {
        if let Some(existing) = self.query_brokers.read().get(account_id) {
            return Some(existing.clone());
        }
        let account = self.db.accounts.get(account_id)?;
        let broker = create_broker(&account, self.mock_brokers);
        self.query_brokers
            .write()
            .insert(account_id.to_string(), broker.clone());
        Some(broker)
    }
}

impl std::fmt::Debug for CerebroService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CerebroService")
            .field("mock_brokers", &self.mock_brokers)
            .field("margin_limit_pct", &self.margin_limit_pct)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusReceivers;
    use crate::positions::{Position, PositionStatus};
    use crate::types::{
        AccountBalances, AccountStatus, Allocation, AllocationStatus, AssetClass, BrokerAuth,
        ConnectionState, Fund, OrderType, TradingAccount,
    };

    fn seeded_db() -> Arc<Database> {
        let db = Arc::new(Database::new(16));
        let mut asset_classes = HashMap::new();
        asset_classes.insert(AssetClass::Equity, vec!["SPY".to_string()]);
        asset_classes.insert(AssetClass::Forex, vec!["AUDCAD".to_string()]);
        asset_classes.insert(AssetClass::Futures, vec!["GC".to_string()]);
        asset_classes.insert(AssetClass::Options, vec!["SPY".to_string()]);

        db.accounts.insert(
            "Mock_Paper",
            TradingAccount {
                account_id: "Mock_Paper".into(),
                broker: BrokerKind::Mock,
                fund_id: "fund_alpha".into(),
                status: AccountStatus::Active,
                authentication: BrokerAuth::default(),
                asset_classes,
                balances: AccountBalances {
                    equity: 1_000_000.0,
                    cash_balance: 1_000_000.0,
                    margin_available: 1_000_000.0,
                    ..Default::default()
                },
                open_positions: Vec::new(),
                connection: ConnectionState::Connected,
                last_polled_at: None,
            },
        );
        db.funds.insert(
            "fund_alpha",
            Fund {
                fund_id: "fund_alpha".into(),
                name: "Alpha".into(),
                total_equity: 0.0,
                updated_at: None,
            },
        );
        db.strategies.insert(
            "SPY_Trend",
            Strategy {
                strategy_id: "SPY_Trend".into(),
                asset_class: AssetClass::Equity,
                accounts: vec!["Mock_Paper".into()],
                status: StrategyStatus::Active,
                optimize: false,
            },
        );
        db.allocations.insert(
            "alloc_1",
            Allocation {
                allocation_id: "alloc_1".into(),
                fund_id: "fund_alpha".into(),
                status: AllocationStatus::Active,
                allocations: HashMap::from([("SPY_Trend".to_string(), 10.0)]),
            },
        );
        db
    }

    fn service(db: Arc<Database>) -> (CerebroService, BusReceivers) {
        let (bus, receivers) = Bus::new(32, Duration::from_millis(10));
        let (_tx, rx) = watch::channel(false);
        // Leak the sender so the shutdown channel stays open for the test.
        std::mem::forget(_tx);
        let svc = CerebroService::new(
            db,
            bus,
            "http://127.0.0.1:1",
            true,
            80.0,
            24,
            1,
            Duration::from_millis(1),
            rx,
        );
        (svc, receivers)
    }

    fn stock_entry(id: &str) -> Signal {
        Signal {
            signal_id: id.to_string(),
            strategy_id: "SPY_Trend".into(),
            timestamp: Utc::now(),
            instrument: "SPY".into(),
            instrument_type: InstrumentType::Stock,
            direction: Direction::Long,
            action: Some(SignalAction::Entry),
            side: Some(OrderSide::Buy),
            order_type: OrderType::Market,
            price: 450.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            quantity: 1.0,
            expiry: None,
            exchange: None,
            legs: None,
        }
    }

    fn open_position(qty: f64, price: f64, direction: Direction) -> Position {
        Position {
            position_id: format!("SPY_Trend_SPY_{direction}_20260301_100000"),
            strategy_id: "SPY_Trend".into(),
            account_id: "Mock_Paper".into(),
            instrument: "SPY".into(),
            direction,
            quantity: qty,
            avg_entry_price: price,
            total_cost_basis: qty * price,
            margin_used: qty * price * 0.25,
            status: PositionStatus::Open,
            entry_order_ids: vec!["prior_ORD".into()],
            exit_order_ids: vec![],
            pnl_realized: 0.0,
            pnl_unrealized: 0.0,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn simple_stock_entry_sizes_to_allocation() {
        let db = seeded_db();
        let (svc, mut receivers) = service(db.clone());

        let outcome = svc.process_signal(&stock_entry("sig_entry")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        // One order: floor(100_000 / 450) = 222 shares, notional <= 100k.
        let record = db.signal_store.get("sig_entry").unwrap();
        assert_eq!(record.status, DecisionStatus::Decided);
        assert_eq!(record.order_ids, vec!["sig_entry_ORD".to_string()]);

        let order = db.orders.get("sig_entry_ORD").unwrap();
        assert_eq!(order.quantity, 222.0);
        assert!(order.notional_value <= 100_000.0);
        assert_eq!(order.status, OrderStatus::Pending);
        // Reg T margin: 25% of notional.
        assert!((order.margin_used - order.notional_value * 0.25).abs() < 1e-6);

        // Published on the orders topic.
        let delivery = receivers.trading_orders.recv().await.unwrap();
        assert_eq!(delivery.payload.order_id, "sig_entry_ORD");
        delivery.ack();

        // Conservation: allocated capital within the fund's percentage.
        let fund = record.funds.first().unwrap();
        assert!((fund.allocated_capital - 100_000.0).abs() < 1e-6);
        assert!(order.notional_value <= fund.allocated_capital);
    }

    #[tokio::test]
    async fn duplicate_signal_is_acked_without_side_effects() {
        let db = seeded_db();
        let (svc, _receivers) = service(db.clone());

        svc.process_signal(&stock_entry("sig_dup")).await;
        let orders_before = db.orders.len();

        let outcome = svc.process_signal(&stock_entry("sig_dup")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);
        assert_eq!(db.orders.len(), orders_before);
        assert_eq!(db.signal_store.len(), 1);
    }

    #[tokio::test]
    async fn no_active_allocation_rejects() {
        let db = seeded_db();
        db.allocations.update("alloc_1", |a| a.status = AllocationStatus::Archived);
        let (svc, _receivers) = service(db.clone());

        let outcome = svc.process_signal(&stock_entry("sig_noalloc")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_noalloc").unwrap();
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert!(record.reason.as_ref().unwrap().contains("allocation"));
        assert!(db.orders.is_empty());
    }

    #[tokio::test]
    async fn futures_without_expiry_rejected() {
        let db = seeded_db();
        let (svc, _receivers) = service(db.clone());

        let mut signal = stock_entry("sig_gc");
        signal.instrument = "GC".into();
        signal.instrument_type = InstrumentType::Future;
        signal.price = 2_000.0;
        signal.expiry = None;
        signal.exchange = Some("COMEX".into());

        let outcome = svc.process_signal(&signal).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_gc").unwrap();
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert!(record.reason.as_ref().unwrap().contains("expiry required"));
        assert!(db.orders.is_empty());
    }

    #[tokio::test]
    async fn forex_entry_uses_leveraged_margin_without_shrink() {
        let db = seeded_db();
        // Smaller fund: 100k equity, 10% allocation -> 10k capital.
        db.accounts.update("Mock_Paper", |a| {
            a.balances.equity = 100_000.0;
            a.balances.margin_available = 50_000.0;
        });
        let (svc, _receivers) = service(db.clone());

        let mut signal = stock_entry("sig_fx");
        signal.instrument = "AUDCAD".into();
        signal.instrument_type = InstrumentType::Forex;
        signal.price = 0.9;
        signal.quantity = 100_000.0;

        let outcome = svc.process_signal(&signal).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_fx").unwrap();
        assert_eq!(record.status, DecisionStatus::Decided);
        let order = db.orders.get(&record.order_ids[0]).unwrap();
        // 2% margin on the order's notional; no shrink was needed.
        assert!((order.margin_used - order.notional_value * 0.02).abs() < 1e-6);
        let fund = record.funds.first().unwrap();
        assert_eq!(fund.accounts.len(), 1);
        assert_eq!(fund.accounts[0].quantity, order.quantity);
    }

    #[tokio::test]
    async fn exit_emits_order_for_held_quantity() {
        let db = seeded_db();
        db.accounts.update("Mock_Paper", |a| {
            a.open_positions.push(open_position(100.0, 450.0, Direction::Long));
        });
        let (svc, _receivers) = service(db.clone());

        let mut signal = stock_entry("sig_exit");
        signal.action = Some(SignalAction::Exit);
        signal.side = Some(OrderSide::Sell);
        signal.price = 455.0;
        signal.quantity = 100.0;

        let outcome = svc.process_signal(&signal).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_exit").unwrap();
        assert_eq!(record.status, DecisionStatus::Decided);
        let order = db.orders.get(&record.order_ids[0]).unwrap();
        assert_eq!(order.action, SignalAction::Exit);
        assert_eq!(order.direction, Direction::Long);
        assert_eq!(order.quantity, 100.0);
        // Exits release margin; nothing is consumed.
        assert_eq!(order.margin_used, 0.0);
    }

    #[tokio::test]
    async fn inferred_exit_from_opposite_position() {
        let db = seeded_db();
        db.accounts.update("Mock_Paper", |a| {
            a.open_positions.push(open_position(100.0, 450.0, Direction::Long));
        });
        let (svc, _receivers) = service(db.clone());

        // No explicit action: SHORT/SELL against an open LONG infers EXIT.
        let mut signal = stock_entry("sig_inferred");
        signal.action = None;
        signal.direction = Direction::Short;
        signal.side = Some(OrderSide::Sell);
        signal.quantity = 100.0;

        let outcome = svc.process_signal(&signal).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_inferred").unwrap();
        assert_eq!(record.resolved_action, Some(SignalAction::Exit));
        let order = db.orders.get(&record.order_ids[0]).unwrap();
        // The exit order targets the held LONG position.
        assert_eq!(order.direction, Direction::Long);
        assert_eq!(order.quantity, 100.0);
    }

    #[tokio::test]
    async fn margin_limit_shrinks_oversized_order() {
        let db = seeded_db();
        // 79% of the 80% limit already consumed.
        db.accounts.update("Mock_Paper", |a| {
            a.balances.margin_used = 790_000.0;
            a.balances.margin_available = 210_000.0;
        });
        let (svc, _receivers) = service(db.clone());

        let outcome = svc.process_signal(&stock_entry("sig_shrink")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_shrink").unwrap();
        assert_eq!(record.status, DecisionStatus::Decided);
        let order = db.orders.get(&record.order_ids[0]).unwrap();
        // Headroom is 10k; margin must fit inside it.
        assert!(order.margin_used <= 10_000.0 + 1e-6);
        assert!(order.quantity < 222.0);
        assert!(order.quantity > 0.0);
    }

    #[tokio::test]
    async fn margin_exhausted_rejects_cleanly() {
        let db = seeded_db();
        db.accounts.update("Mock_Paper", |a| {
            a.balances.margin_used = 900_000.0;
        });
        let (svc, _receivers) = service(db.clone());

        let outcome = svc.process_signal(&stock_entry("sig_exhausted")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_exhausted").unwrap();
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert!(record
            .reason
            .as_ref()
            .unwrap()
            .contains("margin exhausted"));
    }

    #[tokio::test]
    async fn option_legs_require_broker_preview() {
        let db = seeded_db();
        let (svc, _receivers) = service(db.clone());

        let mut signal = stock_entry("sig_legs");
        signal.instrument_type = InstrumentType::Option;
        signal.price = 5.0;
        signal.legs = Some(vec![
            crate::types::OptionLeg {
                ticker: "SPY_C450".into(),
                action: "BUY_CALL".into(),
                qty: 1.0,
                strike: Some(450.0),
                expiry: Some("20260320".into()),
                option_type: Some("call".into()),
            },
            crate::types::OptionLeg {
                ticker: "SPY_C460".into(),
                action: "SELL_CALL".into(),
                qty: 1.0,
                strike: Some(460.0),
                expiry: Some("20260320".into()),
                option_type: Some("call".into()),
            },
        ]);

        // Mock mode has no broker preview, and options margin is never
        // estimated — the decision is a clean REJECT.
        let outcome = svc.process_signal(&signal).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_legs").unwrap();
        assert_eq!(record.status, DecisionStatus::Rejected);
        assert!(record.reason.as_ref().unwrap().contains("preview"));
        assert!(db.orders.is_empty());
    }

    #[tokio::test]
    async fn multi_fund_fanout_gets_suffixed_order_ids() {
        let db = seeded_db();
        // Second fund with its own account and allocation.
        let mut asset_classes = HashMap::new();
        asset_classes.insert(AssetClass::Equity, vec!["SPY".to_string()]);
        db.accounts.insert(
            "Mock_Beta",
            TradingAccount {
                account_id: "Mock_Beta".into(),
                broker: BrokerKind::Mock,
                fund_id: "fund_beta".into(),
                status: AccountStatus::Active,
                authentication: BrokerAuth::default(),
                asset_classes,
                balances: AccountBalances {
                    equity: 500_000.0,
                    cash_balance: 500_000.0,
                    margin_available: 500_000.0,
                    ..Default::default()
                },
                open_positions: Vec::new(),
                connection: ConnectionState::Connected,
                last_polled_at: None,
            },
        );
        db.funds.insert(
            "fund_beta",
            Fund {
                fund_id: "fund_beta".into(),
                name: "Beta".into(),
                total_equity: 0.0,
                updated_at: None,
            },
        );
        db.allocations.insert(
            "alloc_2",
            Allocation {
                allocation_id: "alloc_2".into(),
                fund_id: "fund_beta".into(),
                status: AllocationStatus::Active,
                allocations: HashMap::from([("SPY_Trend".to_string(), 20.0)]),
            },
        );
        db.strategies.update("SPY_Trend", |s| {
            s.accounts.push("Mock_Beta".into());
        });
        let (svc, _receivers) = service(db.clone());

        let outcome = svc.process_signal(&stock_entry("sig_multi")).await;
        assert_eq!(outcome, ProcessOutcome::Ack);

        let record = db.signal_store.get("sig_multi").unwrap();
        assert_eq!(record.status, DecisionStatus::Decided);
        assert_eq!(record.order_ids.len(), 2);
        assert_eq!(record.order_ids[0], "sig_multi_ORD");
        assert_eq!(record.order_ids[1], "sig_multi_ORD_2");

        // Conservation of capital: each order stays within its fund's slice.
        for fund in &record.funds {
            let fund_notional: f64 = fund
                .accounts
                .iter()
                .map(|a| db.orders.get(&a.order_id).unwrap().notional_value)
                .sum();
            assert!(fund_notional <= fund.allocated_capital + 1e-6);
        }
    }
}
