// =============================================================================
// Fund allocation & capital distribution
// =============================================================================
//
// Per-fund sizing helpers: which ACTIVE allocations carry a strategy, how
// much fund equity backs them (recomputed from member accounts and persisted
// on every decision), how much of the strategy's slice is already consumed
// by working orders, and how a target amount of capital is split across the
// eligible accounts.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::Database;
use crate::types::{
    AccountStatus, Allocation, AllocationStatus, BrokerKind, InstrumentType, Strategy,
};

// ---------------------------------------------------------------------------
// Fund discovery
// ---------------------------------------------------------------------------

/// Every ACTIVE allocation that includes `strategy_id`. One independent
/// sizing attempt is made per returned allocation.
pub fn active_allocations_for_strategy(db: &Database, strategy_id: &str) -> Vec<Allocation> {
    let allocations = db.allocations.find(|a| {
        a.status == AllocationStatus::Active && a.allocations.contains_key(strategy_id)
    });
    debug!(
        strategy_id,
        count = allocations.len(),
        "active allocations found for strategy"
    );
    allocations
}

// ---------------------------------------------------------------------------
// Fund equity
// ---------------------------------------------------------------------------

/// Recompute a fund's total equity as the sum of its member accounts' equity
/// and persist it on the fund document.
pub fn calculate_fund_equity(db: &Database, fund_id: &str) -> f64 {
    let accounts = db.accounts.find(|a| a.fund_id == fund_id);
    let total_equity: f64 = accounts.iter().map(|a| a.balances.equity).sum();

    let updated = db.funds.update(fund_id, |fund| {
        fund.total_equity = total_equity;
        fund.updated_at = Some(Utc::now());
    });
    if updated.is_none() {
        warn!(fund_id, "fund document missing while recomputing equity");
    }

    info!(
        fund_id,
        total_equity,
        accounts = accounts.len(),
        "fund equity recomputed"
    );
    total_equity
}

// ---------------------------------------------------------------------------
// Strategy capital within a fund
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StrategyCapital {
    /// `fund_equity * allocation_pct / 100`.
    pub allocated: f64,
    /// Σ notional of this strategy's FILLED/SUBMITTED orders in this fund.
    pub used: f64,
    /// `max(0, allocated - used)`.
    pub available: f64,
}

/// Capital backing `strategy_id` from `fund_id` right now. Recomputes (and
/// persists) the fund equity first so sizing always sees current numbers.
pub fn strategy_capital_for_fund(
    db: &Database,
    fund_id: &str,
    strategy_id: &str,
) -> StrategyCapital {
    let fund_equity = calculate_fund_equity(db, fund_id);
    if fund_equity <= 0.0 {
        warn!(fund_id, fund_equity, "fund has zero or negative equity");
        return StrategyCapital::default();
    }

    let allocation = db
        .allocations
        .find(|a| a.fund_id == fund_id && a.status == AllocationStatus::Active)
        .into_iter()
        .next();
    let Some(allocation) = allocation else {
        warn!(fund_id, "no ACTIVE allocation for fund");
        return StrategyCapital::default();
    };

    let pct = allocation.pct_for(strategy_id);
    if pct <= 0.0 {
        warn!(fund_id, strategy_id, "strategy has zero allocation in fund");
        return StrategyCapital::default();
    }

    let allocated = fund_equity * (pct / 100.0);
    let used: f64 = db
        .orders
        .find(|o| {
            o.fund_id == fund_id && o.strategy_id == strategy_id && o.status.consumes_capital()
        })
        .iter()
        .map(|o| o.notional_value)
        .sum();
    let available = (allocated - used).max(0.0);

    info!(
        fund_id,
        strategy_id,
        allocation_pct = pct,
        allocated,
        used,
        available,
        "strategy capital computed"
    );

    StrategyCapital {
        allocated,
        used,
        available,
    }
}

// ---------------------------------------------------------------------------
// Account eligibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EligibleAccount {
    pub account_id: String,
    pub broker: BrokerKind,
    pub available_margin: f64,
    pub equity: f64,
}

/// Accounts the strategy may deploy through for this fund and instrument:
/// allowed by the strategy, belonging to the fund, ACTIVE, and supporting
/// the instrument's asset class. Sorted by available margin, descending.
pub fn eligible_accounts(
    db: &Database,
    strategy: &Strategy,
    fund_id: &str,
    instrument_type: InstrumentType,
) -> Vec<EligibleAccount> {
    let mut eligible: Vec<EligibleAccount> = strategy
        .accounts
        .iter()
        .filter_map(|account_id| db.accounts.get(account_id))
        .filter(|account| {
            account.fund_id == fund_id
                && account.status == AccountStatus::Active
                && account.supports(instrument_type)
        })
        .map(|account| EligibleAccount {
            account_id: account.account_id.clone(),
            broker: account.broker,
            available_margin: account.balances.margin_available,
            equity: account.balances.equity,
        })
        .collect();

    eligible.sort_by(|a, b| {
        b.available_margin
            .partial_cmp(&a.available_margin)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if eligible.is_empty() {
        warn!(
            strategy_id = %strategy.strategy_id,
            fund_id,
            instrument_type = %instrument_type,
            "no eligible accounts"
        );
    }
    eligible
}

// ---------------------------------------------------------------------------
// Capital distribution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CapitalSlice {
    pub account_id: String,
    pub broker: BrokerKind,
    pub capital: f64,
}

/// Split `target_capital` across accounts in proportion to their available
/// margin, capping each account at its own margin. The last account absorbs
/// the rounding residue (still capped).
pub fn distribute_capital(target_capital: f64, accounts: &[EligibleAccount]) -> Vec<CapitalSlice> {
    if accounts.is_empty() || target_capital <= 0.0 {
        return Vec::new();
    }

    let total_margin: f64 = accounts.iter().map(|a| a.available_margin).sum();
    if total_margin <= 0.0 {
        warn!("total available margin is zero across eligible accounts");
        return Vec::new();
    }

    let mut slices = Vec::with_capacity(accounts.len());
    let mut remaining = target_capital;

    for (i, account) in accounts.iter().enumerate() {
        let allocated = if i == accounts.len() - 1 {
            remaining.min(account.available_margin)
        } else {
            ((account.available_margin / total_margin) * target_capital)
                .min(account.available_margin)
        };

        if allocated > 0.0 {
            slices.push(CapitalSlice {
                account_id: account.account_id.clone(),
                broker: account.broker,
                capital: allocated,
            });
            remaining -= allocated;
        }
    }

    let distributed: f64 = slices.iter().map(|s| s.capital).sum();
    debug!(
        target_capital,
        distributed,
        accounts = slices.len(),
        "capital distributed across accounts"
    );
    slices
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AccountBalances, AssetClass, BrokerAuth, ConnectionState, Order, OrderStatus, OrderType,
        SignalAction, StrategyStatus, TradingAccount,
    };
    use crate::types::{Direction, Fund};
    use std::collections::HashMap;

    fn account(id: &str, fund: &str, equity: f64, margin_available: f64) -> TradingAccount {
        let mut asset_classes = HashMap::new();
        asset_classes.insert(AssetClass::Equity, vec!["SPY".to_string()]);
        TradingAccount {
            account_id: id.into(),
            broker: BrokerKind::Mock,
            fund_id: fund.into(),
            status: AccountStatus::Active,
            authentication: BrokerAuth::default(),
            asset_classes,
            balances: AccountBalances {
                equity,
                cash_balance: equity,
                margin_available,
                ..Default::default()
            },
            open_positions: Vec::new(),
            connection: ConnectionState::Connected,
            last_polled_at: None,
        }
    }

    fn eligible(id: &str, margin: f64) -> EligibleAccount {
        EligibleAccount {
            account_id: id.into(),
            broker: BrokerKind::Mock,
            available_margin: margin,
            equity: margin,
        }
    }

    fn seeded_db() -> Database {
        let db = Database::new(16);
        db.funds.insert(
            "fund_alpha",
            Fund {
                fund_id: "fund_alpha".into(),
                name: "Alpha".into(),
                total_equity: 0.0,
                updated_at: None,
            },
        );
        db.accounts
            .insert("acct_a", account("acct_a", "fund_alpha", 600_000.0, 500_000.0));
        db.accounts
            .insert("acct_b", account("acct_b", "fund_alpha", 400_000.0, 300_000.0));
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

    #[test]
    fn fund_equity_recomputed_and_persisted() {
        let db = seeded_db();
        let equity = calculate_fund_equity(&db, "fund_alpha");
        assert!((equity - 1_000_000.0).abs() < 1e-9);

        let fund = db.funds.get("fund_alpha").unwrap();
        assert!((fund.total_equity - 1_000_000.0).abs() < 1e-9);
        assert!(fund.updated_at.is_some());
    }

    #[test]
    fn allocated_capital_follows_percentage() {
        let db = seeded_db();
        let capital = strategy_capital_for_fund(&db, "fund_alpha", "SPY_Trend");
        assert!((capital.allocated - 100_000.0).abs() < 1e-9);
        assert!((capital.used).abs() < f64::EPSILON);
        assert!((capital.available - 100_000.0).abs() < 1e-9);
    }

    #[test]
    fn used_capital_subtracts_working_orders() {
        let db = seeded_db();
        let order = Order {
            order_id: "sig_ORD".into(),
            signal_id: "sig".into(),
            strategy_id: "SPY_Trend".into(),
            fund_id: "fund_alpha".into(),
            account_id: "acct_a".into(),
            broker: BrokerKind::Mock,
            instrument: "SPY".into(),
            instrument_type: InstrumentType::Stock,
            direction: Direction::Long,
            action: SignalAction::Entry,
            quantity: 100.0,
            order_type: OrderType::Market,
            price: 450.0,
            stop_price: 0.0,
            status: OrderStatus::Submitted,
            expiry: None,
            exchange: None,
            broker_order_id: None,
            rejection_reason: None,
            notional_value: 45_000.0,
            margin_used: 11_250.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.orders.insert("sig_ORD", order.clone());

        // A rejected order must not consume capital.
        let mut rejected = order;
        rejected.order_id = "sig2_ORD".into();
        rejected.status = OrderStatus::Rejected;
        db.orders.insert("sig2_ORD", rejected);

        let capital = strategy_capital_for_fund(&db, "fund_alpha", "SPY_Trend");
        assert!((capital.used - 45_000.0).abs() < 1e-9);
        assert!((capital.available - 55_000.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_strategy_gets_zero_capital() {
        let db = seeded_db();
        let capital = strategy_capital_for_fund(&db, "fund_alpha", "Unlisted");
        assert_eq!(capital.allocated, 0.0);
        assert_eq!(capital.available, 0.0);
    }

    #[test]
    fn eligible_accounts_filtered_and_sorted() {
        let db = seeded_db();
        // Account outside the fund and one without the asset class.
        db.accounts
            .insert("acct_other_fund", account("acct_other_fund", "fund_beta", 1.0, 1.0));
        let mut no_equity = account("acct_no_eq", "fund_alpha", 100.0, 100.0);
        no_equity.asset_classes.clear();
        db.accounts.insert("acct_no_eq", no_equity);

        let strategy = Strategy {
            strategy_id: "SPY_Trend".into(),
            asset_class: AssetClass::Equity,
            accounts: vec![
                "acct_a".into(),
                "acct_b".into(),
                "acct_other_fund".into(),
                "acct_no_eq".into(),
                "acct_missing".into(),
            ],
            status: StrategyStatus::Active,
            optimize: false,
        };

        let eligible = eligible_accounts(&db, &strategy, "fund_alpha", InstrumentType::Stock);
        let ids: Vec<&str> = eligible.iter().map(|a| a.account_id.as_str()).collect();
        // Sorted by available margin descending.
        assert_eq!(ids, vec!["acct_a", "acct_b"]);
    }

    #[test]
    fn distribution_is_proportional_with_last_account_residue() {
        // The worked example from the allocation design: 15,000 across
        // margins of 15,000 and 8,000.
        let accounts = vec![eligible("main", 15_000.0), eligible("futs", 8_000.0)];
        let slices = distribute_capital(15_000.0, &accounts);

        assert_eq!(slices.len(), 2);
        assert!((slices[0].capital - 15_000.0 * 15_000.0 / 23_000.0).abs() < 1e-6);
        // Last account absorbs the residue.
        let total: f64 = slices.iter().map(|s| s.capital).sum();
        assert!((total - 15_000.0).abs() < 1e-6);
    }

    #[test]
    fn distribution_caps_each_account_at_its_margin() {
        let accounts = vec![eligible("small", 1_000.0), eligible("tiny", 500.0)];
        let slices = distribute_capital(100_000.0, &accounts);

        assert!(slices[0].capital <= 1_000.0 + 1e-9);
        assert!(slices[1].capital <= 500.0 + 1e-9);
        // Conservation: never distributes more than target.
        let total: f64 = slices.iter().map(|s| s.capital).sum();
        assert!(total <= 100_000.0);
    }

    #[test]
    fn distribution_edge_cases() {
        assert!(distribute_capital(0.0, &[eligible("a", 10.0)]).is_empty());
        assert!(distribute_capital(-5.0, &[eligible("a", 10.0)]).is_empty());
        assert!(distribute_capital(100.0, &[]).is_empty());
        assert!(distribute_capital(100.0, &[eligible("a", 0.0)]).is_empty());
    }

    #[test]
    fn active_allocation_discovery_ignores_archived() {
        let db = seeded_db();
        db.allocations.insert(
            "alloc_old",
            Allocation {
                allocation_id: "alloc_old".into(),
                fund_id: "fund_alpha".into(),
                status: AllocationStatus::Archived,
                allocations: HashMap::from([("SPY_Trend".to_string(), 50.0)]),
            },
        );

        let found = active_allocations_for_strategy(&db, "SPY_Trend");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].allocation_id, "alloc_1");
        assert!(active_allocations_for_strategy(&db, "Other").is_empty());
    }
}
