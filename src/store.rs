// =============================================================================
// Document store — keyed collections with per-document atomic updates
// =============================================================================
//
// The persistence seam of the pipeline. Each collection is keyed by the
// document's natural id and every mutation happens inside one lock-held
// closure, which gives the single-document atomicity the critical writes
// (embedded open-positions arrays, recorded decisions) rely on — no
// cross-collection lock is ever taken.
//
// The raw signal store additionally exposes a change stream: every insert is
// fanned out to subscribers together with a monotonic sequence number that
// doubles as the resume token for the ingestion tail.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cerebro::SignalRecord;
use crate::positions::ClosedPosition;
use crate::types::{
    Allocation, Environment, ExecutionConfirmation, Fund, Order, RawSignalRow, Strategy,
    TradingAccount,
};

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// A keyed document collection. Documents are cloned out on read; writes go
/// through [`Collection::update`] so each document mutation is atomic.
pub struct Collection<T: Clone> {
    name: &'static str,
    docs: RwLock<BTreeMap<String, T>>,
}

impl<T: Clone> Collection<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert or replace the document under `id`.
    pub fn insert(&self, id: impl Into<String>, doc: T) {
        self.docs.write().insert(id.into(), doc);
    }

    /// Insert only if `id` is absent. Returns false when the document already
    /// existed (the document is left untouched).
    pub fn insert_new(&self, id: impl Into<String>, doc: T) -> bool {
        let mut docs = self.docs.write();
        let id = id.into();
        if docs.contains_key(&id) {
            return false;
        }
        docs.insert(id, doc);
        true
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.docs.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.read().contains_key(id)
    }

    /// Mutate the document under `id` while holding the write lock. The
    /// closure's return value is passed through; `None` when the document
    /// does not exist.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut docs = self.docs.write();
        docs.get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.docs.write().remove(id)
    }

    /// All documents matching `pred`, in key order.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.docs
            .read()
            .values()
            .filter(|doc| pred(doc))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<T> {
        self.docs.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

impl<T: Clone> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Raw signal store with change stream
// ---------------------------------------------------------------------------

/// One change-stream event: an inserted raw row plus its resume token.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub resume_token: u64,
    pub row: RawSignalRow,
}

/// The durable raw signal store. Inserts are broadcast to change-stream
/// subscribers; `signal_processed` is the persistent watermark the catch-up
/// scan keys off.
pub struct RawSignalStore {
    rows: RwLock<BTreeMap<String, RawSignalRow>>,
    seq: AtomicU64,
    stream: broadcast::Sender<ChangeEvent>,
}

impl RawSignalStore {
    fn new(stream_capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(stream_capacity);
        Self {
            rows: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            stream,
        }
    }

    /// Append a row and emit a change event. Returns the resume token
    /// assigned to the insert.
    pub fn insert(&self, row: RawSignalRow) -> u64 {
        let token = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.write().insert(row.row_id.clone(), row.clone());

        // Send fails only when nobody is subscribed, which is fine — the
        // catch-up scan will pick the row up.
        let _ = self.stream.send(ChangeEvent {
            resume_token: token,
            row,
        });
        token
    }

    pub fn get(&self, row_id: &str) -> Option<RawSignalRow> {
        self.rows.read().get(row_id).cloned()
    }

    /// Flip the persistent watermark. Best-effort by contract: callers must
    /// not fail the pipeline when the row has vanished.
    pub fn mark_processed(&self, row_id: &str) -> bool {
        self.rows
            .write()
            .get_mut(row_id)
            .map(|row| row.signal_processed = true)
            .is_some()
    }

    /// Unprocessed rows for `environment`, ascending by `received_at`
    /// (the catch-up phase contract).
    pub fn unprocessed(&self, environment: Environment) -> Vec<RawSignalRow> {
        let mut rows: Vec<RawSignalRow> = self
            .rows
            .read()
            .values()
            .filter(|row| !row.signal_processed && row.environment == environment)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.received_at);
        rows
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.stream.subscribe()
    }

    /// The latest resume token handed out.
    pub fn current_token(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }
}

impl std::fmt::Debug for RawSignalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSignalStore")
            .field("rows", &self.len())
            .field("resume_token", &self.current_token())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Bootstrap payload seeding the reference collections at start-up.
#[derive(Debug, Default, Deserialize)]
pub struct BootstrapData {
    #[serde(default)]
    pub accounts: Vec<TradingAccount>,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub funds: Vec<Fund>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

/// All collections shared by the pipeline stages.
#[derive(Debug)]
pub struct Database {
    pub raw_signals: RawSignalStore,
    pub signal_store: Collection<SignalRecord>,
    pub orders: Collection<Order>,
    pub accounts: Collection<TradingAccount>,
    pub closed_positions: Collection<ClosedPosition>,
    pub strategies: Collection<Strategy>,
    pub funds: Collection<Fund>,
    pub allocations: Collection<Allocation>,
    pub confirmations: Collection<ExecutionConfirmation>,
}

impl Database {
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            raw_signals: RawSignalStore::new(stream_capacity),
            signal_store: Collection::new("signal_store"),
            orders: Collection::new("trading_orders"),
            accounts: Collection::new("trading_accounts"),
            closed_positions: Collection::new("closed_positions"),
            strategies: Collection::new("strategies"),
            funds: Collection::new("funds"),
            allocations: Collection::new("portfolio_allocations"),
            confirmations: Collection::new("execution_confirmations"),
        }
    }

    /// Seed accounts, strategies, funds, and allocations from the bootstrap
    /// file. Missing file is an error — a pipeline without accounts cannot
    /// trade, and the caller treats this as fatal start-up.
    pub fn load_bootstrap(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bootstrap data from {}", path.display()))?;
        let data: BootstrapData = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse bootstrap data from {}", path.display()))?;
        self.seed(data);
        info!(
            path = %path.display(),
            accounts = self.accounts.len(),
            strategies = self.strategies.len(),
            funds = self.funds.len(),
            allocations = self.allocations.len(),
            "bootstrap data loaded"
        );
        Ok(())
    }

    /// Insert bootstrap documents keyed by their natural ids.
    pub fn seed(&self, data: BootstrapData) {
        for account in data.accounts {
            debug!(account_id = %account.account_id, broker = %account.broker, "seeding account");
            self.accounts.insert(account.account_id.clone(), account);
        }
        for strategy in data.strategies {
            self.strategies.insert(strategy.strategy_id.clone(), strategy);
        }
        for fund in data.funds {
            self.funds.insert(fund.fund_id.clone(), fund);
        }
        for allocation in data.allocations {
            self.allocations
                .insert(allocation.allocation_id.clone(), allocation);
        }
    }
}
