// =============================================================================
// Account poller — fixed-interval broker reconciliation
// =============================================================================
//
// Polls every ACTIVE trading account on an interval: balances, margin, open
// orders, and broker-side positions land in the account document, and a
// snapshot goes out on the account-updates topic. Per-account failures are
// isolated — one broken gateway marks that account ERROR and the loop moves
// on.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::brokers::{create_broker, Broker};
use crate::bus::Bus;
use crate::store::Database;
use crate::types::{AccountStatus, AccountUpdate, ConnectionState};

pub struct AccountPoller {
    db: Arc<Database>,
    bus: Bus,
    mock_brokers: bool,
    interval: Duration,
    brokers: HashMap<String, Arc<dyn Broker>>,
    shutdown: watch::Receiver<bool>,
}

impl AccountPoller {
    pub fn new(
        db: Arc<Database>,
        bus: Bus,
        mock_brokers: bool,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            bus,
            mock_brokers,
            interval,
            brokers: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "account poller running");
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("account poller: shutdown signal received");
                        for broker in self.brokers.values() {
                            broker.disconnect().await;
                        }
                        return;
                    }
                }
                _ = tick.tick() => {
                    self.poll_all_accounts().await;
                }
            }
        }
    }

    pub async fn poll_all_accounts(&mut self) {
        let accounts = self
            .db
            .accounts
            .find(|a| a.status == AccountStatus::Active);
        debug!(count = accounts.len(), "polling active accounts");

        for account in accounts {
            let account_id = account.account_id.clone();
            if let Err(e) = self.poll_account(&account_id).await {
                warn!(account_id = %account_id, error = %e, "account poll failed");
                self.db.accounts.update(&account_id, |a| {
                    a.connection = ConnectionState::Error;
                });
            }
        }
    }

    async fn poll_account(&mut self, account_id: &str) -> anyhow::Result<()> {
        let broker = self
            .broker_for(account_id)
            .ok_or_else(|| anyhow::anyhow!("account '{account_id}' not found"))?;

        if !broker.is_connected() {
            debug!(account_id, "connecting broker session");
            broker.connect().await?;
        }

        let mut balances = broker.get_account_balance().await?;
        let margin = broker.get_margin_info().await?;
        balances.margin_used = margin.margin_used;
        balances.margin_available = margin.margin_available;
        balances.margin_utilization_pct =
            crate::types::AccountBalances::utilization_pct(margin.margin_used, balances.equity);

        let broker_positions = broker.get_open_positions().await?;
        let open_orders = broker.get_open_orders().await?;

        self.db.accounts.update(account_id, |a| {
            a.balances = balances.clone();
            a.connection = ConnectionState::Connected;
            a.last_polled_at = Some(Utc::now());
        });

        self.bus.account_updates.publish(AccountUpdate {
            account_id: account_id.to_string(),
            broker: broker.kind(),
            timestamp: Utc::now(),
            balances: balances.clone(),
            open_position_count: broker_positions.len(),
            open_order_count: open_orders.len(),
        });

        info!(
            account_id,
            equity = balances.equity,
            margin_used = balances.margin_used,
            positions = broker_positions.len(),
            "account polled"
        );
        Ok(())
    }

    fn broker_for(&mut self, account_id: &str) -> Option<Arc<dyn Broker>> {
        if let Some(broker) = self.brokers.get(account_id) {
            return Some(broker.clone());
        }
        let account = self.db.accounts.get(account_id)?;
        let broker = create_broker(&account, self.mock_brokers);
        self.brokers.insert(account_id.to_string(), broker.clone());
        Some(broker)
    }

    /// Install a pre-built session (tests).
    #[cfg(test)]
    fn install_broker(&mut self, account_id: &str, broker: Arc<dyn Broker>) {
        self.brokers.insert(account_id.to_string(), broker);
    }
}

impl std::fmt::Debug for AccountPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPoller")
            .field("interval", &self.interval)
            .field("sessions", &self.brokers.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{BrokerError, BrokerPosition, MarginInfo, OrderAck};
    use crate::types::{
        AccountBalances, BrokerAuth, BrokerKind, InstrumentType, Order, TradingAccount,
    };
    use async_trait::async_trait;

    fn seeded_db() -> Arc<Database> {
        let db = Arc::new(Database::new(16));
        db.accounts.insert(
            "Mock_Paper",
            TradingAccount {
                account_id: "Mock_Paper".into(),
                broker: BrokerKind::Mock,
                fund_id: "fund_alpha".into(),
                status: AccountStatus::Active,
                authentication: BrokerAuth::default(),
                asset_classes: HashMap::new(),
                balances: AccountBalances::default(),
                open_positions: Vec::new(),
                connection: ConnectionState::Disconnected,
                last_polled_at: None,
            },
        );
        db
    }

    fn poller(db: Arc<Database>) -> (AccountPoller, Bus) {
        let (bus, _receivers) = Bus::new(16, Duration::from_millis(10));
        std::mem::forget(_receivers);
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        (
            AccountPoller::new(db, bus.clone(), true, Duration::from_secs(300), rx),
            bus,
        )
    }

    /// A broker whose connect always fails.
    struct DeadBroker;

    #[async_trait]
    impl Broker for DeadBroker {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Ibkr
        }
        async fn connect(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn place_order(&self, _order: &Order) -> Result<OrderAck, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn cancel_order(&self, _id: &str) -> Result<bool, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn get_account_balance(&self) -> Result<AccountBalances, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn get_margin_info(&self) -> Result<MarginInfo, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn get_open_orders(&self) -> Result<Vec<String>, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
        async fn get_quantity_precision(
            &self,
            _symbol: &str,
            _instrument_type: InstrumentType,
        ) -> Result<u32, BrokerError> {
            Err(BrokerError::Connection("gateway down".into()))
        }
    }

    #[tokio::test]
    async fn poll_refreshes_balances_and_connection_state() {
        let db = seeded_db();
        let (mut poller, bus) = poller(db.clone());
        let mut updates = bus.account_updates.subscribe();

        poller.poll_all_accounts().await;

        let account = db.accounts.get("Mock_Paper").unwrap();
        assert_eq!(account.connection, ConnectionState::Connected);
        assert!(account.last_polled_at.is_some());
        // Mock default seed: equity 0 from the account document's defaults.
        let update = updates.recv().await.unwrap();
        assert_eq!(update.account_id, "Mock_Paper");
        assert_eq!(update.broker, BrokerKind::Mock);
    }

    #[tokio::test]
    async fn failing_broker_marks_account_error() {
        let db = seeded_db();
        let (mut poller, _bus) = poller(db.clone());
        poller.install_broker("Mock_Paper", Arc::new(DeadBroker));

        poller.poll_all_accounts().await;

        let account = db.accounts.get("Mock_Paper").unwrap();
        assert_eq!(account.connection, ConnectionState::Error);
    }

    #[tokio::test]
    async fn inactive_accounts_are_skipped() {
        let db = seeded_db();
        db.accounts.update("Mock_Paper", |a| {
            a.status = AccountStatus::Inactive;
        });
        let (mut poller, _bus) = poller(db.clone());

        poller.poll_all_accounts().await;

        let account = db.accounts.get("Mock_Paper").unwrap();
        assert_eq!(account.connection, ConnectionState::Disconnected);
        assert!(account.last_polled_at.is_none());
    }
}
