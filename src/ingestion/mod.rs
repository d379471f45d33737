// =============================================================================
// Ingestion service — durable-store tail with catch-up and standardization
// =============================================================================
//
// Two phases, mirroring the store's delivery contract:
//
//   PHASE 1 (catch-up): scan rows with signal_processed != true for this
//   environment, oldest first, and push each through the standardizer.
//
//   PHASE 2 (live tail): subscribe to the store's change stream from the
//   last observed resume token. Dropped/lagged streams re-run catch-up and
//   resubscribe with exponential backoff; after the configured number of
//   attempts the service gives up and the process supervisor restarts it.
//
// Marking the source row processed is best-effort and happens after the
// publish — a duplicate publish is acceptable because Cerebro deduplicates
// by signal_id.
// =============================================================================

pub mod standardizer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::journal;
use crate::store::Database;
use crate::types::{Environment, RawSignalRow};

pub struct IngestionService {
    db: Arc<Database>,
    bus: Bus,
    environment: Environment,
    max_retries: u32,
    base_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl IngestionService {
    pub fn new(
        db: Arc<Database>,
        bus: Bus,
        environment: Environment,
        max_retries: u32,
        base_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            bus,
            environment,
            max_retries,
            base_delay,
            shutdown,
        }
    }

    /// Run until shutdown. Returns an error when the change stream cannot be
    /// re-established within the retry budget (fatal; supervisor restarts).
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();

        info!(environment = %self.environment, "ingestion: catch-up phase");
        self.catch_up().await;

        info!("ingestion: real-time phase (change stream)");
        let mut retry_count: u32 = 0;

        loop {
            let mut stream = self.db.raw_signals.subscribe();
            let resume_token = self.db.raw_signals.current_token();
            debug!(resume_token, "change stream opened");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("ingestion: shutdown signal received");
                            return Ok(());
                        }
                    }
                    event = stream.recv() => match event {
                        Ok(event) => {
                            retry_count = 0;
                            self.handle_row(event.row, false).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            // Overflowed the stream buffer; the skipped rows
                            // are still flagged unprocessed in the store.
                            warn!(missed, "change stream lagged — re-running catch-up");
                            break;
                        }
                        Err(RecvError::Closed) => {
                            info!("change stream closed — store shut down");
                            return Ok(());
                        }
                    }
                }
            }

            retry_count += 1;
            if retry_count >= self.max_retries {
                error!(
                    attempts = retry_count,
                    "failed to hold a stable change stream — giving up"
                );
                bail!("change stream failed after {retry_count} attempts");
            }
            let delay = self.base_delay * 2u32.saturating_pow(retry_count);
            warn!(
                attempt = retry_count,
                max = self.max_retries,
                delay_secs = delay.as_secs(),
                "retrying change stream after backoff"
            );
            tokio::time::sleep(delay).await;
            self.catch_up().await;
        }
    }

    /// PHASE 1: deliver every unprocessed row for this environment, oldest
    /// first.
    async fn catch_up(&self) {
        let pending = self.db.raw_signals.unprocessed(self.environment);
        if pending.is_empty() {
            info!("catch-up: no missed signals");
            return;
        }

        info!(count = pending.len(), "catch-up: found missed signals");
        for row in pending {
            self.handle_row(row, true).await;
        }
        info!("catch-up complete");
    }

    /// Standardize, publish, then best-effort mark the source row processed.
    async fn handle_row(&self, row: RawSignalRow, is_catchup: bool) {
        // Rows for other environments are ignored (catch-up pre-filters;
        // the live stream delivers everything).
        if row.environment != self.environment {
            return;
        }

        let signal = standardizer::standardize(&row);
        journal::record(
            &signal.signal_id,
            if is_catchup { "RECEIVED_CATCHUP" } else { "RECEIVED" },
            &format!(
                "strategy={} instrument={} row={}",
                signal.strategy_id, signal.instrument, row.row_id
            ),
        );

        debug!(
            signal_id = %signal.signal_id,
            instrument = %signal.instrument,
            is_catchup,
            "standardized signal"
        );

        match self.bus.standardized_signals.publish(signal.clone()).await {
            Ok(()) => {
                journal::record(&signal.signal_id, "STANDARDIZED", "published downstream");
                // Best-effort watermark; never blocks publication.
                if !self.db.raw_signals.mark_processed(&row.row_id) {
                    debug!(row_id = %row.row_id, "could not mark source row processed");
                }
            }
            Err(e) => {
                // The row stays unprocessed and the next catch-up retries it.
                warn!(
                    signal_id = %signal.signal_id,
                    error = %e,
                    "failed to publish standardized signal — leaving row unprocessed"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use chrono::Utc;

    fn raw_row(id: &str, env: Environment) -> RawSignalRow {
        RawSignalRow {
            row_id: id.to_string(),
            signal_id: None,
            source_signal_id: Some(format!("SRC_{id}_001")),
            strategy_name: "SPY_Trend".into(),
            timestamp: None,
            received_at: Utc::now(),
            signal_sent_epoch: None,
            environment: env,
            signal: serde_json::json!({"ticker": "SPY", "price": 450.0}),
            signal_processed: false,
        }
    }

    fn service(
        db: Arc<Database>,
        bus: Bus,
    ) -> (IngestionService, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let svc = IngestionService::new(
            db,
            bus,
            Environment::Staging,
            5,
            Duration::from_millis(10),
            rx,
        );
        (svc, tx)
    }

    #[tokio::test]
    async fn catch_up_publishes_and_marks_processed() {
        let db = Arc::new(Database::new(16));
        let (bus, mut receivers) = Bus::new(16, Duration::from_millis(10));

        db.raw_signals.insert(raw_row("a", Environment::Staging));
        db.raw_signals.insert(raw_row("b", Environment::Production));

        let (svc, _tx) = service(db.clone(), bus);
        svc.catch_up().await;

        // Only the staging row is delivered.
        let delivery = receivers.standardized_signals.recv().await.unwrap();
        assert_eq!(delivery.payload.instrument, "SPY");
        delivery.ack();

        assert!(db.raw_signals.get("a").unwrap().signal_processed);
        assert!(!db.raw_signals.get("b").unwrap().signal_processed);
    }

    #[tokio::test]
    async fn live_tail_delivers_new_rows_until_shutdown() {
        let db = Arc::new(Database::new(16));
        let (bus, mut receivers) = Bus::new(16, Duration::from_millis(10));

        let (svc, shutdown_tx) = service(db.clone(), bus);
        let handle = tokio::spawn(svc.run());

        // Give the service a moment to subscribe, then insert a row.
        tokio::time::sleep(Duration::from_millis(20)).await;
        db.raw_signals.insert(raw_row("live1", Environment::Staging));
        db.raw_signals.insert(raw_row("other-env", Environment::Production));

        let delivery = receivers.standardized_signals.recv().await.unwrap();
        assert!(delivery.payload.signal_id.starts_with("SPY_Trend_"));
        delivery.ack();

        // The production row must not arrive; shut down and confirm the
        // service exits cleanly.
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("service did not stop")
            .unwrap();
        assert!(result.is_ok());

        assert!(db.raw_signals.get("live1").unwrap().signal_processed);
        assert!(!db.raw_signals.get("other-env").unwrap().signal_processed);
    }
}
