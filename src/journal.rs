// =============================================================================
// Signal journal — human-facing log of the complete signal journey
// =============================================================================
//
// Every major lifecycle step of a signal (received, standardized, decided,
// order submitted, filled, position mutated, rejected) is recorded as one
// line in logs/signal_journal.log, so an operator can reconstruct a signal's
// path without grepping service logs. The journal is a target-filtered
// tracing layer writing through a non-blocking appender; journal lines are
// kept out of the stdout stream.
// =============================================================================

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target routing lifecycle lines into the journal file.
pub const TARGET: &str = "signal_journal";

/// Install the global tracing subscriber: a stdout layer honouring
/// `RUST_LOG` (journal lines excluded) plus the journal file layer.
///
/// The returned guard must be held for the life of the process — dropping it
/// stops the background writer and loses buffered journal lines.
pub fn init(log_dir: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory '{log_dir}'"))?;

    let appender = tracing_appender::rolling::never(log_dir, "signal_journal.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("{TARGET}=off").parse().expect("static directive"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter);

    let journal_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() == TARGET));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(journal_layer)
        .init();

    Ok(guard)
}

/// Record one lifecycle step for a signal.
pub fn record(signal_id: &str, stage: &str, detail: &str) {
    tracing::info!(target: "signal_journal", signal_id, stage, detail);
}
