// =============================================================================
// Runtime Configuration — environment, service toggles, pipeline tuning
// =============================================================================
//
// Central configuration hub for the Meridian trade router. Settings are
// loaded from a JSON file, then layered with MERIDIAN_* environment-variable
// overrides so every long-running service can be pointed at an environment
// (staging/production), forced into mock-broker mode, or allowed to trade
// live without editing the file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Environment;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_margin_limit_pct() -> f64 {
    80.0
}

fn default_account_poll_interval_secs() -> u64 {
    300
}

fn default_account_update_interval_secs() -> u64 {
    30
}

fn default_bind_addr() -> String {
    "0.0.0.0:8085".to_string()
}

fn default_margin_preview_url() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_bootstrap_path() -> String {
    "data/bootstrap.json".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_topic_capacity() -> usize {
    256
}

fn default_redelivery_delay_secs() -> u64 {
    5
}

fn default_dedup_ttl_hours() -> i64 {
    24
}

fn default_precision_cache_ttl_hours() -> i64 {
    24
}

fn default_position_lookup_retries() -> u32 {
    3
}

fn default_position_lookup_delay_ms() -> u64 {
    500
}

fn default_stream_max_retries() -> u32 {
    5
}

fn default_stream_base_delay_secs() -> u64 {
    2
}

// =============================================================================
// ServiceToggles
// =============================================================================

/// Which pipeline services this process runs. All enabled by default; a
/// deployment that wants one service per process disables the others via
/// `MERIDIAN_SERVICES`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToggles {
    #[serde(default = "default_true")]
    pub ingestion: bool,
    #[serde(default = "default_true")]
    pub cerebro: bool,
    #[serde(default = "default_true")]
    pub execution: bool,
    #[serde(default = "default_true")]
    pub account_poller: bool,
    #[serde(default = "default_true")]
    pub api: bool,
}

impl Default for ServiceToggles {
    fn default() -> Self {
        Self {
            ingestion: true,
            cerebro: true,
            execution: true,
            account_poller: true,
            api: true,
        }
    }
}

impl ServiceToggles {
    /// Parse a comma-separated service list, e.g. "ingestion,cerebro".
    fn from_list(list: &str) -> Self {
        let mut toggles = Self {
            ingestion: false,
            cerebro: false,
            execution: false,
            account_poller: false,
            api: false,
        };
        for name in list.split(',').map(|s| s.trim().to_ascii_lowercase()) {
            match name.as_str() {
                "ingestion" => toggles.ingestion = true,
                "cerebro" => toggles.cerebro = true,
                "execution" => toggles.execution = true,
                "account_poller" | "poller" => toggles.account_poller = true,
                "api" => toggles.api = true,
                "" => {}
                other => warn!(service = %other, "unknown service name in MERIDIAN_SERVICES — ignored"),
            }
        }
        toggles
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian trade router.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Which deployment environment's signal rows this pipeline consumes.
    #[serde(default)]
    pub environment: Environment,

    /// SAFETY GATE: orders only reach real brokers when true. Defaults to
    /// false; must be enabled explicitly per deployment.
    #[serde(default)]
    pub live_trading: bool,

    /// Route every account through the Mock broker regardless of its
    /// configured broker kind.
    #[serde(default = "default_true")]
    pub mock_brokers: bool,

    /// Services hosted by this process.
    #[serde(default)]
    pub services: ServiceToggles,

    // --- Risk limits ---------------------------------------------------------

    /// Hard margin limit: an order is shrunk or rejected when
    /// `margin_used + required > equity * margin_limit_pct / 100`.
    #[serde(default = "default_margin_limit_pct")]
    pub margin_limit_pct: f64,

    // --- Intervals -----------------------------------------------------------

    /// Account poller interval (seconds).
    #[serde(default = "default_account_poll_interval_secs")]
    pub account_poll_interval_secs: u64,

    /// Periodic account-update publication interval (seconds).
    #[serde(default = "default_account_update_interval_secs")]
    pub account_update_interval_secs: u64,

    // --- Endpoints & paths ---------------------------------------------------

    /// Ops API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the margin-preview service (futures/options margin).
    #[serde(default = "default_margin_preview_url")]
    pub margin_preview_url: String,

    /// Bootstrap file seeding accounts, strategies, funds, and allocations.
    #[serde(default = "default_bootstrap_path")]
    pub bootstrap_path: String,

    /// Directory for the signal journal and other log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    // --- Pipeline tuning -----------------------------------------------------

    /// Bounded capacity of each in-process topic queue.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Delay before a nacked message is redelivered (seconds).
    #[serde(default = "default_redelivery_delay_secs")]
    pub redelivery_delay_secs: u64,

    /// TTL of the execution dispatcher's in-memory signal dedup set (hours).
    #[serde(default = "default_dedup_ttl_hours")]
    pub dedup_ttl_hours: i64,

    /// TTL of the broker quantity-precision cache (hours).
    #[serde(default = "default_precision_cache_ttl_hours")]
    pub precision_cache_ttl_hours: i64,

    /// Position-lookup retries tolerating the create race (count / delay).
    #[serde(default = "default_position_lookup_retries")]
    pub position_lookup_retries: u32,
    #[serde(default = "default_position_lookup_delay_ms")]
    pub position_lookup_delay_ms: u64,

    /// Change-stream reconnect policy: exponential backoff with this base
    /// delay, giving up after this many attempts per session.
    #[serde(default = "default_stream_max_retries")]
    pub stream_max_retries: u32,
    #[serde(default = "default_stream_base_delay_secs")]
    pub stream_base_delay_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Staging,
            live_trading: false,
            mock_brokers: true,
            services: ServiceToggles::default(),
            margin_limit_pct: default_margin_limit_pct(),
            account_poll_interval_secs: default_account_poll_interval_secs(),
            account_update_interval_secs: default_account_update_interval_secs(),
            bind_addr: default_bind_addr(),
            margin_preview_url: default_margin_preview_url(),
            bootstrap_path: default_bootstrap_path(),
            log_dir: default_log_dir(),
            topic_capacity: default_topic_capacity(),
            redelivery_delay_secs: default_redelivery_delay_secs(),
            dedup_ttl_hours: default_dedup_ttl_hours(),
            precision_cache_ttl_hours: default_precision_cache_ttl_hours(),
            position_lookup_retries: default_position_lookup_retries(),
            position_lookup_delay_ms: default_position_lookup_delay_ms(),
            stream_max_retries: default_stream_max_retries(),
            stream_base_delay_secs: default_stream_base_delay_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            environment = %config.environment,
            live_trading = config.live_trading,
            mock_brokers = config.mock_brokers,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Layer MERIDIAN_* environment variables over the loaded config.
    ///
    /// Recognised: MERIDIAN_ENVIRONMENT, MERIDIAN_LIVE_TRADING,
    /// MERIDIAN_MOCK_BROKERS, MERIDIAN_SERVICES, MERIDIAN_BIND_ADDR,
    /// MERIDIAN_BOOTSTRAP, MERIDIAN_MARGIN_PREVIEW_URL.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("MERIDIAN_ENVIRONMENT") {
            match env.parse::<Environment>() {
                Ok(parsed) => self.environment = parsed,
                Err(e) => warn!(error = %e, "invalid MERIDIAN_ENVIRONMENT — keeping configured value"),
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_LIVE_TRADING") {
            self.live_trading = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("MERIDIAN_MOCK_BROKERS") {
            self.mock_brokers = parse_bool(&v);
        }
        if let Ok(list) = std::env::var("MERIDIAN_SERVICES") {
            self.services = ServiceToggles::from_list(&list);
        }
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("MERIDIAN_BOOTSTRAP") {
            self.bootstrap_path = path;
        }
        if let Ok(url) = std::env::var("MERIDIAN_MARGIN_PREVIEW_URL") {
            self.margin_preview_url = url;
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_safe() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.environment, Environment::Staging);
        assert!(!cfg.live_trading);
        assert!(cfg.mock_brokers);
        assert!(cfg.services.ingestion);
        assert!(cfg.services.execution);
        assert!((cfg.margin_limit_pct - 80.0).abs() < f64::EPSILON);
        assert_eq!(cfg.dedup_ttl_hours, 24);
        assert_eq!(cfg.precision_cache_ttl_hours, 24);
        assert_eq!(cfg.stream_max_retries, 5);
        assert_eq!(cfg.stream_base_delay_secs, 2);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.environment, Environment::Staging);
        assert!(!cfg.live_trading);
        assert_eq!(cfg.position_lookup_retries, 3);
        assert_eq!(cfg.position_lookup_delay_ms, 500);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "environment": "production", "live_trading": true }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.environment, Environment::Production);
        assert!(cfg.live_trading);
        assert!(cfg.mock_brokers);
        assert_eq!(cfg.account_poll_interval_secs, 300);
    }

    #[test]
    fn service_list_parsing() {
        let toggles = ServiceToggles::from_list("ingestion, cerebro");
        assert!(toggles.ingestion);
        assert!(toggles.cerebro);
        assert!(!toggles.execution);
        assert!(!toggles.account_poller);
        assert!(!toggles.api);

        let toggles = ServiceToggles::from_list("execution,poller,api");
        assert!(toggles.execution);
        assert!(toggles.account_poller);
        assert!(toggles.api);
        assert!(!toggles.ingestion);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.environment, cfg2.environment);
        assert_eq!(cfg.topic_capacity, cfg2.topic_capacity);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
    }

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool(" YES "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("off"));
    }
}
