// =============================================================================
// Precision service — broker-authoritative quantity precision with TTL cache
// =============================================================================
//
// The broker is the authoritative source for how many decimal places a
// symbol's quantity may carry. Lookups are cached per (broker, symbol) for
// 24 hours; when a broker query fails the instrument-type defaults apply
// (whole units everywhere except crypto's 8 decimals).
//
// Quantities are normalized by truncation, never rounding up: a computed
// size must not exceed the capital that produced it.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::brokers::Broker;
use crate::types::InstrumentType;

#[derive(Debug, Clone)]
struct CacheEntry {
    precision: u32,
    checked_at: DateTime<Utc>,
}

pub struct PrecisionService {
    ttl: Duration,
    /// (broker_id, symbol) -> cached precision.
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl PrecisionService {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            ttl: Duration::hours(ttl_hours),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Quantity precision for `symbol` at `broker_id`, from cache when fresh,
    /// otherwise queried from the broker. Query failures fall back to the
    /// instrument-type defaults (and are cached, so a flapping broker is not
    /// hammered).
    pub async fn precision(
        &self,
        broker: &dyn Broker,
        broker_id: &str,
        symbol: &str,
        instrument_type: InstrumentType,
    ) -> u32 {
        let key = (broker_id.to_string(), symbol.to_string());

        if let Some(entry) = self.cache.read().get(&key) {
            if Utc::now() - entry.checked_at < self.ttl {
                debug!(broker_id, symbol, precision = entry.precision, "precision cache hit");
                return entry.precision;
            }
        }

        let precision = match broker.get_quantity_precision(symbol, instrument_type).await {
            Ok(p) => {
                debug!(broker_id, symbol, precision = p, "precision queried from broker");
                p
            }
            Err(e) => {
                let fallback = Self::default_precision(instrument_type);
                warn!(
                    broker_id,
                    symbol,
                    error = %e,
                    fallback,
                    "precision query failed — using instrument-type default"
                );
                fallback
            }
        };

        self.cache.write().insert(
            key,
            CacheEntry {
                precision,
                checked_at: Utc::now(),
            },
        );
        precision
    }

    /// Instrument-type defaults used when the broker cannot answer.
    pub fn default_precision(instrument_type: InstrumentType) -> u32 {
        match instrument_type {
            InstrumentType::Crypto => 8,
            InstrumentType::Stock
            | InstrumentType::Etf
            | InstrumentType::Option
            | InstrumentType::Future
            | InstrumentType::Forex => 0,
        }
    }

    /// Truncate `quantity` to `precision` decimal places (toward zero).
    pub fn normalize_quantity(quantity: f64, precision: u32) -> f64 {
        if quantity <= 0.0 {
            return 0.0;
        }
        let factor = 10f64.powi(precision as i32);
        (quantity * factor).floor() / factor
    }

    /// Drop every cached entry (used when broker metadata is known stale).
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    #[cfg(test)]
    fn expire(&self, broker_id: &str, symbol: &str) {
        if let Some(entry) = self
            .cache
            .write()
            .get_mut(&(broker_id.to_string(), symbol.to_string()))
        {
            entry.checked_at = Utc::now() - Duration::hours(48);
        }
    }
}

impl std::fmt::Debug for PrecisionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecisionService")
            .field("entries", &self.cache.read().len())
            .finish()
    }
}
