// =============================================================================
// Signal standardizer — raw store rows to the canonical schema
// =============================================================================
//
// Applied exactly once per source row. Everything downstream (Cerebro,
// Execution, the decision audit) consumes only the canonical form, so this
// is the single place that knows about the wire quirks of strategy payloads:
// object-or-array `signal` bodies, `ticker` vs `instrument`, BUY_CALL-style
// sides, and string-encoded numbers.
//
// Canonicalization is stable: the generated signal_id derives from the row's
// own timestamps, so re-standardizing the same row yields the same id.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::types::{
    Direction, InstrumentType, OptionLeg, OrderSide, OrderType, RawSignalRow, Signal, SignalAction,
};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Rewrite a raw store row into the canonical signal.
pub fn standardize(row: &RawSignalRow) -> Signal {
    let payload = payload_of(row);
    let timestamp = resolve_timestamp(row);
    let signal_id = generate_signal_id(row, timestamp);

    Signal {
        signal_id,
        strategy_id: row.strategy_name.clone(),
        timestamp,
        instrument: str_field(payload, "instrument")
            .or_else(|| str_field(payload, "ticker"))
            .unwrap_or_default(),
        instrument_type: str_field(payload, "instrument_type")
            .and_then(|s| parse_instrument_type(&s))
            .unwrap_or_default(),
        direction: str_field(payload, "direction")
            .and_then(|s| parse_direction(&s))
            .unwrap_or_default(),
        // Raw rows carry the explicit action as `signal_type` and the BUY/SELL
        // side as `action`; canonical payloads use `action` and `side`. Accept
        // both so canonicalization is idempotent.
        action: str_field(payload, "signal_type")
            .and_then(|s| parse_action(&s))
            .or_else(|| str_field(payload, "action").and_then(|s| parse_action(&s))),
        side: str_field(payload, "action")
            .and_then(|s| parse_side(&s))
            .or_else(|| str_field(payload, "side").and_then(|s| parse_side(&s))),
        order_type: str_field(payload, "order_type")
            .and_then(|s| parse_order_type(&s))
            .unwrap_or_default(),
        price: num_field(payload, "price"),
        stop_loss: num_field(payload, "stop_loss"),
        take_profit: num_field(payload, "take_profit"),
        quantity: match payload.get("quantity") {
            Some(v) => value_to_f64(v).unwrap_or(1.0),
            None => 1.0,
        },
        expiry: str_field(payload, "expiry"),
        exchange: str_field(payload, "exchange"),
        legs: parse_legs(payload),
    }
}

// ---------------------------------------------------------------------------
// Payload resolution
// ---------------------------------------------------------------------------

/// The nested `signal` body may be an object or a single-element array; in
/// the array form the first leg carries the instrument and action.
fn payload_of(row: &RawSignalRow) -> &Value {
    match &row.signal {
        Value::Array(legs) => legs.first().unwrap_or(&Value::Null),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Signal id
// ---------------------------------------------------------------------------

/// `{strategy}_{YYYYMMDD}_{HHMMSS}_{seq}` — derived from the row's own
/// reference time so the same source row always maps to the same id. `seq`
/// is the last 3 digits of the source signalID when numeric, else the
/// reference time's milliseconds.
pub fn generate_signal_id(row: &RawSignalRow, reference: DateTime<Utc>) -> String {
    let strategy = row.strategy_name.replace([' ', '-'], "_");
    let date_str = reference.format("%Y%m%d");
    let time_str = reference.format("%H%M%S");

    let source_id = row
        .source_signal_id
        .as_deref()
        .or(row.signal_id.as_deref());

    let seq = match source_id.and_then(|id| id.rsplit('_').next()) {
        Some(last) if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) => {
            // Exactly 3 digits: left-pad short sequences, truncate long ones.
            let padded = format!("{last:0>3}");
            padded[..3].to_string()
        }
        _ => format!("{:03}", reference.timestamp_subsec_millis()),
    };

    format!("{strategy}_{date_str}_{time_str}_{seq}")
}

/// Timestamp priority chain: `timestamp` → `received_at` → epoch → now.
pub fn resolve_timestamp(row: &RawSignalRow) -> DateTime<Utc> {
    if let Some(raw) = &row.timestamp {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return parsed.with_timezone(&Utc);
        }
    }
    // received_at is mandatory on store rows, so the epoch/now fallbacks only
    // matter for hand-built test rows.
    if row.received_at.timestamp() > 0 {
        return row.received_at;
    }
    if let Some(epoch) = row.signal_sent_epoch {
        if let Some(ts) = Utc.timestamp_opt(epoch, 0).single() {
            return ts;
        }
    }
    Utc::now()
}

// ---------------------------------------------------------------------------
// Field parsers
// ---------------------------------------------------------------------------

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Numeric field that tolerates string encoding; absent or malformed -> 0.
fn num_field(payload: &Value, key: &str) -> f64 {
    payload
        .get(key)
        .and_then(value_to_f64)
        .unwrap_or(0.0)
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_direction(s: &str) -> Option<Direction> {
    match s.to_ascii_uppercase().as_str() {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        _ => None,
    }
}

fn parse_action(s: &str) -> Option<SignalAction> {
    match s.to_ascii_uppercase().as_str() {
        "ENTRY" => Some(SignalAction::Entry),
        "EXIT" => Some(SignalAction::Exit),
        "SCALE_IN" => Some(SignalAction::ScaleIn),
        "SCALE_OUT" => Some(SignalAction::ScaleOut),
        _ => None,
    }
}

/// BUY/SELL plus the option spellings (BUY_CALL, SELL_PUT, SELL_ALL, ...).
fn parse_side(s: &str) -> Option<OrderSide> {
    let upper = s.to_ascii_uppercase();
    if upper.starts_with("BUY") {
        Some(OrderSide::Buy)
    } else if upper.starts_with("SELL") {
        Some(OrderSide::Sell)
    } else {
        None
    }
}

fn parse_order_type(s: &str) -> Option<OrderType> {
    match s.to_ascii_uppercase().as_str() {
        "MARKET" => Some(OrderType::Market),
        "LIMIT" => Some(OrderType::Limit),
        "STOP" => Some(OrderType::Stop),
        "STOP_LIMIT" => Some(OrderType::StopLimit),
        _ => None,
    }
}

fn parse_instrument_type(s: &str) -> Option<InstrumentType> {
    match s.to_ascii_uppercase().as_str() {
        "STOCK" => Some(InstrumentType::Stock),
        "ETF" => Some(InstrumentType::Etf),
        "OPTION" | "OPTIONS" => Some(InstrumentType::Option),
        "FUTURE" | "FUTURES" => Some(InstrumentType::Future),
        "FOREX" => Some(InstrumentType::Forex),
        "CRYPTO" => Some(InstrumentType::Crypto),
        _ => None,
    }
}

fn parse_legs(payload: &Value) -> Option<Vec<OptionLeg>> {
    let legs = payload.get("legs")?.as_array()?;
    let parsed: Vec<OptionLeg> = legs
        .iter()
        .filter_map(|leg| serde_json::from_value(leg.clone()).ok())
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(signal: Value) -> RawSignalRow {
        RawSignalRow {
            row_id: "row1".into(),
            signal_id: None,
            source_signal_id: Some("SPY_20260301_104528_001".into()),
            strategy_name: "SPY_Trend".into(),
            timestamp: Some("2026-03-01T10:45:28Z".into()),
            received_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 45, 30).unwrap(),
            signal_sent_epoch: Some(1_772_000_000),
            environment: crate::types::Environment::Staging,
            signal,
            signal_processed: false,
        }
    }

    #[test]
    fn generates_expected_signal_id_format() {
        let row = row(serde_json::json!({}));
        let signal = standardize(&row);
        assert_eq!(signal.signal_id, "SPY_Trend_20260301_104528_001");
    }

    #[test]
    fn signal_id_is_stable_across_redelivery() {
        let row = row(serde_json::json!({"ticker": "SPY"}));
        let first = standardize(&row);
        let second = standardize(&row);
        assert_eq!(first.signal_id, second.signal_id);
        assert_eq!(first, second);
    }

    #[test]
    fn strategy_name_spaces_and_hyphens_become_underscores() {
        let mut r = row(serde_json::json!({}));
        r.strategy_name = "Mean Rev-V2".into();
        let signal = standardize(&r);
        assert!(signal.signal_id.starts_with("Mean_Rev_V2_"));
        // strategy_id keeps the raw name; only the id slug is rewritten.
        assert_eq!(signal.strategy_id, "Mean Rev-V2");
    }

    #[test]
    fn non_numeric_source_seq_falls_back_to_millis() {
        let mut r = row(serde_json::json!({}));
        r.source_signal_id = Some("SPY_FINAL".into());
        let signal = standardize(&r);
        // Reference timestamp has 0 ms.
        assert!(signal.signal_id.ends_with("_000"));
    }

    #[test]
    fn timestamp_priority_prefers_explicit_timestamp() {
        let r = row(serde_json::json!({}));
        let signal = standardize(&r);
        assert_eq!(
            signal.timestamp,
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 45, 28).unwrap()
        );
    }

    #[test]
    fn timestamp_falls_back_to_received_at() {
        let mut r = row(serde_json::json!({}));
        r.timestamp = None;
        let signal = standardize(&r);
        assert_eq!(signal.timestamp, r.received_at);
    }

    #[test]
    fn malformed_timestamp_falls_back_to_received_at() {
        let mut r = row(serde_json::json!({}));
        r.timestamp = Some("yesterday-ish".into());
        let signal = standardize(&r);
        assert_eq!(signal.timestamp, r.received_at);
    }

    #[test]
    fn object_payload_fields_are_extracted() {
        let r = row(serde_json::json!({
            "instrument": "AUDCAD",
            "instrument_type": "FOREX",
            "direction": "long",
            "signal_type": "ENTRY",
            "action": "BUY",
            "order_type": "LIMIT",
            "price": "0.9000",
            "stop_loss": 0.8950,
            "take_profit": 0.9100,
            "quantity": 100000
        }));
        let signal = standardize(&r);
        assert_eq!(signal.instrument, "AUDCAD");
        assert_eq!(signal.instrument_type, InstrumentType::Forex);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.action, Some(SignalAction::Entry));
        assert_eq!(signal.side, Some(OrderSide::Buy));
        assert_eq!(signal.order_type, OrderType::Limit);
        assert!((signal.price - 0.9).abs() < 1e-12);
        assert!((signal.stop_loss - 0.895).abs() < 1e-12);
        assert!((signal.quantity - 100_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn array_payload_uses_first_leg() {
        let r = row(serde_json::json!([
            {"ticker": "GC", "instrument_type": "FUTURE", "action": "SELL", "quantity": 2,
             "expiry": "20260224", "exchange": "COMEX"},
            {"ticker": "SI", "action": "BUY", "qty": 1}
        ]));
        let signal = standardize(&r);
        assert_eq!(signal.instrument, "GC");
        assert_eq!(signal.instrument_type, InstrumentType::Future);
        assert_eq!(signal.side, Some(OrderSide::Sell));
        assert_eq!(signal.expiry.as_deref(), Some("20260224"));
        assert_eq!(signal.exchange.as_deref(), Some("COMEX"));
    }

    #[test]
    fn absent_fields_get_canonical_defaults() {
        let r = row(serde_json::json!({"ticker": "SPY"}));
        let signal = standardize(&r);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.action, None);
        assert_eq!(signal.order_type, OrderType::Market);
        assert_eq!(signal.instrument_type, InstrumentType::Stock);
        assert_eq!(signal.price, 0.0);
        assert_eq!(signal.stop_loss, 0.0);
        assert_eq!(signal.take_profit, 0.0);
        assert_eq!(signal.quantity, 1.0);
    }

    #[test]
    fn option_side_spellings_map_to_buy_sell() {
        assert_eq!(parse_side("BUY_CALL"), Some(OrderSide::Buy));
        assert_eq!(parse_side("SELL_PUT"), Some(OrderSide::Sell));
        assert_eq!(parse_side("SELL_ALL"), Some(OrderSide::Sell));
        assert_eq!(parse_side("HOLD"), None);
    }

    #[test]
    fn multi_leg_payloads_preserved() {
        let r = row(serde_json::json!({
            "ticker": "SPY",
            "instrument_type": "OPTION",
            "legs": [
                {"ticker": "SPY_C450", "action": "BUY_CALL", "qty": 1, "strike": 450.0,
                 "expiry": "20260320", "option_type": "call"},
                {"ticker": "SPY_C460", "action": "SELL_CALL", "qty": 1, "strike": 460.0,
                 "expiry": "20260320", "option_type": "call"}
            ]
        }));
        let signal = standardize(&r);
        let legs = signal.legs.unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].ticker, "SPY_C450");
        assert_eq!(legs[1].strike, Some(460.0));
    }

    #[test]
    fn canonical_round_trip_is_identity() {
        // A row whose payload already carries the canonical fields must map
        // to itself: standardizing twice changes nothing.
        let r = row(serde_json::json!({
            "instrument": "SPY",
            "instrument_type": "STOCK",
            "direction": "LONG",
            "signal_type": "ENTRY",
            "action": "BUY",
            "order_type": "MARKET",
            "price": 450.0,
            "stop_loss": 0.0,
            "take_profit": 0.0,
            "quantity": 1.0
        }));
        let once = standardize(&r);

        // Re-wrap the canonical signal as a raw row (as a replay would).
        let replay = RawSignalRow {
            row_id: "row1-replay".into(),
            signal_id: None,
            source_signal_id: Some(once.signal_id.clone()),
            strategy_name: once.strategy_id.clone(),
            timestamp: Some(once.timestamp.to_rfc3339()),
            received_at: r.received_at,
            signal_sent_epoch: None,
            environment: crate::types::Environment::Staging,
            signal: serde_json::to_value(&once).unwrap(),
            signal_processed: false,
        };
        let twice = standardize(&replay);
        assert_eq!(once, twice);
    }
}
