// =============================================================================
// Margin calculator — instrument-typed rules + broker-backed preview
// =============================================================================
//
// Equities, forex, and crypto use fixed initial-margin rates. Futures and
// options margin must come from the broker itself: the calculator calls the
// margin-preview service (which fronts the broker's what-if endpoint) with a
// 35 second timeout and fails the calculation on any error — there is no
// silent fallback for those instruments. In mock mode futures fall back to a
// 10% estimate so paper pipelines can run without a gateway.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{InstrumentType, Signal};

/// Reg T initial margin for stocks and ETFs.
const STOCK_MARGIN_RATE: f64 = 0.25;
/// 50:1 leverage.
const FOREX_MARGIN_RATE: f64 = 0.02;
/// Conservative 2:1 leverage.
const CRYPTO_MARGIN_RATE: f64 = 0.50;
/// Estimate used for futures in mock mode only.
const FUTURES_MOCK_MARGIN_RATE: f64 = 0.10;

/// Margin-preview HTTP timeout. What-if checks against a live gateway can
/// take tens of seconds.
const PREVIEW_TIMEOUT_SECS: u64 = 35;

// ---------------------------------------------------------------------------
// Results & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MarginRequirement {
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    /// 0 for broker-quoted margin (not percentage-based).
    pub margin_pct: f64,
    pub method: String,
    pub commission: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum MarginError {
    #[error("futures margin requires an expiry field")]
    MissingExpiry,

    #[error("futures margin requires an exchange field")]
    MissingExchange,

    #[error("options margin must come from the broker preview — no estimate exists")]
    OptionsPreviewUnavailable,

    #[error("margin preview failed: {0}")]
    Preview(String),
}

// ---------------------------------------------------------------------------
// Margin-preview client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PreviewRequest<'a> {
    instrument: &'a str,
    direction: String,
    quantity: f64,
    order_type: String,
    instrument_type: String,
    expiry: &'a str,
    exchange: &'a str,
}

#[derive(Debug, Deserialize)]
struct PreviewResponse {
    margin_impact: MarginImpact,
}

#[derive(Debug, Deserialize)]
struct MarginImpact {
    #[serde(default)]
    init_margin_change: f64,
    #[serde(default)]
    maint_margin_change: f64,
    #[serde(default)]
    commission: f64,
}

/// Client for the external margin-preview service
/// (`POST /api/v1/account/{id}/margin-preview`).
pub struct MarginPreviewClient {
    base_url: String,
    client: reqwest::Client,
}

impl MarginPreviewClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PREVIEW_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn preview(
        &self,
        account_id: &str,
        request: &PreviewRequest<'_>,
    ) -> Result<MarginImpact, MarginError> {
        let url = format!(
            "{}/api/v1/account/{}/margin-preview",
            self.base_url, account_id
        );

        debug!(
            instrument = request.instrument,
            quantity = request.quantity,
            account_id,
            "requesting margin preview"
        );

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarginError::Preview("timeout waiting for margin preview".into())
                } else {
                    MarginError::Preview(format!("margin-preview service unreachable: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .text()
                .await
                .unwrap_or_else(|_| "no error detail".into());
            return Err(MarginError::Preview(format!(
                "margin-preview returned {status}: {detail}"
            )));
        }

        let parsed: PreviewResponse = resp
            .json()
            .await
            .map_err(|e| MarginError::Preview(format!("malformed preview response: {e}")))?;
        Ok(parsed.margin_impact)
    }
}

impl std::fmt::Debug for MarginPreviewClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarginPreviewClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

pub struct MarginCalculator {
    preview: MarginPreviewClient,
    mock_mode: bool,
}

impl MarginCalculator {
    pub fn new(preview_base_url: impl Into<String>, mock_mode: bool) -> Self {
        Self {
            preview: MarginPreviewClient::new(preview_base_url),
            mock_mode,
        }
    }

    /// Margin requirement for trading `quantity` of the signal's instrument
    /// at the signal price.
    pub async fn requirement(
        &self,
        account_id: &str,
        signal: &Signal,
        quantity: f64,
    ) -> Result<MarginRequirement, MarginError> {
        let notional = quantity * signal.price;

        match signal.instrument_type {
            InstrumentType::Stock | InstrumentType::Etf => {
                Ok(Self::rate_based(notional, STOCK_MARGIN_RATE, "Reg T margin (25%)"))
            }
            InstrumentType::Forex => Ok(Self::rate_based(
                notional,
                FOREX_MARGIN_RATE,
                "forex margin (50:1 leverage)",
            )),
            InstrumentType::Crypto => Ok(Self::rate_based(
                notional,
                CRYPTO_MARGIN_RATE,
                "crypto margin (2:1 leverage)",
            )),
            InstrumentType::Future => self.futures(account_id, signal, quantity, notional).await,
            InstrumentType::Option => self.options(account_id, signal, quantity).await,
        }
    }

    fn rate_based(notional: f64, rate: f64, method: &str) -> MarginRequirement {
        let margin = notional * rate;
        MarginRequirement {
            initial_margin: margin,
            maintenance_margin: margin,
            margin_pct: rate * 100.0,
            method: method.to_string(),
            commission: 0.0,
        }
    }

    async fn futures(
        &self,
        account_id: &str,
        signal: &Signal,
        quantity: f64,
        notional: f64,
    ) -> Result<MarginRequirement, MarginError> {
        if self.mock_mode {
            let margin = notional * FUTURES_MOCK_MARGIN_RATE;
            info!(
                instrument = %signal.instrument,
                margin,
                "mock mode: estimated futures margin"
            );
            return Ok(MarginRequirement {
                initial_margin: margin,
                maintenance_margin: margin * 0.75,
                margin_pct: FUTURES_MOCK_MARGIN_RATE * 100.0,
                method: "futures estimate (mock mode, 10%)".to_string(),
                commission: 0.0,
            });
        }

        let expiry = signal.expiry.as_deref().ok_or(MarginError::MissingExpiry)?;
        let exchange = signal
            .exchange
            .as_deref()
            .ok_or(MarginError::MissingExchange)?;

        let impact = self
            .preview
            .preview(
                account_id,
                &PreviewRequest {
                    instrument: &signal.instrument,
                    direction: signal.direction.to_string(),
                    quantity,
                    order_type: signal.order_type.to_string(),
                    instrument_type: signal.instrument_type.to_string(),
                    expiry,
                    exchange,
                },
            )
            .await?;

        info!(
            instrument = %signal.instrument,
            initial_margin = impact.init_margin_change,
            maintenance_margin = impact.maint_margin_change,
            "futures margin from broker preview"
        );

        Ok(MarginRequirement {
            initial_margin: impact.init_margin_change,
            maintenance_margin: impact.maint_margin_change,
            margin_pct: 0.0,
            method: "broker what-if preview".to_string(),
            commission: impact.commission,
        })
    }

    async fn options(
        &self,
        account_id: &str,
        signal: &Signal,
        quantity: f64,
    ) -> Result<MarginRequirement, MarginError> {
        // Options margin is strategy-dependent; an estimate is never safe.
        if self.mock_mode {
            return Err(MarginError::OptionsPreviewUnavailable);
        }

        let expiry = signal
            .expiry
            .as_deref()
            .ok_or(MarginError::OptionsPreviewUnavailable)?;
        let exchange = signal.exchange.as_deref().unwrap_or("SMART");

        let impact = self
            .preview
            .preview(
                account_id,
                &PreviewRequest {
                    instrument: &signal.instrument,
                    direction: signal.direction.to_string(),
                    quantity,
                    order_type: signal.order_type.to_string(),
                    instrument_type: signal.instrument_type.to_string(),
                    expiry,
                    exchange,
                },
            )
            .await?;

        Ok(MarginRequirement {
            initial_margin: impact.init_margin_change,
            maintenance_margin: impact.maint_margin_change,
            margin_pct: 0.0,
            method: "broker what-if preview".to_string(),
            commission: impact.commission,
        })
    }
}

impl std::fmt::Debug for MarginCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarginCalculator")
            .field("preview", &self.preview)
            .field("mock_mode", &self.mock_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OrderType, SignalAction};
    use chrono::Utc;

    fn signal(instrument_type: InstrumentType, price: f64) -> Signal {
        Signal {
            signal_id: "sig".into(),
            strategy_id: "strat".into(),
            timestamp: Utc::now(),
            instrument: "TEST".into(),
            instrument_type,
            direction: Direction::Long,
            action: Some(SignalAction::Entry),
            side: None,
            order_type: OrderType::Market,
            price,
            stop_loss: 0.0,
            take_profit: 0.0,
            quantity: 1.0,
            expiry: None,
            exchange: None,
            legs: None,
        }
    }

    fn calculator(mock_mode: bool) -> MarginCalculator {
        MarginCalculator::new("http://127.0.0.1:1", mock_mode)
    }

    #[tokio::test]
    async fn stock_margin_is_reg_t_25_pct() {
        let calc = calculator(true);
        let req = calc
            .requirement("acct", &signal(InstrumentType::Stock, 450.0), 222.0)
            .await
            .unwrap();
        assert!((req.initial_margin - 222.0 * 450.0 * 0.25).abs() < 1e-6);
        assert!((req.margin_pct - 25.0).abs() < f64::EPSILON);
        assert_eq!(req.initial_margin, req.maintenance_margin);
    }

    #[tokio::test]
    async fn forex_margin_is_2_pct_of_notional() {
        // 100,000 units of AUDCAD at 0.9000: notional 90,000 -> margin 1,800.
        let calc = calculator(true);
        let req = calc
            .requirement("acct", &signal(InstrumentType::Forex, 0.9), 100_000.0)
            .await
            .unwrap();
        assert!((req.initial_margin - 1_800.0).abs() < 1e-9);
        assert!((req.margin_pct - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn crypto_margin_is_50_pct() {
        let calc = calculator(true);
        let req = calc
            .requirement("acct", &signal(InstrumentType::Crypto, 40_000.0), 0.5)
            .await
            .unwrap();
        assert!((req.initial_margin - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn futures_mock_mode_estimates_10_pct() {
        let calc = calculator(true);
        let mut sig = signal(InstrumentType::Future, 2_000.0);
        sig.expiry = Some("20260224".into());
        sig.exchange = Some("COMEX".into());

        let req = calc.requirement("acct", &sig, 2.0).await.unwrap();
        assert!((req.initial_margin - 400.0).abs() < 1e-9);
        assert!((req.maintenance_margin - 300.0).abs() < 1e-9);
        assert!(req.method.contains("mock"));
    }

    #[tokio::test]
    async fn futures_live_requires_expiry_and_exchange() {
        let calc = calculator(false);

        let sig = signal(InstrumentType::Future, 2_000.0);
        assert!(matches!(
            calc.requirement("acct", &sig, 1.0).await,
            Err(MarginError::MissingExpiry)
        ));

        let mut sig = signal(InstrumentType::Future, 2_000.0);
        sig.expiry = Some("20260224".into());
        assert!(matches!(
            calc.requirement("acct", &sig, 1.0).await,
            Err(MarginError::MissingExchange)
        ));
    }

    #[tokio::test]
    async fn futures_live_fails_when_preview_unreachable() {
        // Port 1 is never listening; the preview call must fail loudly, not
        // fall back to an estimate.
        let calc = calculator(false);
        let mut sig = signal(InstrumentType::Future, 2_000.0);
        sig.expiry = Some("20260224".into());
        sig.exchange = Some("COMEX".into());

        assert!(matches!(
            calc.requirement("acct", &sig, 1.0).await,
            Err(MarginError::Preview(_))
        ));
    }

    #[tokio::test]
    async fn options_never_estimated_in_mock_mode() {
        let calc = calculator(true);
        assert!(matches!(
            calc.requirement("acct", &signal(InstrumentType::Option, 5.0), 1.0)
                .await,
            Err(MarginError::OptionsPreviewUnavailable)
        ));
    }
}
