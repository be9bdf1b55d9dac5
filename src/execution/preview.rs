// =============================================================================
// Execution preview — pure PnL projection for a candidate pair
// =============================================================================
//
// No side effects: the preview is computed from the current snapshots of the
// two legs plus fee assumptions, and is safe to call as often as the
// operator hovers a row.
//
// Model: both legs carry the same notional (that is the hedge), so capital
// required is 2 * notional / leverage. Funding flows are the settlement
// events inside the hold window applied to the notional; fees are taker
// fees on all four fills (two opens, two closes).
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::board::settlement::{build_preview, EventKind, LegSchedule};
use crate::error::{EngineError, EngineResult};
use crate::types::{Exchange, FundingSnapshot};

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub notional_usd: f64,
    pub hold_hours: f64,
    /// Taker fee per fill, in basis points.
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
}

fn default_fee_bps() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewReport {
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    /// Base-asset quantity per leg at the long leg's mark price.
    pub quantity: f64,
    /// Each leg carries this notional; capital is split across both.
    pub per_leg_notional_usd: f64,
    pub spread_rate_1y_nominal: f64,
    pub max_usable_leverage: Option<u32>,
    /// Margin needed for both legs at the usable leverage (full notional
    /// when leverage is unknown).
    pub margin_required_usd: f64,
    /// Settlement events falling inside the hold window.
    pub funding_events_in_window: usize,
    pub expected_funding_usd: f64,
    pub fees_usd: f64,
    pub projected_pnl_usd: f64,
    pub hold_hours: f64,
}

/// Project PnL for holding the pair over `hold_hours`.
pub fn build_execution_preview(
    req: &PreviewRequest,
    long: &FundingSnapshot,
    short: &FundingSnapshot,
) -> EngineResult<PreviewReport> {
    if req.notional_usd <= 0.0 {
        return Err(EngineError::validation("notional_usd must be positive"));
    }
    if req.hold_hours <= 0.0 {
        return Err(EngineError::validation("hold_hours must be positive"));
    }
    if long.mark_price <= 0.0 {
        return Err(EngineError::internal("long leg mark price is not positive"));
    }

    let quantity = req.notional_usd / long.mark_price;
    let spread_rate_1y_nominal = short.rate_1y_nominal() - long.rate_1y_nominal();
    let max_usable_leverage = match (long.max_leverage, short.max_leverage) {
        (Some(l), Some(s)) => Some(l.min(s)),
        _ => None,
    };
    let margin_required_usd = match max_usable_leverage {
        Some(lev) if lev > 0 => 2.0 * req.notional_usd / lev as f64,
        _ => 2.0 * req.notional_usd,
    };

    // Funding flows: settlement events inside the hold window applied to the
    // per-leg notional. Hedged events net the two rates; single-side events
    // are directional.
    let now = Utc::now();
    let window_end = now + chrono::Duration::seconds((req.hold_hours * 3600.0) as i64);
    let preview = build_preview(
        now,
        &LegSchedule {
            funding_rate_raw: long.funding_rate_raw,
            funding_interval_hours: long.funding_interval_hours,
            next_funding_time: long.next_funding_time,
        },
        &LegSchedule {
            funding_rate_raw: short.funding_rate_raw,
            funding_interval_hours: short.funding_interval_hours,
            next_funding_time: short.next_funding_time,
        },
    );
    let in_window: Vec<_> = preview
        .events
        .iter()
        .filter(|e| e.kind != EventKind::Unknown && e.event_time <= window_end)
        .collect();
    let expected_funding_usd: f64 = in_window
        .iter()
        .map(|e| e.amount_rate * req.notional_usd)
        .sum();

    // Four taker fills: open and close on each leg.
    let fees_usd = 4.0 * req.notional_usd * (req.fee_bps / 10_000.0);

    Ok(PreviewReport {
        symbol: req.symbol.clone(),
        long_exchange: req.long_exchange,
        short_exchange: req.short_exchange,
        quantity,
        per_leg_notional_usd: req.notional_usd,
        spread_rate_1y_nominal,
        max_usable_leverage,
        margin_required_usd,
        funding_events_in_window: in_window.len(),
        expected_funding_usd,
        fees_usd,
        projected_pnl_usd: expected_funding_usd - fees_usd,
        hold_hours: req.hold_hours,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceTag;
    use chrono::Duration;

    fn snap(exchange: Exchange, rate: f64, lev: Option<u32>, next_in_hours: i64) -> FundingSnapshot {
        FundingSnapshot {
            exchange,
            symbol: "BTCUSDT".to_string(),
            funding_rate_raw: rate,
            funding_interval_hours: 8.0,
            next_funding_time: Utc::now() + Duration::hours(next_in_hours),
            mark_price: 50_000.0,
            open_interest_usd: None,
            volume24h_usd: None,
            max_leverage: lev,
            source_tag: SourceTag::Ccxt,
            fetched_at: Utc::now(),
        }
    }

    fn request(hold_hours: f64, fee_bps: f64) -> PreviewRequest {
        PreviewRequest {
            symbol: "BTCUSDT".to_string(),
            long_exchange: Exchange::Binance,
            short_exchange: Exchange::Okx,
            notional_usd: 10_000.0,
            hold_hours,
            fee_bps,
        }
    }

    #[test]
    fn funding_and_fees_math() {
        // One hedged settlement in a 24h window: both legs settle in 4h on
        // the same 8h cadence (the preview stops at the first alignment).
        let long = snap(Exchange::Binance, -0.0001, Some(20), 4);
        let short = snap(Exchange::Okx, 0.0002, Some(10), 4);
        let report = build_execution_preview(&request(24.0, 5.0), &long, &short).unwrap();

        assert!((report.quantity - 0.2).abs() < 1e-12);
        assert_eq!(report.funding_events_in_window, 1);
        // 0.0003 net rate on 10k notional = 3 USD.
        assert!((report.expected_funding_usd - 3.0).abs() < 1e-9);
        // 4 fills * 10k * 5bps = 20 USD.
        assert!((report.fees_usd - 20.0).abs() < 1e-9);
        assert!((report.projected_pnl_usd + 17.0).abs() < 1e-9);
        assert_eq!(report.max_usable_leverage, Some(10));
        assert!((report.margin_required_usd - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn window_excludes_events_after_hold() {
        // Settlement lands in 4h; a 2h hold sees no funding at all.
        let long = snap(Exchange::Binance, -0.0001, Some(20), 4);
        let short = snap(Exchange::Okx, 0.0002, Some(10), 4);
        let report = build_execution_preview(&request(2.0, 5.0), &long, &short).unwrap();
        assert_eq!(report.funding_events_in_window, 0);
        assert_eq!(report.expected_funding_usd, 0.0);
        assert!(report.projected_pnl_usd < 0.0);
    }

    #[test]
    fn unknown_leverage_means_full_margin() {
        let long = snap(Exchange::Binance, -0.0001, None, 4);
        let short = snap(Exchange::Okx, 0.0002, Some(10), 4);
        let report = build_execution_preview(&request(24.0, 5.0), &long, &short).unwrap();
        assert!(report.max_usable_leverage.is_none());
        assert!((report.margin_required_usd - 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_inputs_are_validation_errors() {
        let long = snap(Exchange::Binance, -0.0001, None, 4);
        let short = snap(Exchange::Okx, 0.0002, None, 4);

        let mut bad = request(24.0, 5.0);
        bad.notional_usd = 0.0;
        assert!(build_execution_preview(&bad, &long, &short).is_err());

        let mut bad = request(24.0, 5.0);
        bad.hold_hours = -1.0;
        assert!(build_execution_preview(&bad, &long, &short).is_err());
    }
}
