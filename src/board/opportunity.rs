// =============================================================================
// OpportunityEngine — cross-venue pairing, scoring, filtering, ranking
// =============================================================================
//
// For every symbol listed on at least two venues, each unordered venue pair
// produces one row: the leg with the higher annualised rate is shorted, the
// other is longed, so the spread (short minus long) is never negative.
// Orientation uses the annualised rate rather than the raw per-interval rate
// so that a 1h venue never ends up shorted against a slower venue purely on
// raw-rate magnitude.
//
// Rows are value projections of the underlying snapshots; the engine is
// transient and rebuilt per request.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::board::settlement::{build_preview, EventSide, LegSchedule, SettlementEvent};
use crate::error::{EngineError, EngineResult};
use crate::types::{Exchange, FundingSnapshot, LegView};

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// One ranked long/short pairing.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRow {
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub long_leg: LegView,
    pub short_leg: LegView,
    pub interval_mismatch: bool,
    /// Which side settles on the shorter cadence; None when intervals match.
    pub shorter_interval_side: Option<EventSide>,
    /// Short-minus-long annualised nominal spread; never negative.
    pub spread_rate_1y_nominal: f64,
    /// min(long.max_leverage, short.max_leverage); None if either is unknown.
    pub max_usable_leverage: Option<u32>,
    pub leveraged_spread_rate_1y_nominal: Option<f64>,
    pub settlement_events_preview: Vec<SettlementEvent>,
    pub single_side_event_count: usize,
    /// Ranking key: leveraged spread when leverage is known, plain spread
    /// otherwise. Null-score rows rank last.
    pub next_cycle_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Operator-facing board filters.
#[derive(Debug, Clone, Default)]
pub struct BoardFilter {
    pub min_next_cycle_score: Option<f64>,
    pub min_spread_rate_1y_nominal: Option<f64>,
    pub symbol_pattern: Option<Regex>,
    /// When non-empty, both legs of a pair must belong to this set.
    pub exchanges: HashSet<Exchange>,
    pub limit: Option<usize>,
}

impl BoardFilter {
    /// Compile the symbol pattern, tagging bad regexes as validation errors.
    pub fn with_symbol_pattern(mut self, pattern: &str) -> EngineResult<Self> {
        let compiled = Regex::new(pattern)
            .map_err(|e| EngineError::validation(format!("invalid symbol pattern: {e}")))?;
        self.symbol_pattern = Some(compiled);
        Ok(self)
    }

    fn admits(&self, row: &OpportunityRow) -> bool {
        if !self.exchanges.is_empty()
            && !(self.exchanges.contains(&row.long_exchange)
                && self.exchanges.contains(&row.short_exchange))
        {
            return false;
        }
        if let Some(pattern) = &self.symbol_pattern {
            if !pattern.is_match(&row.symbol) {
                return false;
            }
        }
        if let Some(min) = self.min_spread_rate_1y_nominal {
            if row.spread_rate_1y_nominal < min {
                return false;
            }
        }
        if let Some(min) = self.min_next_cycle_score {
            match row.next_cycle_score {
                Some(score) if score >= min => {}
                _ => return false,
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Board construction
// ---------------------------------------------------------------------------

/// Join per-venue snapshots into ranked opportunity rows.
pub fn build_board(
    snapshots_by_venue: &BTreeMap<String, Vec<FundingSnapshot>>,
    filter: &BoardFilter,
) -> Vec<OpportunityRow> {
    // Index by symbol; last write wins per (symbol, venue) so duplicated
    // snapshots cannot pair a venue against itself.
    let mut by_symbol: HashMap<&str, HashMap<Exchange, &FundingSnapshot>> = HashMap::new();
    for snaps in snapshots_by_venue.values() {
        for snap in snaps {
            by_symbol
                .entry(snap.symbol.as_str())
                .or_default()
                .insert(snap.exchange, snap);
        }
    }

    let now = Utc::now();
    let mut rows = Vec::new();
    for venues in by_symbol.values() {
        if venues.len() < 2 {
            continue;
        }
        // Deterministic pair enumeration over the venue set.
        let mut legs: Vec<&FundingSnapshot> = venues.values().copied().collect();
        legs.sort_by_key(|s| s.exchange);

        for i in 0..legs.len() {
            for j in (i + 1)..legs.len() {
                let row = build_row(now, legs[i], legs[j]);
                if filter.admits(&row) {
                    rows.push(row);
                }
            }
        }
    }

    rank(&mut rows);
    if let Some(limit) = filter.limit {
        rows.truncate(limit);
    }
    debug!(rows = rows.len(), "opportunity board built");
    rows
}

/// Orient one unordered pair and compute its scores and preview.
fn build_row(now: chrono::DateTime<Utc>, a: &FundingSnapshot, b: &FundingSnapshot) -> OpportunityRow {
    // Higher annualised rate is shorted; ties break on venue name so the
    // same inputs always produce the same row.
    let (long, short) = if b.rate_1y_nominal() > a.rate_1y_nominal() {
        (a, b)
    } else if a.rate_1y_nominal() > b.rate_1y_nominal() {
        (b, a)
    } else if a.exchange <= b.exchange {
        (a, b)
    } else {
        (b, a)
    };

    let spread_rate_1y_nominal = short.rate_1y_nominal() - long.rate_1y_nominal();
    let max_usable_leverage = match (long.max_leverage, short.max_leverage) {
        (Some(l), Some(s)) => Some(l.min(s)),
        _ => None,
    };
    let leveraged_spread_rate_1y_nominal =
        max_usable_leverage.map(|lev| spread_rate_1y_nominal * lev as f64);
    let next_cycle_score = leveraged_spread_rate_1y_nominal.or(Some(spread_rate_1y_nominal));

    let interval_mismatch = long.funding_interval_hours != short.funding_interval_hours;
    let shorter_interval_side = if !interval_mismatch {
        None
    } else if long.funding_interval_hours < short.funding_interval_hours {
        Some(EventSide::Long)
    } else {
        Some(EventSide::Short)
    };

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

    OpportunityRow {
        symbol: long.symbol.clone(),
        long_exchange: long.exchange,
        short_exchange: short.exchange,
        long_leg: LegView::from(long),
        short_leg: LegView::from(short),
        interval_mismatch,
        shorter_interval_side,
        spread_rate_1y_nominal,
        max_usable_leverage,
        leveraged_spread_rate_1y_nominal,
        settlement_events_preview: preview.events,
        single_side_event_count: preview.single_side_event_count,
        next_cycle_score,
    }
}

/// Rank by next_cycle_score desc, then spread desc, then symbol for
/// determinism. Rows with a null score go last.
fn rank(rows: &mut [OpportunityRow]) {
    rows.sort_by(|x, y| {
        match (x.next_cycle_score, y.next_cycle_score) {
            (Some(a), Some(b)) => b
                .partial_cmp(&a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    y.spread_rate_1y_nominal
                        .partial_cmp(&x.spread_rate_1y_nominal)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| x.symbol.cmp(&y.symbol)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => x.symbol.cmp(&y.symbol),
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
