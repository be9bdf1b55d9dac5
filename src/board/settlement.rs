// =============================================================================
// Settlement-event preview — merged funding timelines for a paired position
// =============================================================================
//
// Both legs settle on their own cadence. Walking the two forward sequences
// of funding instants and merging them by time shows an operator exactly
// when the pair is hedged (both legs settle together, net rate applies) and
// when one leg settles alone (directional exposure to that leg's rate).
//
// Merge rules:
//   - instants within MATCH_TOLERANCE collapse into one `hedged` event with
//     amount = short_rate - long_rate;
//   - the earlier unmatched instant becomes a `single_side` event with
//     amount +short_rate (short leg) or -long_rate (long leg);
//   - the walk stops at the first alignment, emitting it as the final
//     `hedged` event (the natural window boundary for margin simulation),
//     or at the 96-event / 7-day bound if the cursors never align.
//
// A leg whose next_funding_time is already in the past has its cursor
// advanced by whole intervals to the first future instant.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Two instants within this tolerance settle together.
pub const MATCH_TOLERANCE_SECS: i64 = 60;
/// Hard cap on preview length.
pub const MAX_EVENTS: usize = 96;
/// Preview horizon.
pub const WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hedged,
    SingleSide,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSide {
    Long,
    Short,
}

/// One settlement instant in the preview window.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementEvent {
    pub event_time: DateTime<Utc>,
    pub kind: EventKind,
    /// The leg settling alone; None for hedged/unknown events.
    pub side: Option<EventSide>,
    /// Net contribution to the paired position's rate at this instant.
    pub amount_rate: f64,
    pub hedged_rate: Option<f64>,
    pub single_side_rate: Option<f64>,
    pub long_rate_raw: f64,
    pub short_rate_raw: f64,
    pub summary: String,
}

/// The full preview plus the single-side count used for ranking context.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementPreview {
    pub events: Vec<SettlementEvent>,
    pub single_side_event_count: usize,
}

/// One leg's cadence inputs.
#[derive(Debug, Clone, Copy)]
pub struct LegSchedule {
    pub funding_rate_raw: f64,
    pub funding_interval_hours: f64,
    pub next_funding_time: DateTime<Utc>,
}

/// Advance `t` by whole `step`s until it is strictly after `now`.
fn advance_past(mut t: DateTime<Utc>, step: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    if t > now {
        return t;
    }
    let behind = (now - t).num_milliseconds();
    let step_ms = step.num_milliseconds().max(1);
    let skips = behind / step_ms + 1;
    t += Duration::milliseconds(skips * step_ms);
    t
}

fn hedged_event(at: DateTime<Utc>, long: &LegSchedule, short: &LegSchedule) -> SettlementEvent {
    let amount = short.funding_rate_raw - long.funding_rate_raw;
    SettlementEvent {
        event_time: at,
        kind: EventKind::Hedged,
        side: None,
        amount_rate: amount,
        hedged_rate: Some(amount),
        single_side_rate: None,
        long_rate_raw: long.funding_rate_raw,
        short_rate_raw: short.funding_rate_raw,
        summary: format!("both legs settle; net rate {amount:+.6}"),
    }
}

fn single_side_event(
    at: DateTime<Utc>,
    side: EventSide,
    long: &LegSchedule,
    short: &LegSchedule,
) -> SettlementEvent {
    let amount = match side {
        EventSide::Short => short.funding_rate_raw,
        EventSide::Long => -long.funding_rate_raw,
    };
    let which = match side {
        EventSide::Short => "short",
        EventSide::Long => "long",
    };
    SettlementEvent {
        event_time: at,
        kind: EventKind::SingleSide,
        side: Some(side),
        amount_rate: amount,
        hedged_rate: None,
        single_side_rate: Some(amount),
        long_rate_raw: long.funding_rate_raw,
        short_rate_raw: short.funding_rate_raw,
        summary: format!("{which} leg settles alone; rate {amount:+.6}"),
    }
}

/// Build the merged preview for a long/short pair as of `now`.
pub fn build_preview(now: DateTime<Utc>, long: &LegSchedule, short: &LegSchedule) -> SettlementPreview {
    // Cadence data we cannot walk: surface a single `unknown` marker rather
    // than a silently empty preview.
    if long.funding_interval_hours <= 0.0 || short.funding_interval_hours <= 0.0 {
        let event = SettlementEvent {
            event_time: now,
            kind: EventKind::Unknown,
            side: None,
            amount_rate: 0.0,
            hedged_rate: None,
            single_side_rate: None,
            long_rate_raw: long.funding_rate_raw,
            short_rate_raw: short.funding_rate_raw,
            summary: "settlement cadence unknown".to_string(),
        };
        return SettlementPreview {
            events: vec![event],
            single_side_event_count: 0,
        };
    }

    let long_step = Duration::milliseconds((long.funding_interval_hours * 3_600_000.0) as i64);
    let short_step = Duration::milliseconds((short.funding_interval_hours * 3_600_000.0) as i64);
    let horizon = now + Duration::days(WINDOW_DAYS);

    let mut long_cursor = advance_past(long.next_funding_time, long_step, now);
    let mut short_cursor = advance_past(short.next_funding_time, short_step, now);

    let mut events = Vec::new();
    let mut single_side_event_count = 0;

    while events.len() < MAX_EVENTS {
        if long_cursor > horizon && short_cursor > horizon {
            break;
        }

        let gap = (long_cursor - short_cursor).num_seconds().abs();
        if gap <= MATCH_TOLERANCE_SECS {
            // Realignment: the final hedged event closes the window.
            events.push(hedged_event(long_cursor.min(short_cursor), long, short));
            break;
        }

        if short_cursor < long_cursor {
            if short_cursor > horizon {
                break;
            }
            events.push(single_side_event(short_cursor, EventSide::Short, long, short));
            single_side_event_count += 1;
            short_cursor += short_step;
        } else {
            if long_cursor > horizon {
                break;
            }
            events.push(single_side_event(long_cursor, EventSide::Long, long, short));
            single_side_event_count += 1;
            long_cursor += long_step;
        }
    }

    SettlementPreview {
        events,
        single_side_event_count,
    }
}

// =============================================================================
// Tests
// =============================================================================
