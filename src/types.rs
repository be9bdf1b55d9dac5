// =============================================================================
// Shared types used across the funding-arbitrage engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Hours per year, used by the nominal annualisation of funding rates.
const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// The five supported USDT-perpetual venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Bitget,
    Gate,
}

impl Exchange {
    /// All venues in deterministic (name-sorted) order.
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Bitget,
        Exchange::Bybit,
        Exchange::Gate,
        Exchange::Okx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Bybit => "bybit",
            Self::Bitget => "bitget",
            Self::Gate => "gate",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "okx" => Ok(Self::Okx),
            "bybit" => Ok(Self::Bybit),
            "bitget" => Ok(Self::Bitget),
            "gate" | "gateio" | "gate.io" => Ok(Self::Gate),
            other => Err(EngineError::validation(format!(
                "unknown exchange: '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Source tag
// ---------------------------------------------------------------------------

/// Provenance of a funding snapshot: which transport tier produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Consolidated batch endpoint (the "library" tier).
    Ccxt,
    /// Per-symbol native REST endpoint.
    Rest,
    /// Last value seen on a websocket stream.
    Ws,
    /// Expired cache entry served within the stale window.
    Stale,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ccxt => "ccxt",
            Self::Rest => "rest",
            Self::Ws => "ws",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Funding snapshot
// ---------------------------------------------------------------------------

/// Normalised per-venue funding snapshot, keyed by `(exchange, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub exchange: Exchange,
    /// Uppercase, USDT-suffixed (e.g. "BTCUSDT").
    pub symbol: String,
    /// Per-interval funding rate as a signed fraction (0.0001 = 0.01%).
    pub funding_rate_raw: f64,
    /// Settlement cadence in hours (1, 4, 8 typical).
    pub funding_interval_hours: f64,
    /// Absolute UTC instant of the next settlement.
    pub next_funding_time: DateTime<Utc>,
    pub mark_price: f64,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
    #[serde(default)]
    pub volume24h_usd: Option<f64>,
    #[serde(default)]
    pub max_leverage: Option<u32>,
    pub source_tag: SourceTag,
    pub fetched_at: DateTime<Utc>,
}

impl FundingSnapshot {
    /// Funding rate normalised to a one-hour interval.
    pub fn rate_1h(&self) -> f64 {
        if self.funding_interval_hours > 0.0 {
            self.funding_rate_raw / self.funding_interval_hours
        } else {
            0.0
        }
    }

    /// Nominal (non-compounding) annualised rate.
    pub fn rate_1y_nominal(&self) -> f64 {
        self.rate_1h() * HOURS_PER_YEAR
    }

    /// Annualised rate multiplied by the venue's max leverage, when known.
    pub fn leveraged_nominal_rate_1y(&self) -> Option<f64> {
        self.max_leverage
            .map(|lev| self.rate_1y_nominal() * lev as f64)
    }

    /// Cache / map key.
    pub fn key(&self) -> (Exchange, String) {
        (self.exchange, self.symbol.clone())
    }
}

/// Compact per-leg projection embedded in an opportunity row. A value copy,
/// not a reference into the snapshot map.
#[derive(Debug, Clone, Serialize)]
pub struct LegView {
    pub exchange: Exchange,
    pub funding_rate_raw: f64,
    pub funding_interval_hours: f64,
    pub next_funding_time: DateTime<Utc>,
    pub rate_1y_nominal: f64,
    pub mark_price: f64,
    pub max_leverage: Option<u32>,
    pub source_tag: SourceTag,
}

impl From<&FundingSnapshot> for LegView {
    fn from(s: &FundingSnapshot) -> Self {
        Self {
            exchange: s.exchange,
            funding_rate_raw: s.funding_rate_raw,
            funding_interval_hours: s.funding_interval_hours,
            next_funding_time: s.next_funding_time,
            rate_1y_nominal: s.rate_1y_nominal(),
            mark_price: s.mark_price,
            max_leverage: s.max_leverage,
            source_tag: s.source_tag,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution-domain enums (shared by stores, coordinator, and the API)
// ---------------------------------------------------------------------------

/// Life-cycle status of a paired position. Transitions are forward-only:
/// `open -> closed`, `open -> risk_exposed -> closed`, or a terminal
/// `open_failed` / `close_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    RiskExposed,
    OpenFailed,
    CloseFailed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::RiskExposed => "risk_exposed",
            Self::OpenFailed => "open_failed",
            Self::CloseFailed => "close_failed",
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Closed)
                | (Self::Open, Self::RiskExposed)
                | (Self::Open, Self::CloseFailed)
                | (Self::RiskExposed, Self::Closed)
        )
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "risk_exposed" => Ok(Self::RiskExposed),
            "open_failed" => Ok(Self::OpenFailed),
            "close_failed" => Ok(Self::CloseFailed),
            other => Err(EngineError::internal(format!(
                "unknown position status in store: '{other}'"
            ))),
        }
    }
}

/// What an order leg was trying to accomplish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Open,
    Close,
    Hedge,
    Rollback,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Hedge => "hedge",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            "hedge" => Ok(Self::Hedge),
            "rollback" => Ok(Self::Rollback),
            other => Err(EngineError::internal(format!(
                "unknown order action in store: '{other}'"
            ))),
        }
    }
}

/// Terminal (or pending-reconciliation) state of a single order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Ok,
    Failed,
    Pending,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            other => Err(EngineError::internal(format!(
                "unknown order status in store: '{other}'"
            ))),
        }
    }
}

/// Severity of a risk-ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl RiskSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskSeverity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(EngineError::validation(format!(
                "unknown severity: '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snap(rate: f64, interval: f64, lev: Option<u32>) -> FundingSnapshot {
        FundingSnapshot {
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".to_string(),
            funding_rate_raw: rate,
            funding_interval_hours: interval,
            next_funding_time: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
            mark_price: 65000.0,
            open_interest_usd: None,
            volume24h_usd: None,
            max_leverage: lev,
            source_tag: SourceTag::Ccxt,
            fetched_at: Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap(),
        }
    }

    #[test]
    fn rate_derivations() {
        let s = snap(0.0002, 8.0, Some(10));
        assert!((s.rate_1h() - 0.000025).abs() < 1e-12);
        assert!((s.rate_1y_nominal() - 0.000025 * 24.0 * 365.0).abs() < 1e-12);
        let lev = s.leveraged_nominal_rate_1y().unwrap();
        assert!((lev - s.rate_1y_nominal() * 10.0).abs() < 1e-12);
    }

    #[test]
    fn leveraged_rate_none_without_leverage() {
        let s = snap(0.0002, 8.0, None);
        assert!(s.leveraged_nominal_rate_1y().is_none());
    }

    #[test]
    fn zero_interval_does_not_divide_by_zero() {
        let s = snap(0.0002, 0.0, None);
        assert_eq!(s.rate_1h(), 0.0);
    }

    #[test]
    fn exchange_roundtrip() {
        for ex in Exchange::ALL {
            let parsed: Exchange = ex.as_str().parse().unwrap();
            assert_eq!(parsed, ex);
        }
        assert_eq!("gate.io".parse::<Exchange>().unwrap(), Exchange::Gate);
        assert!("kraken".parse::<Exchange>().is_err());
    }

    #[test]
    fn exchange_all_is_name_sorted() {
        let names: Vec<&str> = Exchange::ALL.iter().map(|e| e.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn position_transitions_forward_only() {
        use PositionStatus::*;
        assert!(Open.can_transition_to(Closed));
        assert!(Open.can_transition_to(RiskExposed));
        assert!(RiskExposed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!OpenFailed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(RiskExposed));
    }

    #[test]
    fn status_serde_names_match_store_strings() {
        assert_eq!(
            serde_json::to_string(&PositionStatus::RiskExposed).unwrap(),
            "\"risk_exposed\""
        );
        assert_eq!(
            "risk_exposed".parse::<PositionStatus>().unwrap(),
            PositionStatus::RiskExposed
        );
        assert_eq!(serde_json::to_string(&SourceTag::Stale).unwrap(), "\"stale\"");
    }
}
