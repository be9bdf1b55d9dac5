// =============================================================================
// Execution layer: two-leg coordinator and pure preview math
// =============================================================================

pub mod coordinator;
pub mod preview;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::orders::Order;
use crate::store::positions::Position;
use crate::store::risk_ledger::RiskEvent;
use crate::types::{Exchange, Side};
use crate::vault::CredentialInput;

pub use coordinator::ExecutionCoordinator;
pub use preview::{PreviewReport, PreviewRequest};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Open a paired position. Quantity is base-asset units for both legs.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub quantity: f64,
    pub leverage: u32,
    /// Inline credentials override the vault, keyed by exchange.
    #[serde(default)]
    pub credentials: Option<HashMap<Exchange, CredentialInput>>,
}

/// Close both legs of a stored position with reduce-only orders.
#[derive(Debug, Clone, Deserialize)]
pub struct CloseRequest {
    pub position_id: String,
    #[serde(default)]
    pub credentials: Option<HashMap<Exchange, CredentialInput>>,
}

/// Single-sided emergency order against one venue.
#[derive(Debug, Clone, Deserialize)]
pub struct HedgeRequest {
    pub exchange: Exchange,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reason: String,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub credentials: Option<HashMap<Exchange, CredentialInput>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyCloseRequest {
    #[serde(default)]
    pub position_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertRequest {
    pub symbol: String,
    pub notional_usd: f64,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Terminal state of an execution operation as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Open,
    OpenFailed,
    Closed,
    CloseFailed,
    ClosePending,
    RiskExposed,
    HedgePlaced,
    HedgeFailed,
}

/// What one execution call did: the position touched, the order rows
/// written, and every risk event appended along the way. All quantities are
/// base-asset units even though venues were called in contract units.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub position: Option<Position>,
    pub orders: Vec<Order>,
    pub risk_events: Vec<RiskEvent>,
    pub message: String,
}

/// Aggregate of best-effort closes; one entry per attempted position.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyCloseReport {
    pub attempted: usize,
    pub closed: usize,
    pub failed: usize,
    pub reports: Vec<ExecutionReport>,
}

/// Notional-to-quantity conversion via the Binance mark-price oracle.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertReport {
    pub symbol: String,
    pub quantity: f64,
    pub mark_price: f64,
}
