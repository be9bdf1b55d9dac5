// =============================================================================
// Opportunity board: pairing, scoring, and settlement-event previews
// =============================================================================

pub mod opportunity;
pub mod settlement;

pub use opportunity::{build_board, BoardFilter, OpportunityRow};
pub use settlement::{build_preview, EventKind, EventSide, SettlementEvent, SettlementPreview};
