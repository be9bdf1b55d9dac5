// =============================================================================
// HTTP surface (axum)
// =============================================================================

pub mod rest;
