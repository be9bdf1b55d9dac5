// =============================================================================
// Market data layer: snapshot cache + cross-venue provider
// =============================================================================

pub mod cache;
pub mod provider;

pub use cache::{CacheLookup, SnapshotCache};
pub use provider::{BoardResult, FetchMeta, MarketProvider};
