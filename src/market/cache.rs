// =============================================================================
// SnapshotCache — bounded-TTL cache with a stale-fallback window
// =============================================================================
//
// Keyed by (exchange, symbol). An entry is fresh until `expires_at`, then
// stale until `expires_at + stale_max_age`, then gone. Stale entries are
// re-tagged `source_tag = stale` on the way out regardless of their original
// provenance. `fetched_at` is monotonic per key: a put carrying an older
// snapshot than the cached one is dropped.
//
// This is the only cross-request shared mutable state in the engine; updates
// are atomic at the map level via parking_lot::RwLock.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Exchange, FundingSnapshot, SourceTag};

/// Result of a point lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Fresh(FundingSnapshot),
    /// Past TTL but within the stale window; already re-tagged `stale`.
    Stale(FundingSnapshot),
    Miss,
}

struct Entry {
    snapshot: FundingSnapshot,
    expires_at: DateTime<Utc>,
}

pub struct SnapshotCache {
    ttl: Duration,
    stale_max_age: Duration,
    entries: RwLock<HashMap<(Exchange, String), Entry>>,
    /// When each venue last had a full snapshot set written.
    venue_stamp: RwLock<HashMap<Exchange, DateTime<Utc>>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, stale_max_age: Duration) -> Self {
        Self {
            ttl,
            stale_max_age,
            entries: RwLock::new(HashMap::new()),
            venue_stamp: RwLock::new(HashMap::new()),
        }
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    fn stale_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }

    // -------------------------------------------------------------------------
    // Point operations
    // -------------------------------------------------------------------------

    /// Insert one snapshot; refreshes `expires_at = now + ttl`. Drops the put
    /// when the cached entry is newer (monotonic fetched_at per key).
    pub fn put(&self, snapshot: FundingSnapshot) {
        let key = snapshot.key();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.snapshot.fetched_at > snapshot.fetched_at {
                debug!(
                    exchange = %key.0,
                    symbol = %key.1,
                    "dropping cache put older than the cached snapshot"
                );
                return;
            }
        }
        entries.insert(
            key,
            Entry {
                snapshot,
                expires_at: Utc::now() + self.ttl_chrono(),
            },
        );
    }

    pub fn get(&self, exchange: Exchange, symbol: &str) -> CacheLookup {
        let now = Utc::now();
        let entries = self.entries.read();
        let Some(entry) = entries.get(&(exchange, symbol.to_string())) else {
            return CacheLookup::Miss;
        };

        if now <= entry.expires_at {
            CacheLookup::Fresh(entry.snapshot.clone())
        } else if now <= entry.expires_at + self.stale_chrono() {
            let mut snap = entry.snapshot.clone();
            snap.source_tag = SourceTag::Stale;
            CacheLookup::Stale(snap)
        } else {
            CacheLookup::Miss
        }
    }

    // -------------------------------------------------------------------------
    // Venue-level operations (used by the provider's fan-out)
    // -------------------------------------------------------------------------

    /// Store a full snapshot set for a venue and stamp its fetch time.
    pub fn put_venue(&self, exchange: Exchange, snapshots: &[FundingSnapshot]) {
        for snap in snapshots {
            self.put(snap.clone());
        }
        self.venue_stamp.write().insert(exchange, Utc::now());
    }

    /// All fresh entries for a venue, or None when the venue's last full
    /// write is older than the TTL (callers must not treat a partial fresh
    /// subset as a complete venue answer).
    pub fn venue_fresh(&self, exchange: Exchange) -> Option<Vec<FundingSnapshot>> {
        let stamp = *self.venue_stamp.read().get(&exchange)?;
        if Utc::now() > stamp + self.ttl_chrono() {
            return None;
        }
        let snaps = self.collect_venue(exchange, false);
        (!snaps.is_empty()).then_some(snaps)
    }

    /// All entries for a venue still inside the stale window, re-tagged
    /// `stale`. None when the venue has aged out entirely.
    pub fn venue_stale(&self, exchange: Exchange) -> Option<Vec<FundingSnapshot>> {
        let stamp = *self.venue_stamp.read().get(&exchange)?;
        if Utc::now() > stamp + self.ttl_chrono() + self.stale_chrono() {
            return None;
        }
        let snaps = self.collect_venue(exchange, true);
        (!snaps.is_empty()).then_some(snaps)
    }

    /// Fresh collection admits only unexpired entries; the stale collection
    /// extends to the stale window and re-tags whatever has expired.
    fn collect_venue(&self, exchange: Exchange, include_stale: bool) -> Vec<FundingSnapshot> {
        let now = Utc::now();
        let stale_window = self.stale_chrono();
        self.entries
            .read()
            .values()
            .filter(|e| e.snapshot.exchange == exchange)
            .filter(|e| {
                if include_stale {
                    now <= e.expires_at + stale_window
                } else {
                    now <= e.expires_at
                }
            })
            .map(|e| {
                let mut snap = e.snapshot.clone();
                if include_stale && now > e.expires_at {
                    snap.source_tag = SourceTag::Stale;
                }
                snap
            })
            .collect()
    }

    /// Drop every entry (used by tests and by shutdown teardown).
    pub fn clear(&self) {
        self.entries.write().clear();
        self.venue_stamp.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl", &self.ttl)
            .field("stale_max_age", &self.stale_max_age)
            .field("entries", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
