// =============================================================================
// MarketProvider — concurrent venue fan-out with budgets and fallbacks
// =============================================================================
//
// One worker per venue, each racing the adapter's transport chain under a
// per-venue budget, all under an overall deadline. Workers never share
// mutable state; each returns its own snapshot set and the fan-in assembles
// a deterministic (venue-name-sorted) board.
//
// Fan-in rules:
//   - a venue is ok iff a non-empty snapshot set arrived within budget;
//   - a zero-row result is a failure (it normally means throttling);
//   - cache_hit is true iff every venue was served from fresh cache with no
//     network calls;
//   - a failed venue still contributes rows when the cache holds entries
//     inside the stale window (tagged `stale`).
//
// Single-flight: concurrent non-forced callers serialise on a per-venue
// mutex and re-check the cache after acquiring it, so one live fetch serves
// all of them. force_refresh skips both the fresh-cache check and the mutex;
// it does not invalidate a fetch already completing.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::market::cache::SnapshotCache;
use crate::types::{Exchange, FundingSnapshot, SourceTag};
use crate::venues::VenueAdapter;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Fetch metadata returned alongside every board.
#[derive(Debug, Clone, Serialize)]
pub struct FetchMeta {
    /// Wall time of the whole fan-out in milliseconds.
    pub fetch_ms: u64,
    /// True iff all venues were satisfied from cache without network calls.
    pub cache_hit: bool,
    pub venues_ok: Vec<String>,
    pub venues_failed: Vec<String>,
    /// Normalized provenance: venue -> source tag of the data served.
    pub exchange_sources: BTreeMap<String, String>,
}

/// Snapshots per venue plus fetch metadata. The map is keyed by venue name
/// so iteration order is deterministic; consumers must not depend on fetch
/// completion order.
#[derive(Debug, Clone, Serialize)]
pub struct BoardResult {
    pub snapshots_by_venue: BTreeMap<String, Vec<FundingSnapshot>>,
    pub meta: FetchMeta,
}

/// Per-venue worker outcome.
struct VenueFetch {
    exchange: Exchange,
    snapshots: Vec<FundingSnapshot>,
    /// Live fetch or fresh-cache success.
    ok: bool,
    /// Served from fresh cache without touching the network.
    from_cache: bool,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct MarketProvider {
    adapters: BTreeMap<Exchange, Arc<dyn VenueAdapter>>,
    cache: Arc<SnapshotCache>,
    venue_budget: Duration,
    total_budget: Duration,
    enable_ccxt_market_leverage: bool,
    /// Per-venue single-flight locks for non-forced fetches.
    flight_locks: HashMap<Exchange, Arc<tokio::sync::Mutex<()>>>,
}

impl MarketProvider {
    pub fn new(
        adapters: BTreeMap<Exchange, Arc<dyn VenueAdapter>>,
        cache: Arc<SnapshotCache>,
        settings: &Settings,
    ) -> Self {
        let flight_locks = adapters
            .keys()
            .map(|ex| (*ex, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            adapters,
            cache,
            venue_budget: settings.venue_fetch_budget,
            total_budget: settings.total_fetch_budget,
            enable_ccxt_market_leverage: settings.enable_ccxt_market_leverage,
            flight_locks,
        }
    }

    /// Kick off background feeds (the Gate ws last-value tier).
    pub fn start_streams(&self) {
        for adapter in self.adapters.values() {
            adapter.clone().start_streams();
        }
    }

    /// Fan out to every configured venue and assemble the board.
    pub async fn fetch_all(&self, force_refresh: bool) -> BoardResult {
        let started = std::time::Instant::now();
        let deadline = tokio::time::Instant::now() + self.total_budget;

        let mut set = JoinSet::new();
        for (exchange, adapter) in &self.adapters {
            let exchange = *exchange;
            let adapter = adapter.clone();
            let cache = self.cache.clone();
            let budget = self.venue_budget;
            let lock = self.flight_locks[&exchange].clone();
            set.spawn(async move {
                fetch_venue(exchange, adapter, cache, budget, force_refresh, lock).await
            });
        }

        let mut results: HashMap<Exchange, VenueFetch> = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(fetch))) => {
                    results.insert(fetch.exchange, fetch);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "venue fetch task panicked"),
                Ok(None) => break,
                Err(_) => {
                    warn!("total fetch budget exhausted; abandoning unfinished venues");
                    set.abort_all();
                    break;
                }
            }
        }

        // Venues cut off by the overall deadline still get the stale window.
        for exchange in self.adapters.keys() {
            if results.contains_key(exchange) {
                continue;
            }
            let snapshots = self.cache.venue_stale(*exchange).unwrap_or_default();
            results.insert(
                *exchange,
                VenueFetch {
                    exchange: *exchange,
                    snapshots,
                    ok: false,
                    from_cache: false,
                },
            );
        }

        self.assemble(results, started.elapsed())
    }

    fn assemble(
        &self,
        results: HashMap<Exchange, VenueFetch>,
        elapsed: Duration,
    ) -> BoardResult {
        let mut snapshots_by_venue = BTreeMap::new();
        let mut venues_ok = Vec::new();
        let mut venues_failed = Vec::new();
        let mut exchange_sources = BTreeMap::new();
        let mut all_from_cache = !results.is_empty();

        for (exchange, fetch) in results {
            let name = exchange.as_str().to_string();
            if fetch.ok {
                venues_ok.push(name.clone());
            } else {
                venues_failed.push(name.clone());
            }
            all_from_cache &= fetch.from_cache;

            if let Some(first) = fetch.snapshots.first() {
                exchange_sources.insert(name.clone(), first.source_tag.to_string());
            }

            let mut snaps = fetch.snapshots;
            if !self.enable_ccxt_market_leverage {
                for snap in snaps.iter_mut().filter(|s| s.source_tag == SourceTag::Ccxt) {
                    snap.max_leverage = None;
                }
            }
            snapshots_by_venue.insert(name, snaps);
        }

        venues_ok.sort();
        venues_failed.sort();

        BoardResult {
            snapshots_by_venue,
            meta: FetchMeta {
                fetch_ms: elapsed.as_millis() as u64,
                cache_hit: all_from_cache,
                venues_ok,
                venues_failed,
                exchange_sources,
            },
        }
    }
}

impl std::fmt::Debug for MarketProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketProvider")
            .field("venues", &self.adapters.keys().collect::<Vec<_>>())
            .field("venue_budget", &self.venue_budget)
            .field("total_budget", &self.total_budget)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-venue worker
// ---------------------------------------------------------------------------

async fn fetch_venue(
    exchange: Exchange,
    adapter: Arc<dyn VenueAdapter>,
    cache: Arc<SnapshotCache>,
    budget: Duration,
    force_refresh: bool,
    lock: Arc<tokio::sync::Mutex<()>>,
) -> VenueFetch {
    if !force_refresh {
        if let Some(snapshots) = cache.venue_fresh(exchange) {
            return VenueFetch {
                exchange,
                snapshots,
                ok: true,
                from_cache: true,
            };
        }

        // Single flight: whoever holds the lock fetches; everyone queued
        // behind finds the fresh result on re-check.
        let _guard = lock.lock().await;
        if let Some(snapshots) = cache.venue_fresh(exchange) {
            return VenueFetch {
                exchange,
                snapshots,
                ok: true,
                from_cache: true,
            };
        }
        return fetch_venue_live(exchange, adapter, cache, budget).await;
    }

    fetch_venue_live(exchange, adapter, cache, budget).await
}

/// Race the adapter's transport chain under the per-venue budget; fall back
/// to the stale cache window when every tier fails.
async fn fetch_venue_live(
    exchange: Exchange,
    adapter: Arc<dyn VenueAdapter>,
    cache: Arc<SnapshotCache>,
    budget: Duration,
) -> VenueFetch {
    let deadline = tokio::time::Instant::now() + budget;

    for transport in adapter.transports() {
        // Two attempts per tier: transient data-path errors get one retry.
        for attempt in 0..2 {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let outcome = tokio::time::timeout_at(
                deadline,
                adapter.fetch_funding(*transport, None),
            )
            .await;

            match outcome {
                Ok(Ok(snapshots)) if !snapshots.is_empty() => {
                    cache.put_venue(exchange, &snapshots);
                    debug!(
                        venue = %exchange,
                        ?transport,
                        rows = snapshots.len(),
                        "venue fetch succeeded"
                    );
                    return VenueFetch {
                        exchange,
                        snapshots,
                        ok: true,
                        from_cache: false,
                    };
                }
                Ok(Ok(_)) => {
                    // Zero rows normally means throttling; try the next tier.
                    warn!(venue = %exchange, ?transport, "zero-row result treated as failure");
                    break;
                }
                Ok(Err(e)) if e.kind.is_retryable() && attempt == 0 => {
                    debug!(venue = %exchange, ?transport, error = %e, "transient; retrying once");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(venue = %exchange, ?transport, error = %e, "transport tier failed");
                    break;
                }
                Err(_) => {
                    warn!(venue = %exchange, ?transport, "venue budget elapsed mid-call");
                    break;
                }
            }
        }
    }

    // Data-path downgrade: serve the stale window instead of failing dark.
    let snapshots = cache.venue_stale(exchange).unwrap_or_default();
    if !snapshots.is_empty() {
        debug!(venue = %exchange, rows = snapshots.len(), "serving stale cache window");
    }
    VenueFetch {
        exchange,
        snapshots,
        ok: false,
        from_cache: false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineResult};
    use crate::venues::{OrderPlacement, OrderRequest, Transport};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Rows(usize),
        Empty,
        Fail,
        Hang,
    }

    struct MockVenue {
        exchange: Exchange,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockVenue {
        fn new(exchange: Exchange, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                exchange,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn rows(&self, n: usize) -> Vec<FundingSnapshot> {
            (0..n)
                .map(|i| FundingSnapshot {
                    exchange: self.exchange,
                    symbol: format!("SYM{i}USDT"),
                    funding_rate_raw: 0.0001,
                    funding_interval_hours: 8.0,
                    next_funding_time: Utc::now() + chrono::Duration::hours(4),
                    mark_price: 100.0,
                    open_interest_usd: None,
                    volume24h_usd: None,
                    max_leverage: Some(20),
                    source_tag: SourceTag::Ccxt,
                    fetched_at: Utc::now(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl VenueAdapter for MockVenue {
        fn name(&self) -> Exchange {
            self.exchange
        }

        fn transports(&self) -> &'static [Transport] {
            &[Transport::Library]
        }

        async fn fetch_funding(
            &self,
            _transport: Transport,
            _symbols: Option<&[String]>,
        ) -> EngineResult<Vec<FundingSnapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Rows(n) => Ok(self.rows(n)),
                Behavior::Empty => Ok(Vec::new()),
                Behavior::Fail => Err(EngineError::transient("mock venue down")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn fetch_mark_price(&self, _symbol: &str) -> EngineResult<f64> {
            Ok(100.0)
        }

        async fn fetch_max_leverage(&self, _symbol: &str) -> EngineResult<Option<u32>> {
            Ok(Some(20))
        }

        async fn contract_size(&self, _symbol: &str) -> EngineResult<f64> {
            Ok(1.0)
        }

        async fn place_order(&self, _req: &OrderRequest) -> EngineResult<OrderPlacement> {
            Err(EngineError::not_supported("mock"))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> EngineResult<()> {
            Ok(())
        }
    }

    fn provider_with(
        adapters: Vec<Arc<MockVenue>>,
        cache: Arc<SnapshotCache>,
    ) -> MarketProvider {
        let mut settings = Settings::default();
        settings.venue_fetch_budget = Duration::from_millis(200);
        settings.total_fetch_budget = Duration::from_millis(500);
        let map: BTreeMap<Exchange, Arc<dyn VenueAdapter>> = adapters
            .into_iter()
            .map(|a| (a.exchange, a as Arc<dyn VenueAdapter>))
            .collect();
        MarketProvider::new(map, cache, &settings)
    }

    fn default_cache() -> Arc<SnapshotCache> {
        Arc::new(SnapshotCache::new(
            Duration::from_secs(300),
            Duration::from_secs(120),
        ))
    }

    #[tokio::test]
    async fn happy_path_then_cache_hit() {
        let binance = MockVenue::new(Exchange::Binance, Behavior::Rows(2));
        let okx = MockVenue::new(Exchange::Okx, Behavior::Rows(3));
        let provider = provider_with(vec![binance.clone(), okx.clone()], default_cache());

        let first = provider.fetch_all(false).await;
        assert!(!first.meta.cache_hit);
        assert_eq!(first.meta.venues_ok, vec!["binance", "okx"]);
        assert!(first.meta.venues_failed.is_empty());
        assert_eq!(first.snapshots_by_venue["binance"].len(), 2);
        assert_eq!(first.snapshots_by_venue["okx"].len(), 3);

        // Immediate refetch without force_refresh: same rows, no network.
        let second = provider.fetch_all(false).await;
        assert!(second.meta.cache_hit);
        assert_eq!(
            second.snapshots_by_venue["binance"].len(),
            first.snapshots_by_venue["binance"].len()
        );
        assert_eq!(binance.calls.load(Ordering::SeqCst), 1);
        assert_eq!(okx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_cache() {
        let binance = MockVenue::new(Exchange::Binance, Behavior::Rows(1));
        let provider = provider_with(vec![binance.clone()], default_cache());

        provider.fetch_all(false).await;
        provider.fetch_all(true).await;
        assert_eq!(binance.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_rows_is_a_failure() {
        let bitget = MockVenue::new(Exchange::Bitget, Behavior::Empty);
        let provider = provider_with(vec![bitget], default_cache());

        let board = provider.fetch_all(false).await;
        assert_eq!(board.meta.venues_failed, vec!["bitget"]);
        assert!(board.meta.venues_ok.is_empty());
        assert!(board.snapshots_by_venue["bitget"].is_empty());
    }

    #[tokio::test]
    async fn failed_venue_serves_stale_window() {
        // TTL zero so the seeded entries are instantly stale but admissible.
        let cache = Arc::new(SnapshotCache::new(
            Duration::ZERO,
            Duration::from_secs(120),
        ));
        let seed = MockVenue::new(Exchange::Binance, Behavior::Rows(2));
        cache.put_venue(Exchange::Binance, &seed.rows(2));

        let down = MockVenue::new(Exchange::Binance, Behavior::Fail);
        let provider = provider_with(vec![down], cache);

        let board = provider.fetch_all(false).await;
        assert_eq!(board.meta.venues_failed, vec!["binance"]);
        let rows = &board.snapshots_by_venue["binance"];
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|s| s.source_tag == SourceTag::Stale));
        assert_eq!(board.meta.exchange_sources["binance"], "stale");
    }

    #[tokio::test]
    async fn hanging_venue_is_cut_by_budget() {
        let hung = MockVenue::new(Exchange::Gate, Behavior::Hang);
        let ok = MockVenue::new(Exchange::Binance, Behavior::Rows(1));
        let provider = provider_with(vec![hung, ok], default_cache());

        let board = provider.fetch_all(false).await;
        assert_eq!(board.meta.venues_ok, vec!["binance"]);
        assert_eq!(board.meta.venues_failed, vec!["gate"]);
    }

    #[tokio::test]
    async fn transient_error_is_retried_once() {
        let flaky = MockVenue::new(Exchange::Okx, Behavior::Fail);
        let provider = provider_with(vec![flaky.clone()], default_cache());

        provider.fetch_all(false).await;
        // One original attempt plus exactly one retry.
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn output_is_venue_name_sorted() {
        let a = MockVenue::new(Exchange::Okx, Behavior::Rows(1));
        let b = MockVenue::new(Exchange::Binance, Behavior::Rows(1));
        let c = MockVenue::new(Exchange::Gate, Behavior::Rows(1));
        let provider = provider_with(vec![a, b, c], default_cache());

        let board = provider.fetch_all(false).await;
        let keys: Vec<&String> = board.snapshots_by_venue.keys().collect();
        assert_eq!(keys, vec!["binance", "gate", "okx"]);
    }

    #[tokio::test]
    async fn disabled_market_leverage_strips_library_tier() {
        let binance = MockVenue::new(Exchange::Binance, Behavior::Rows(1));
        let cache = default_cache();
        let mut settings = Settings::default();
        settings.venue_fetch_budget = Duration::from_millis(200);
        settings.total_fetch_budget = Duration::from_millis(500);
        settings.enable_ccxt_market_leverage = false;
        let map: BTreeMap<Exchange, Arc<dyn VenueAdapter>> =
            [(Exchange::Binance, binance as Arc<dyn VenueAdapter>)]
                .into_iter()
                .collect();
        let provider = MarketProvider::new(map, cache, &settings);

        let board = provider.fetch_all(false).await;
        assert!(board.snapshots_by_venue["binance"]
            .iter()
            .all(|s| s.max_leverage.is_none()));
    }
}
