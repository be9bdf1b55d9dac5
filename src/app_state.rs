// =============================================================================
// Central application state — funding-arbitrage engine
// =============================================================================
//
// AppState ties the subsystems together and is shared across all request
// handlers via Arc. The snapshot cache and the credential vault's master key
// are the only process-wide mutable/secret state; both are confined to their
// components and initialised here, once, at startup.
//
// Thread safety:
//   - AtomicU64 for lock-free state-version tracking;
//   - subsystem engines manage their own interior mutability;
//   - sqlite sits behind one async mutex with per-row transactions.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Settings;
use crate::execution::ExecutionCoordinator;
use crate::market::{MarketProvider, SnapshotCache};
use crate::store::orders::OrderStore;
use crate::store::positions::PositionStore;
use crate::store::risk_ledger::RiskLedger;
use crate::store::templates::TemplateStore;
use crate::store::Db;
use crate::types::Exchange;
use crate::vault::CredentialVault;
use crate::venues::{AdapterFactory, LiveAdapterFactory, VenueAdapter};

/// Shared engine state, one instance per process.
pub struct AppState {
    pub settings: Settings,

    /// Monotonically increasing counter bumped on every meaningful state
    /// mutation; surfaced via the health endpoint.
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,

    pub db: Db,
    pub cache: Arc<SnapshotCache>,
    pub provider: Arc<MarketProvider>,
    pub vault: Arc<CredentialVault>,
    pub positions: Arc<PositionStore>,
    pub orders: Arc<OrderStore>,
    pub ledger: Arc<RiskLedger>,
    pub templates: Arc<TemplateStore>,
    pub coordinator: ExecutionCoordinator,
}

impl AppState {
    /// Wire every subsystem from settings plus an open database handle.
    pub fn new(settings: Settings, db: Db) -> Self {
        let cache = Arc::new(SnapshotCache::new(
            settings.market_cache_ttl,
            settings.stale_max_age,
        ));

        let factory: Arc<dyn AdapterFactory> = Arc::new(LiveAdapterFactory::new(&settings));

        // Credential-less data adapters for the read path; the coordinator
        // builds its own per-request trading adapters with plaintext creds.
        let data_adapters: BTreeMap<Exchange, Arc<dyn VenueAdapter>> = Exchange::ALL
            .iter()
            .map(|ex| (*ex, factory.create(*ex, None)))
            .collect();
        let provider = Arc::new(MarketProvider::new(
            data_adapters,
            cache.clone(),
            &settings,
        ));

        let vault = Arc::new(CredentialVault::new(
            db.clone(),
            settings.credential_encryption_key,
        ));
        let positions = Arc::new(PositionStore::new(db.clone()));
        let orders = Arc::new(OrderStore::new(db.clone()));
        let ledger = Arc::new(RiskLedger::new(db.clone()));
        let templates = Arc::new(TemplateStore::new(db.clone()));

        let coordinator = ExecutionCoordinator::new(
            factory,
            vault.clone(),
            cache.clone(),
            provider.clone(),
            positions.clone(),
            orders.clone(),
            ledger.clone(),
        );

        Self {
            settings,
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
            db,
            cache,
            provider,
            vault,
            positions,
            orders,
            ledger,
            templates,
            coordinator,
        }
    }

    /// Bump the version after a meaningful mutation.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
