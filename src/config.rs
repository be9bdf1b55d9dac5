// =============================================================================
// Settings — environment-driven configuration (prefix FA_)
// =============================================================================
//
// All knobs are read once at startup. A malformed value is a hard error:
// main exits with code 2 rather than running with a silently-wrong budget.
//
// The credential master key accepts 64 hex chars or base64 of 32 bytes. It
// lives in process memory only and must never be logged or persisted.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine as _;

/// Length of the AES-256-GCM master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

fn default_database_url() -> String {
    "fundarb.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

/// Immutable engine settings resolved from the environment.
#[derive(Clone)]
pub struct Settings {
    /// Path (or sqlite:// URL) of the relational store.
    pub database_url: String,
    /// Reserved: accepted and logged, no Redis tier exists in this core.
    pub redis_url: Option<String>,
    /// Comma-separated allowed CORS origins; empty means allow-any.
    pub cors_origins: Vec<String>,
    /// AES-256-GCM master key for the credential vault, when configured.
    pub credential_encryption_key: Option<[u8; MASTER_KEY_LEN]>,
    /// Snapshot cache TTL.
    pub market_cache_ttl: Duration,
    /// How long past expiry a cache entry remains admissible as `stale`.
    pub stale_max_age: Duration,
    /// Whether the batch ("library") tier may report max leverage.
    pub enable_ccxt_market_leverage: bool,
    /// Route Binance orders and leverage calls through the portfolio-margin
    /// (unified account) endpoints.
    pub binance_unified_account: bool,
    /// Per-venue fetch deadline inside `fetch_all`.
    pub venue_fetch_budget: Duration,
    /// Overall deadline for one `fetch_all` fan-out.
    pub total_fetch_budget: Duration,
    /// Deadline for a single outbound data call.
    pub data_timeout: Duration,
    /// Deadline for a single outbound order call.
    pub order_timeout: Duration,
    /// HTTP bind address.
    pub bind_addr: String,
}

impl Settings {
    /// Resolve settings from `FA_*` environment variables, with defaults.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("FA_DATABASE_URL").unwrap_or_else(|_| default_database_url());
        let redis_url = std::env::var("FA_REDIS_URL").ok().filter(|s| !s.is_empty());

        let cors_origins = std::env::var("FA_CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let credential_encryption_key = match std::env::var("FA_CREDENTIAL_ENCRYPTION_KEY") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_master_key(raw.trim())?),
            _ => None,
        };

        let market_cache_ttl =
            Duration::from_secs(env_parse("FA_MARKET_CACHE_TTL_SECONDS", 300u64)?);
        let stale_max_age = Duration::from_secs(env_parse("FA_STALE_MAX_AGE_SECONDS", 120u64)?);
        let enable_ccxt_market_leverage = env_parse("FA_ENABLE_CCXT_MARKET_LEVERAGE", true)?;
        let binance_unified_account = env_parse("FA_BINANCE_UNIFIED_ACCOUNT", false)?;
        let venue_fetch_budget =
            Duration::from_millis(env_parse("FA_VENUE_FETCH_BUDGET_MS", 4_000u64)?);
        let total_fetch_budget =
            Duration::from_millis(env_parse("FA_TOTAL_FETCH_BUDGET_MS", 10_000u64)?);
        let data_timeout = Duration::from_millis(env_parse("FA_DATA_TIMEOUT_MS", 5_000u64)?);
        let order_timeout = Duration::from_millis(env_parse("FA_ORDER_TIMEOUT_MS", 10_000u64)?);

        let bind_addr = std::env::var("FA_BIND_ADDR").unwrap_or_else(|_| default_bind_addr());

        if venue_fetch_budget > total_fetch_budget {
            bail!(
                "FA_VENUE_FETCH_BUDGET_MS ({:?}) exceeds FA_TOTAL_FETCH_BUDGET_MS ({:?})",
                venue_fetch_budget,
                total_fetch_budget
            );
        }

        Ok(Self {
            database_url,
            redis_url,
            cors_origins,
            credential_encryption_key,
            market_cache_ttl,
            stale_max_age,
            enable_ccxt_market_leverage,
            binance_unified_account,
            venue_fetch_budget,
            total_fetch_budget,
            data_timeout,
            order_timeout,
            bind_addr,
        })
    }

    /// Filesystem path of the sqlite database, with the optional
    /// `sqlite://` scheme stripped.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }
}

/// Parse an env var as `T`, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}='{raw}': {e}")),
        _ => Ok(default),
    }
}

/// Decode a 32-byte master key given as 64 hex chars or as base64.
fn parse_master_key(raw: &str) -> Result<[u8; MASTER_KEY_LEN]> {
    let bytes = if raw.len() == MASTER_KEY_LEN * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(raw).context("decoding hex FA_CREDENTIAL_ENCRYPTION_KEY")?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .context("decoding base64 FA_CREDENTIAL_ENCRYPTION_KEY")?
    };

    if bytes.len() != MASTER_KEY_LEN {
        bail!(
            "FA_CREDENTIAL_ENCRYPTION_KEY must decode to {MASTER_KEY_LEN} bytes, got {}",
            bytes.len()
        );
    }

    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("database_url", &self.database_url)
            .field("redis_url", &self.redis_url)
            .field("cors_origins", &self.cors_origins)
            .field(
                "credential_encryption_key",
                &self.credential_encryption_key.map(|_| "<redacted>"),
            )
            .field("market_cache_ttl", &self.market_cache_ttl)
            .field("stale_max_age", &self.stale_max_age)
            .field("venue_fetch_budget", &self.venue_fetch_budget)
            .field("total_fetch_budget", &self.total_fetch_budget)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

#[cfg(test)]
impl Default for Settings {
    /// Test fixture: in-memory-ish defaults with a fixed master key.
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            redis_url: None,
            cors_origins: Vec::new(),
            credential_encryption_key: Some([7u8; MASTER_KEY_LEN]),
            market_cache_ttl: Duration::from_secs(300),
            stale_max_age: Duration::from_secs(120),
            enable_ccxt_market_leverage: true,
            binance_unified_account: false,
            venue_fetch_budget: Duration::from_millis(4_000),
            total_fetch_budget: Duration::from_millis(10_000),
            data_timeout: Duration::from_millis(5_000),
            order_timeout: Duration::from_millis(10_000),
            bind_addr: default_bind_addr(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_accepts_hex() {
        let raw = "ab".repeat(32);
        let key = parse_master_key(&raw).unwrap();
        assert_eq!(key[0], 0xab);
        assert_eq!(key[31], 0xab);
    }

    #[test]
    fn master_key_accepts_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        let key = parse_master_key(&encoded).unwrap();
        assert_eq!(key, [9u8; 32]);
    }

    #[test]
    fn master_key_rejects_short_input() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([9u8; 16]);
        assert!(parse_master_key(&encoded).is_err());
        assert!(parse_master_key("not-a-key").is_err());
    }

    #[test]
    fn database_path_strips_scheme() {
        let mut s = Settings::default();
        s.database_url = "sqlite:///var/lib/fundarb.db".to_string();
        assert_eq!(s.database_path(), "/var/lib/fundarb.db");
        s.database_url = "fundarb.db".to_string();
        assert_eq!(s.database_path(), "fundarb.db");
    }

    #[test]
    fn debug_redacts_master_key() {
        let s = Settings::default();
        let rendered = format!("{s:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("7, 7, 7"));
    }
}
