// =============================================================================
// Venue adapters — one flat implementation per exchange
// =============================================================================
//
// Each adapter speaks the venue's native REST (and, for Gate, an optional
// websocket last-value feed) and normalises everything at the boundary:
//
//   - symbols are uppercase USDT-suffixed ("BTCUSDT") on the way in and out;
//   - order quantities cross the trait in BASE-ASSET units; adapters convert
//     to venue-native contract units internally and convert fills back;
//   - every failure carries an ErrorKind tag (transient / auth /
//     not_supported / validation / internal).
//
// Venue quirks (position-side retries, unified-account routing, passphrase
// signatures) live in the concrete adapter files, not behind the trait.
// =============================================================================

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod gate;
pub mod okx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::types::{Exchange, FundingSnapshot, Side};

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Transport tiers an adapter can advertise, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Consolidated batch endpoint, the equivalent of a ccxt-style library
    /// call returning every symbol at once.
    Library,
    /// Per-symbol native REST.
    Rest,
    /// Websocket last-value cache.
    Ws,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Plaintext credentials handed to an adapter for signed calls. Produced
/// only by the vault's executor pull path or an inline request override.
#[derive(Clone)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub testnet: bool,
}

impl std::fmt::Debug for VenueCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("testnet", &self.testnet)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// A single order leg, quantity in base-asset units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    /// Base-asset quantity (e.g. BTC), never venue contract units.
    pub quantity_base: f64,
    /// True for closing/rollback legs; venues that support it get the
    /// reduce-only flag, the rest simply receive the opposite side.
    pub reduce_only: bool,
}

impl OrderRequest {
    /// The position side this leg intends to hold or unwind: a non-reducing
    /// buy (or reducing sell) works the long side, the mirror works the short.
    pub fn position_is_long(&self) -> bool {
        matches!(
            (self.side, self.reduce_only),
            (Side::Buy, false) | (Side::Sell, true)
        )
    }
}

/// Venue acknowledgement of an order, converted back to base-asset units.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderAck {
    pub exchange_order_id: Option<String>,
    pub filled_qty_base: Option<f64>,
    pub avg_price: Option<f64>,
    /// Diagnostic note (e.g. a quirk retry fired); surfaced on the stored
    /// order row, never as a risk event.
    pub note: Option<String>,
}

/// Outcome of `place_order`. A deadline elapsing with the request in flight
/// is NOT an error: the order may have reached the venue, so the caller must
/// record it as pending and reconcile, never retry blindly.
#[derive(Debug, Clone)]
pub enum OrderPlacement {
    Acked(OrderAck),
    Pending(OrderAck),
}

impl OrderPlacement {
    pub fn ack(&self) -> &OrderAck {
        match self {
            Self::Acked(a) | Self::Pending(a) => a,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// Polymorphic per-venue capability set. Implementations are flat concrete
/// structs; quirks live in the implementation, not in trait defaults.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> Exchange;

    /// Advertised transports in fallback order.
    fn transports(&self) -> &'static [Transport];

    /// Start any background feeds the adapter maintains (ws last-value
    /// tiers). Called once per data adapter by the market provider.
    fn start_streams(self: Arc<Self>) {}

    /// Fetch funding snapshots via the given transport tier. `symbols=None`
    /// means the venue's whole USDT-perpetual universe. An empty result is
    /// reported as-is; the provider treats it as a failure (throttling).
    async fn fetch_funding(
        &self,
        transport: Transport,
        symbols: Option<&[String]>,
    ) -> EngineResult<Vec<FundingSnapshot>>;

    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64>;

    /// Max leverage for the symbol, `None` when the venue doesn't expose it.
    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>>;

    /// Base-asset quantity represented by one venue-native contract.
    /// 1.0 for venues that order directly in base asset.
    async fn contract_size(&self, symbol: &str) -> EngineResult<f64>;

    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()>;

    /// Precondition for order placement: a non-transient failure here means
    /// the surrounding order must not be placed.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Seam between the coordinator/provider and concrete adapters. The live
/// factory builds real venue clients; tests substitute scripted mocks.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        exchange: Exchange,
        credentials: Option<VenueCredentials>,
    ) -> Arc<dyn VenueAdapter>;
}

/// Production factory: one shared reqwest client, per-call deadlines from
/// settings.
pub struct LiveAdapterFactory {
    http: reqwest::Client,
    data_timeout: Duration,
    order_timeout: Duration,
    binance_unified_account: bool,
}

impl LiveAdapterFactory {
    pub fn new(settings: &Settings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.total_fetch_budget.max(settings.order_timeout))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            data_timeout: settings.data_timeout,
            order_timeout: settings.order_timeout,
            binance_unified_account: settings.binance_unified_account,
        }
    }
}

impl AdapterFactory for LiveAdapterFactory {
    fn create(
        &self,
        exchange: Exchange,
        credentials: Option<VenueCredentials>,
    ) -> Arc<dyn VenueAdapter> {
        let ctx = VenueContext {
            http: self.http.clone(),
            data_timeout: self.data_timeout,
            order_timeout: self.order_timeout,
            credentials,
        };
        match exchange {
            Exchange::Binance => Arc::new(
                binance::BinanceAdapter::new(ctx)
                    .with_unified_account(self.binance_unified_account),
            ),
            Exchange::Okx => Arc::new(okx::OkxAdapter::new(ctx)),
            Exchange::Bybit => Arc::new(bybit::BybitAdapter::new(ctx)),
            Exchange::Bitget => Arc::new(bitget::BitgetAdapter::new(ctx)),
            Exchange::Gate => Arc::new(gate::GateAdapter::new(ctx)),
        }
    }
}

/// Shared construction context for all concrete adapters.
#[derive(Clone)]
pub struct VenueContext {
    pub http: reqwest::Client,
    pub data_timeout: Duration,
    pub order_timeout: Duration,
    pub credentials: Option<VenueCredentials>,
}

impl VenueContext {
    /// Credentials or an `auth` error naming the venue.
    pub fn require_credentials(&self, exchange: Exchange) -> EngineResult<&VenueCredentials> {
        self.credentials.as_ref().ok_or_else(|| {
            EngineError::auth(format!("no credentials configured for {exchange}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP / parsing helpers
// ---------------------------------------------------------------------------

/// Map an HTTP status to the error taxonomy. 5xx and 429 are transient;
/// 401/403 are auth; 404 is not_supported; the rest of 4xx is validation.
pub(crate) fn http_error_kind(status: reqwest::StatusCode) -> ErrorKind {
    if status.is_server_error() || status.as_u16() == 429 {
        ErrorKind::Transient
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        ErrorKind::Auth
    } else if status.as_u16() == 404 {
        ErrorKind::NotSupported
    } else {
        ErrorKind::Validation
    }
}

/// GET a JSON document with a per-request deadline.
pub(crate) async fn get_json(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> EngineResult<serde_json::Value> {
    let resp = http.get(url).timeout(timeout).send().await?;
    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| EngineError::transient(format!("decoding response from {url}: {e}")))?;

    if !status.is_success() {
        return Err(EngineError::new(
            http_error_kind(status),
            format!("GET {url} returned {status}: {body}"),
        ));
    }
    Ok(body)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_f64(val: &serde_json::Value) -> EngineResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| EngineError::internal(format!("expected numeric string, got '{s}'")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(EngineError::internal(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Optional numeric field: missing, null, empty-string, or zero become None.
pub(crate) fn parse_opt_f64(val: &serde_json::Value) -> Option<f64> {
    match parse_f64(val) {
        Ok(v) if v != 0.0 => Some(v),
        _ => None,
    }
}

/// Millisecond epoch to UTC instant; invalid input maps to the epoch.
pub(crate) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

/// Current UNIX timestamp in milliseconds.
pub(crate) fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// Whether a unified symbol belongs to the USDT-perpetual universe.
pub(crate) fn is_usdt_symbol(symbol: &str) -> bool {
    symbol.ends_with("USDT") && symbol.len() > "USDT".len()
}

/// Next settlement instant for venues that publish only a cadence: funding
/// fires on whole-interval boundaries from UTC midnight (00:00, 08:00, 16:00
/// for the common 8h cadence).
pub(crate) fn next_funding_boundary(
    now: DateTime<Utc>,
    interval_hours: f64,
) -> DateTime<Utc> {
    let interval_secs = (interval_hours * 3600.0).max(3600.0) as i64;
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let elapsed = (now - day_start).num_seconds();
    day_start + chrono::Duration::seconds(((elapsed / interval_secs) + 1) * interval_secs)
}

// =============================================================================
// Tests
// =============================================================================
