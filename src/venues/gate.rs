// =============================================================================
// Gate.io USDT-futures adapter — HMAC-SHA512 signing, ws last-value tier
// =============================================================================
//
// Gate prices futures in contracts: one contract is `quanto_multiplier` of
// the base asset, and order size is a signed integer (negative = sell).
//
// Market-data fallback chain for this venue is library -> native REST -> ws:
// the ws tier reads a last-value cache fed by a background futures.tickers
// subscription started via `start_streams`. The cache only answers while its
// entries are fresh; an empty answer is a failure upstream.
//
// Signature string: "{method}\n{path}\n{query}\n{sha512_hex(body)}\n{ts}".
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::{Digest, Sha512};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, instrument, warn};

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::types::{Exchange, FundingSnapshot, Side, SourceTag};
use crate::venues::{
    get_json, http_error_kind, is_usdt_symbol, next_funding_boundary, parse_f64, parse_opt_f64,
    OrderAck, OrderPlacement, OrderRequest, Transport, VenueAdapter, VenueContext,
};

type HmacSha512 = Hmac<Sha512>;

const BASE_URL: &str = "https://api.gateio.ws";
const API_PREFIX: &str = "/api/v4";
const WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const DEFAULT_INTERVAL_HOURS: f64 = 8.0;

/// Ws ticks older than this are not served.
const WS_MAX_AGE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct ContractMeta {
    /// Base-asset value of one contract.
    quanto_multiplier: f64,
    funding_interval_hours: f64,
    max_leverage: Option<u32>,
}

/// Last value observed on the futures.tickers stream.
#[derive(Debug, Clone)]
struct WsTick {
    funding_rate: f64,
    mark_price: f64,
    seen_at: DateTime<Utc>,
}

pub struct GateAdapter {
    ctx: VenueContext,
    contracts: RwLock<HashMap<String, ContractMeta>>,
    ws_cache: Arc<RwLock<HashMap<String, WsTick>>>,
}

/// "BTCUSDT" -> "BTC_USDT".
fn contract_name(symbol: &str) -> String {
    let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
    format!("{base}_USDT")
}

/// "BTC_USDT" -> "BTCUSDT"; None for non-USDT contracts.
fn unified_symbol(contract: &str) -> Option<String> {
    let base = contract.strip_suffix("_USDT")?;
    if base.is_empty() {
        return None;
    }
    Some(format!("{base}USDT"))
}

/// Gate error labels -> taxonomy.
fn gate_error_kind(label: &str) -> ErrorKind {
    match label {
        "INVALID_KEY" | "INVALID_SIGNATURE" | "FORBIDDEN" | "MISSING_REQUIRED_HEADER" => {
            ErrorKind::Auth
        }
        "SERVER_ERROR" | "TOO_MANY_REQUESTS" => ErrorKind::Transient,
        "CONTRACT_NOT_FOUND" => ErrorKind::NotSupported,
        _ => ErrorKind::Validation,
    }
}

impl GateAdapter {
    pub fn new(ctx: VenueContext) -> Self {
        Self {
            ctx,
            contracts: RwLock::new(HashMap::new()),
            ws_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(
        secret: &str,
        method: &str,
        path: &str,
        query: &str,
        body: &str,
        timestamp: &str,
    ) -> String {
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let payload = format!("{method}\n{path}\n{query}\n{body_hash}\n{timestamp}");
        let mut mac =
            HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
        let creds = self.ctx.credentials.as_ref().expect("checked by caller");
        let timestamp = Utc::now().timestamp().to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = Self::sign(
            &creds.api_secret,
            method.as_str(),
            path,
            query,
            &body_str,
            &timestamp,
        );

        let url = if query.is_empty() {
            format!("{BASE_URL}{path}")
        } else {
            format!("{BASE_URL}{path}?{query}")
        };
        let mut req = self
            .ctx
            .http
            .request(method, url)
            .header("KEY", &creds.api_key)
            .header("Timestamp", timestamp)
            .header("SIGN", sig)
            .header("Content-Type", "application/json")
            .timeout(self.ctx.order_timeout);
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let parsed = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, parsed))
    }

    /// Fold HTTP and label-level failures into the taxonomy.
    fn check_response(
        status: reqwest::StatusCode,
        parsed: &serde_json::Value,
        what: &str,
    ) -> EngineResult<()> {
        if status.is_success() {
            return Ok(());
        }
        if let Some(label) = parsed["label"].as_str() {
            return Err(EngineError::new(
                gate_error_kind(label),
                format!(
                    "gate {what} rejected ({label}): {}",
                    parsed["message"].as_str().unwrap_or_default()
                ),
            ));
        }
        Err(EngineError::new(
            http_error_kind(status),
            format!("gate {what} returned {status}: {parsed}"),
        ))
    }

    // -------------------------------------------------------------------------
    // Contract metadata
    // -------------------------------------------------------------------------

    async fn fetch_contracts(&self) -> EngineResult<Vec<serde_json::Value>> {
        let url = format!("{BASE_URL}{API_PREFIX}/futures/usdt/contracts");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        body.as_array()
            .cloned()
            .ok_or_else(|| EngineError::internal("gate contracts response is not an array"))
    }

    fn cache_contract_meta(&self, entries: &[serde_json::Value]) {
        let mut cache = self.contracts.write();
        for entry in entries {
            let Some(symbol) = entry["name"].as_str().and_then(unified_symbol) else {
                continue;
            };
            let Some(quanto) = parse_opt_f64(&entry["quanto_multiplier"]) else {
                continue;
            };
            let funding_interval_hours = entry["funding_interval"]
                .as_i64()
                .map(|secs| secs as f64 / 3600.0)
                .filter(|h| *h > 0.0)
                .unwrap_or(DEFAULT_INTERVAL_HOURS);
            let max_leverage = parse_opt_f64(&entry["leverage_max"])
                .map(|l| l.floor() as u32)
                .filter(|l| *l > 0);
            cache.insert(
                symbol,
                ContractMeta {
                    quanto_multiplier: quanto,
                    funding_interval_hours,
                    max_leverage,
                },
            );
        }
    }

    async fn contract_meta(&self, symbol: &str) -> EngineResult<ContractMeta> {
        if let Some(meta) = self.contracts.read().get(symbol).copied() {
            return Ok(meta);
        }
        let entries = self.fetch_contracts().await?;
        self.cache_contract_meta(&entries);
        self.contracts.read().get(symbol).copied().ok_or_else(|| {
            EngineError::not_supported(format!("gate does not list {symbol} as a USDT future"))
        })
    }

    // -------------------------------------------------------------------------
    // Snapshot tiers
    // -------------------------------------------------------------------------

    /// Library tier: the contracts endpoint alone carries rate, cadence,
    /// settlement time, mark price, and leverage.
    fn snapshot_from_contract(&self, entry: &serde_json::Value) -> Option<FundingSnapshot> {
        if entry["in_delisting"].as_bool() == Some(true) {
            return None;
        }
        let symbol = entry["name"].as_str().and_then(unified_symbol)?;
        if !is_usdt_symbol(&symbol) {
            return None;
        }
        let mark_price = parse_f64(&entry["mark_price"]).ok()?;
        let funding_rate_raw = parse_f64(&entry["funding_rate"]).ok()?;
        let funding_interval_hours = entry["funding_interval"]
            .as_i64()
            .map(|secs| secs as f64 / 3600.0)
            .filter(|h| *h > 0.0)
            .unwrap_or(DEFAULT_INTERVAL_HOURS);
        let next_funding_time = entry["funding_next_apply"]
            .as_i64()
            .filter(|s| *s > 0)
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .unwrap_or_else(|| next_funding_boundary(Utc::now(), funding_interval_hours));

        Some(FundingSnapshot {
            exchange: Exchange::Gate,
            symbol,
            funding_rate_raw,
            funding_interval_hours,
            next_funding_time,
            mark_price,
            open_interest_usd: None,
            volume24h_usd: parse_opt_f64(&entry["volume_24h_quote"]),
            max_leverage: parse_opt_f64(&entry["leverage_max"])
                .map(|l| l.floor() as u32)
                .filter(|l| *l > 0),
            source_tag: SourceTag::Ccxt,
            fetched_at: Utc::now(),
        })
    }

    /// Rest tier: tickers carry rate and mark only; cadence falls back to the
    /// cached contract metadata or the 8h default.
    fn snapshot_from_ticker(&self, entry: &serde_json::Value) -> Option<FundingSnapshot> {
        let symbol = entry["contract"].as_str().and_then(unified_symbol)?;
        let mark_price = parse_f64(&entry["mark_price"]).ok()?;
        let funding_rate_raw = parse_f64(&entry["funding_rate"]).ok()?;
        let interval = self
            .contracts
            .read()
            .get(&symbol)
            .map(|m| m.funding_interval_hours)
            .unwrap_or(DEFAULT_INTERVAL_HOURS);

        Some(FundingSnapshot {
            exchange: Exchange::Gate,
            symbol,
            funding_rate_raw,
            funding_interval_hours: interval,
            next_funding_time: next_funding_boundary(Utc::now(), interval),
            mark_price,
            open_interest_usd: None,
            volume24h_usd: parse_opt_f64(&entry["volume_24h_quote"]),
            max_leverage: None,
            source_tag: SourceTag::Rest,
            fetched_at: Utc::now(),
        })
    }

    /// Ws tier: serve only ticks younger than [`WS_MAX_AGE_SECS`].
    fn snapshots_from_ws_cache(&self) -> Vec<FundingSnapshot> {
        let now = Utc::now();
        let contracts = self.contracts.read();
        self.ws_cache
            .read()
            .iter()
            .filter(|(_, tick)| (now - tick.seen_at).num_seconds() <= WS_MAX_AGE_SECS)
            .map(|(symbol, tick)| {
                let interval = contracts
                    .get(symbol)
                    .map(|m| m.funding_interval_hours)
                    .unwrap_or(DEFAULT_INTERVAL_HOURS);
                FundingSnapshot {
                    exchange: Exchange::Gate,
                    symbol: symbol.clone(),
                    funding_rate_raw: tick.funding_rate,
                    funding_interval_hours: interval,
                    next_funding_time: next_funding_boundary(now, interval),
                    mark_price: tick.mark_price,
                    open_interest_usd: None,
                    volume24h_usd: None,
                    max_leverage: contracts.get(symbol).and_then(|m| m.max_leverage),
                    source_tag: SourceTag::Ws,
                    fetched_at: tick.seen_at,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Ws feed
// ---------------------------------------------------------------------------

/// One connect-subscribe-read cycle of the futures.tickers stream.
async fn run_ticker_stream(
    http: &reqwest::Client,
    data_timeout: std::time::Duration,
    cache: &Arc<RwLock<HashMap<String, WsTick>>>,
) -> anyhow::Result<()> {
    // The subscribe frame wants explicit contract names.
    let url = format!("{BASE_URL}{API_PREFIX}/futures/usdt/contracts");
    let body = get_json(http, &url, data_timeout)
        .await
        .map_err(|e| anyhow::anyhow!("contract list for ws subscribe: {e}"))?;
    let contracts: Vec<String> = body
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e["name"].as_str())
                .filter(|n| n.ends_with("_USDT"))
                .map(|n| n.to_string())
                .collect()
        })
        .unwrap_or_default();
    if contracts.is_empty() {
        anyhow::bail!("no USDT contracts to subscribe");
    }

    let (mut stream, _) = tokio_tungstenite::connect_async(WS_URL).await?;
    let subscribe = serde_json::json!({
        "time": Utc::now().timestamp(),
        "channel": "futures.tickers",
        "event": "subscribe",
        "payload": contracts,
    });
    stream.send(Message::Text(subscribe.to_string())).await?;
    debug!(contracts = contracts.len(), "gate ws tickers subscribed");

    while let Some(msg) = stream.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        if parsed["channel"].as_str() != Some("futures.tickers")
            || parsed["event"].as_str() != Some("update")
        {
            continue;
        }
        let Some(results) = parsed["result"].as_array() else {
            continue;
        };
        let mut cache = cache.write();
        for tick in results {
            let Some(symbol) = tick["contract"].as_str().and_then(unified_symbol) else {
                continue;
            };
            let (Ok(rate), Ok(mark)) = (
                parse_f64(&tick["funding_rate"]),
                parse_f64(&tick["mark_price"]),
            ) else {
                continue;
            };
            cache.insert(
                symbol,
                WsTick {
                    funding_rate: rate,
                    mark_price: mark,
                    seen_at: Utc::now(),
                },
            );
        }
    }
    anyhow::bail!("gate ws stream closed")
}

#[async_trait]
impl VenueAdapter for GateAdapter {
    fn name(&self) -> Exchange {
        Exchange::Gate
    }

    fn transports(&self) -> &'static [Transport] {
        &[Transport::Library, Transport::Rest, Transport::Ws]
    }

    fn start_streams(self: Arc<Self>) {
        let cache = self.ws_cache.clone();
        let http = self.ctx.http.clone();
        let data_timeout = self.ctx.data_timeout;
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_ticker_stream(&http, data_timeout, &cache).await {
                    error!(error = %e, "gate ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    #[instrument(skip(self, symbols), name = "gate::fetch_funding")]
    async fn fetch_funding(
        &self,
        transport: Transport,
        symbols: Option<&[String]>,
    ) -> EngineResult<Vec<FundingSnapshot>> {
        let snapshots: Vec<FundingSnapshot> = match transport {
            Transport::Library => {
                let entries = self.fetch_contracts().await?;
                self.cache_contract_meta(&entries);
                entries
                    .iter()
                    .filter_map(|e| self.snapshot_from_contract(e))
                    .collect()
            }
            Transport::Rest => {
                let url = format!("{BASE_URL}{API_PREFIX}/futures/usdt/tickers");
                let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
                let arr = body
                    .as_array()
                    .ok_or_else(|| EngineError::internal("gate tickers response is not an array"))?;
                arr.iter()
                    .filter_map(|e| self.snapshot_from_ticker(e))
                    .collect()
            }
            Transport::Ws => self.snapshots_from_ws_cache(),
        };

        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(|x| x.as_str()).collect());
        let snapshots: Vec<FundingSnapshot> = snapshots
            .into_iter()
            .filter(|s| {
                wanted
                    .as_ref()
                    .map_or(true, |w| w.contains(s.symbol.as_str()))
            })
            .collect();

        debug!(count = snapshots.len(), ?transport, "gate funding fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "gate::fetch_mark_price")]
    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{BASE_URL}{API_PREFIX}/futures/usdt/contracts/{}",
            contract_name(symbol)
        );
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        parse_f64(&body["mark_price"])
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>> {
        Ok(self.contract_meta(symbol).await?.max_leverage)
    }

    async fn contract_size(&self, symbol: &str) -> EngineResult<f64> {
        Ok(self.contract_meta(symbol).await?.quanto_multiplier)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "gate::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement> {
        self.ctx.require_credentials(Exchange::Gate)?;
        let meta = self.contract_meta(&req.symbol).await?;
        let contracts = (req.quantity_base / meta.quanto_multiplier).round() as i64;
        if contracts <= 0 {
            return Err(EngineError::validation(format!(
                "quantity {} below one gate contract ({} base)",
                req.quantity_base, meta.quanto_multiplier
            )));
        }
        let size = match req.side {
            Side::Buy => contracts,
            Side::Sell => -contracts,
        };

        let path = format!("{API_PREFIX}/futures/usdt/orders");
        let body = serde_json::json!({
            "contract": contract_name(&req.symbol),
            "size": size,
            "price": "0",
            "tif": "ioc",
            "reduce_only": req.reduce_only,
        });

        let sent = self
            .send_signed(reqwest::Method::POST, &path, "", Some(&body))
            .await;
        let (status, parsed) = match sent {
            Ok(sb) => sb,
            Err(e) if e.is_timeout() => {
                warn!(symbol = %req.symbol, "gate order deadline elapsed; marking pending");
                return Ok(OrderPlacement::Pending(OrderAck {
                    note: Some("order timed out in flight; reconcile against venue".to_string()),
                    ..OrderAck::default()
                }));
            }
            Err(e) => return Err(e.into()),
        };
        Self::check_response(status, &parsed, "order")?;

        // Fill size comes back in contracts; report base asset.
        let requested = parsed["size"].as_i64().unwrap_or(size).unsigned_abs();
        let left = parsed["left"].as_i64().unwrap_or(0).unsigned_abs();
        let filled_contracts = requested.saturating_sub(left);
        Ok(OrderPlacement::Acked(OrderAck {
            exchange_order_id: parsed["id"].as_i64().map(|id| id.to_string()),
            filled_qty_base: Some(filled_contracts as f64 * meta.quanto_multiplier),
            avg_price: parse_opt_f64(&parsed["fill_price"]),
            note: None,
        }))
    }

    #[instrument(skip(self), name = "gate::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> EngineResult<()> {
        self.ctx.require_credentials(Exchange::Gate)?;
        let path = format!("{API_PREFIX}/futures/usdt/orders/{order_id}");
        let (status, parsed) = self
            .send_signed(reqwest::Method::DELETE, &path, "", None)
            .await
            .map_err(EngineError::from)?;
        Self::check_response(status, &parsed, "cancel")
    }

    #[instrument(skip(self), name = "gate::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        self.ctx.require_credentials(Exchange::Gate)?;
        let path = format!(
            "{API_PREFIX}/futures/usdt/positions/{}/leverage",
            contract_name(symbol)
        );
        let query = format!("leverage={leverage}");
        let (status, parsed) = self
            .send_signed(reqwest::Method::POST, &path, &query, None)
            .await
            .map_err(EngineError::from)?;
        Self::check_response(status, &parsed, "set_leverage")?;
        debug!(symbol, leverage, "gate leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for GateAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateAdapter")
            .field("credentials", &self.ctx.credentials.is_some())
            .field("ws_cache_entries", &self.ws_cache.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn adapter() -> GateAdapter {
        GateAdapter::new(VenueContext {
            http: reqwest::Client::new(),
            data_timeout: Duration::from_secs(5),
            order_timeout: Duration::from_secs(10),
            credentials: None,
        })
    }

    #[test]
    fn symbol_mapping_roundtrip() {
        assert_eq!(contract_name("BTCUSDT"), "BTC_USDT");
        assert_eq!(unified_symbol("BTC_USDT").as_deref(), Some("BTCUSDT"));
        assert_eq!(unified_symbol("BTC_USD"), None);
    }

    #[test]
    fn error_label_taxonomy() {
        assert_eq!(gate_error_kind("INVALID_SIGNATURE"), ErrorKind::Auth);
        assert_eq!(gate_error_kind("SERVER_ERROR"), ErrorKind::Transient);
        assert_eq!(gate_error_kind("CONTRACT_NOT_FOUND"), ErrorKind::NotSupported);
        assert_eq!(gate_error_kind("INVALID_PARAM_VALUE"), ErrorKind::Validation);
    }

    #[test]
    fn signature_binds_body_hash() {
        let a = GateAdapter::sign("sec", "POST", "/api/v4/futures/usdt/orders", "", "{}", "1717228800");
        let b = GateAdapter::sign("sec", "POST", "/api/v4/futures/usdt/orders", "", "{}", "1717228800");
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        let c = GateAdapter::sign("sec", "POST", "/api/v4/futures/usdt/orders", "", "{\"x\":1}", "1717228800");
        assert_ne!(a, c);
    }

    #[test]
    fn contract_snapshot_carries_full_metadata() {
        let a = adapter();
        let entry = serde_json::json!({
            "name": "BTC_USDT",
            "funding_rate": "0.0001",
            "funding_interval": 28800,
            "funding_next_apply": 1717228800i64,
            "mark_price": "64000.5",
            "leverage_max": "100",
            "quanto_multiplier": "0.0001",
            "volume_24h_quote": "1200000000",
            "in_delisting": false
        });
        let snap = a.snapshot_from_contract(&entry).unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.funding_interval_hours, 8.0);
        assert_eq!(snap.max_leverage, Some(100));
        assert_eq!(snap.source_tag, SourceTag::Ccxt);
        assert_eq!(
            snap.next_funding_time,
            Utc.timestamp_opt(1717228800, 0).unwrap()
        );
    }

    #[test]
    fn delisting_contracts_are_skipped() {
        let a = adapter();
        let entry = serde_json::json!({
            "name": "XYZ_USDT",
            "funding_rate": "0.0001",
            "mark_price": "1.0",
            "quanto_multiplier": "1",
            "in_delisting": true
        });
        assert!(a.snapshot_from_contract(&entry).is_none());
    }

    #[test]
    fn ws_cache_serves_only_fresh_ticks() {
        let a = adapter();
        a.ws_cache.write().insert(
            "BTCUSDT".to_string(),
            WsTick {
                funding_rate: 0.0002,
                mark_price: 64000.0,
                seen_at: Utc::now(),
            },
        );
        a.ws_cache.write().insert(
            "ETHUSDT".to_string(),
            WsTick {
                funding_rate: 0.0001,
                mark_price: 3200.0,
                seen_at: Utc::now() - chrono::Duration::seconds(WS_MAX_AGE_SECS + 10),
            },
        );

        let snaps = a.snapshots_from_ws_cache();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].symbol, "BTCUSDT");
        assert_eq!(snaps[0].source_tag, SourceTag::Ws);
    }
}
