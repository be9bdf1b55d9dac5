// =============================================================================
// Binance USDT-perpetual adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// Routing: every order and set_leverage call carries the unified-account flag
// as its primary routing hint. Unified (portfolio-margin) accounts go through
// the /papi/v1/um/* paths, classic futures accounts through /fapi/v1/*.
//
// Quirk: error code -4061 (position side mismatch) is retried once with
// positionSide=BOTH; the retry leaves a diagnostic note on the order ack and
// emits no risk event.
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{Exchange, FundingSnapshot, Side, SourceTag};
use crate::venues::{
    get_json, http_error_kind, is_usdt_symbol, ms_to_datetime, parse_f64, parse_opt_f64,
    timestamp_ms, OrderAck, OrderPlacement, OrderRequest, Transport, VenueAdapter, VenueContext,
};

type HmacSha256 = Hmac<Sha256>;

const FAPI_BASE: &str = "https://fapi.binance.com";
const PAPI_BASE: &str = "https://papi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance error code for a position-side mismatch on hedge-mode accounts.
const CODE_POSITION_SIDE_MISMATCH: i64 = -4061;

/// Funding settles every 8 hours unless fundingInfo says otherwise.
const DEFAULT_INTERVAL_HOURS: f64 = 8.0;

pub struct BinanceAdapter {
    ctx: VenueContext,
    /// Portfolio-margin routing hint; applied to orders and set_leverage.
    unified_account: bool,
    /// Symbol -> funding interval hours, from /fapi/v1/fundingInfo.
    interval_cache: RwLock<HashMap<String, f64>>,
    /// Symbol -> max leverage, from the public leverage-brackets endpoint.
    leverage_cache: RwLock<HashMap<String, u32>>,
}

impl BinanceAdapter {
    pub fn new(ctx: VenueContext) -> Self {
        Self {
            ctx,
            unified_account: false,
            interval_cache: RwLock::new(HashMap::new()),
            leverage_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Route orders and leverage calls through the portfolio-margin paths.
    pub fn with_unified_account(mut self, unified: bool) -> Self {
        self.unified_account = unified;
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append timestamp, recvWindow, and signature to a query string.
    fn signed_query(&self, secret: &str, params: &str) -> String {
        let ts = timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(secret, &base);
        format!("{base}&signature={sig}")
    }

    fn data_base(&self) -> &'static str {
        if self.ctx.credentials.as_ref().is_some_and(|c| c.testnet) {
            TESTNET_BASE
        } else {
            FAPI_BASE
        }
    }

    /// Base + path for trading calls, honouring the unified-account hint.
    fn order_endpoint(&self) -> (String, &'static str) {
        if self.unified_account {
            (PAPI_BASE.to_string(), "/papi/v1/um/order")
        } else {
            (self.data_base().to_string(), "/fapi/v1/order")
        }
    }

    fn leverage_endpoint(&self) -> (String, &'static str) {
        if self.unified_account {
            (PAPI_BASE.to_string(), "/papi/v1/um/leverage")
        } else {
            (self.data_base().to_string(), "/fapi/v1/leverage")
        }
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        params: &str,
        timeout: std::time::Duration,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
        let creds = self.ctx.credentials.as_ref().expect("checked by caller");
        let qs = self.signed_query(&creds.api_secret, params);
        let url = format!("{base}{path}?{qs}");

        let resp = self
            .ctx
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    // -------------------------------------------------------------------------
    // Funding metadata
    // -------------------------------------------------------------------------

    /// Refresh the symbol -> interval-hours map. Best effort: symbols absent
    /// from fundingInfo settle on the 8h default.
    async fn refresh_intervals(&self) {
        let url = format!("{}/fapi/v1/fundingInfo", self.data_base());
        match get_json(&self.ctx.http, &url, self.ctx.data_timeout).await {
            Ok(body) => {
                if let Some(arr) = body.as_array() {
                    let mut cache = self.interval_cache.write();
                    for entry in arr {
                        let symbol = entry["symbol"].as_str().unwrap_or_default();
                        if let Ok(hours) = parse_f64(&entry["fundingIntervalHours"]) {
                            cache.insert(symbol.to_string(), hours);
                        }
                    }
                }
            }
            Err(e) => debug!(error = %e, "fundingInfo refresh failed; using 8h default"),
        }
    }

    /// Populate the leverage cache from the public leverage-brackets endpoint.
    /// This is preferred over any signed probe; failures leave the cache as-is.
    async fn refresh_leverage_brackets(&self) {
        let url = format!("{}/fapi/v1/leverageBracket", self.data_base());
        match get_json(&self.ctx.http, &url, self.ctx.data_timeout).await {
            Ok(body) => {
                if let Some(arr) = body.as_array() {
                    let mut cache = self.leverage_cache.write();
                    for entry in arr {
                        let symbol = entry["symbol"].as_str().unwrap_or_default();
                        let top = entry["brackets"]
                            .as_array()
                            .and_then(|b| b.first())
                            .and_then(|b| b["initialLeverage"].as_u64());
                        if let Some(lev) = top {
                            cache.insert(symbol.to_string(), lev as u32);
                        }
                    }
                }
            }
            Err(e) => debug!(error = %e, "public leverage brackets unavailable"),
        }
    }

    fn snapshot_from_premium_index(
        &self,
        entry: &serde_json::Value,
        source_tag: SourceTag,
        with_leverage: bool,
    ) -> Option<FundingSnapshot> {
        let symbol = entry["symbol"].as_str()?.to_uppercase();
        if !is_usdt_symbol(&symbol) {
            return None;
        }
        let mark_price = parse_f64(&entry["markPrice"]).ok()?;
        let funding_rate_raw = parse_f64(&entry["lastFundingRate"]).ok()?;
        let next_funding_time = ms_to_datetime(entry["nextFundingTime"].as_i64().unwrap_or(0));

        let funding_interval_hours = self
            .interval_cache
            .read()
            .get(&symbol)
            .copied()
            .unwrap_or(DEFAULT_INTERVAL_HOURS);
        let max_leverage = if with_leverage {
            self.leverage_cache.read().get(&symbol).copied()
        } else {
            None
        };

        Some(FundingSnapshot {
            exchange: Exchange::Binance,
            symbol,
            funding_rate_raw,
            funding_interval_hours,
            next_funding_time,
            mark_price,
            open_interest_usd: None,
            volume24h_usd: parse_opt_f64(&entry["quoteVolume"]),
            max_leverage,
            source_tag,
            fetched_at: Utc::now(),
        })
    }
}

/// Whether an order-endpoint error body is the -4061 position-side mismatch.
fn is_position_side_mismatch(body: &serde_json::Value) -> bool {
    body["code"].as_i64() == Some(CODE_POSITION_SIDE_MISMATCH)
}

/// Convert an acknowledged order body to an ack (quantities already base).
fn parse_order_ack(body: &serde_json::Value, note: Option<String>) -> OrderAck {
    OrderAck {
        exchange_order_id: body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(|s| s.to_string())),
        filled_qty_base: parse_opt_f64(&body["executedQty"]),
        avg_price: parse_opt_f64(&body["avgPrice"]),
        note,
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn name(&self) -> Exchange {
        Exchange::Binance
    }

    fn transports(&self) -> &'static [Transport] {
        &[Transport::Library, Transport::Rest]
    }

    #[instrument(skip(self, symbols), name = "binance::fetch_funding")]
    async fn fetch_funding(
        &self,
        transport: Transport,
        symbols: Option<&[String]>,
    ) -> EngineResult<Vec<FundingSnapshot>> {
        let (source_tag, with_metadata) = match transport {
            // Library tier: batch premium index enriched with interval and
            // leverage metadata.
            Transport::Library => (SourceTag::Ccxt, true),
            // Bare REST tier: premium index only, 8h default interval.
            Transport::Rest => (SourceTag::Rest, false),
            Transport::Ws => {
                return Err(EngineError::not_supported(
                    "binance adapter has no ws funding tier",
                ))
            }
        };

        if with_metadata {
            self.refresh_intervals().await;
            self.refresh_leverage_brackets().await;
        }

        let url = format!("{}/fapi/v1/premiumIndex", self.data_base());
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let arr = body
            .as_array()
            .ok_or_else(|| EngineError::internal("premiumIndex response is not an array"))?;

        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(|x| x.as_str()).collect());

        let snapshots: Vec<FundingSnapshot> = arr
            .iter()
            .filter_map(|e| self.snapshot_from_premium_index(e, source_tag, with_metadata))
            .filter(|s| {
                wanted
                    .as_ref()
                    .map_or(true, |w| w.contains(s.symbol.as_str()))
            })
            .collect();

        debug!(count = snapshots.len(), ?transport, "binance funding fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "binance::fetch_mark_price")]
    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={symbol}", self.data_base());
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        parse_f64(&body["markPrice"])
    }

    #[instrument(skip(self), name = "binance::fetch_max_leverage")]
    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>> {
        if let Some(lev) = self.leverage_cache.read().get(symbol).copied() {
            return Ok(Some(lev));
        }
        // Public brackets first; a signed probe is only attempted when the
        // public endpoint gave nothing and credentials exist.
        self.refresh_leverage_brackets().await;
        if let Some(lev) = self.leverage_cache.read().get(symbol).copied() {
            return Ok(Some(lev));
        }

        if self.ctx.credentials.is_none() {
            return Ok(None);
        }
        let (status, body) = self
            .send_signed(
                reqwest::Method::GET,
                self.data_base(),
                "/fapi/v1/leverageBracket",
                &format!("symbol={symbol}"),
                self.ctx.data_timeout,
            )
            .await
            .map_err(EngineError::from)?;
        if !status.is_success() {
            warn!(%symbol, %status, "signed leverage bracket probe failed");
            return Ok(None);
        }
        let lev = body
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|e| e["brackets"].as_array())
            .and_then(|b| b.first())
            .and_then(|b| b["initialLeverage"].as_u64())
            .map(|l| l as u32);
        if let Some(l) = lev {
            self.leverage_cache.write().insert(symbol.to_string(), l);
        }
        Ok(lev)
    }

    async fn contract_size(&self, _symbol: &str) -> EngineResult<f64> {
        // Binance USDT perpetuals order directly in base asset.
        Ok(1.0)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "binance::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement> {
        self.ctx.require_credentials(Exchange::Binance)?;
        let (base, path) = self.order_endpoint();

        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = format!(
            "symbol={}&side={side}&type=MARKET&quantity={}",
            req.symbol, req.quantity_base
        );
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let first = self
            .send_signed(
                reqwest::Method::POST,
                &base,
                path,
                &params,
                self.ctx.order_timeout,
            )
            .await;

        let (status, body) = match first {
            Ok(sb) => sb,
            Err(e) if e.is_timeout() => {
                warn!(symbol = %req.symbol, "order deadline elapsed; marking pending");
                return Ok(OrderPlacement::Pending(OrderAck {
                    note: Some("order timed out in flight; reconcile against venue".to_string()),
                    ..OrderAck::default()
                }));
            }
            Err(e) => return Err(e.into()),
        };

        if status.is_success() {
            return Ok(OrderPlacement::Acked(parse_order_ack(&body, None)));
        }

        // Quirk: retry exactly once with positionSide=BOTH on -4061.
        if is_position_side_mismatch(&body) {
            debug!(symbol = %req.symbol, "-4061 received; retrying with positionSide=BOTH");
            let retry_params = format!("{params}&positionSide=BOTH");
            let (status2, body2) = self
                .send_signed(
                    reqwest::Method::POST,
                    &base,
                    path,
                    &retry_params,
                    self.ctx.order_timeout,
                )
                .await
                .map_err(EngineError::from)?;
            if status2.is_success() {
                let note = Some("retried with positionSide=BOTH after -4061".to_string());
                return Ok(OrderPlacement::Acked(parse_order_ack(&body2, note)));
            }
            return Err(EngineError::new(
                http_error_kind(status2),
                format!("binance order failed after -4061 retry: {body2}"),
            ));
        }

        Err(EngineError::new(
            http_error_kind(status),
            format!("binance order returned {status}: {body}"),
        ))
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        self.ctx.require_credentials(Exchange::Binance)?;
        let (base, path) = self.order_endpoint();
        let params = format!("symbol={symbol}&orderId={order_id}");
        let (status, body) = self
            .send_signed(
                reqwest::Method::DELETE,
                &base,
                path,
                &params,
                self.ctx.order_timeout,
            )
            .await
            .map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::new(
                http_error_kind(status),
                format!("binance cancel returned {status}: {body}"),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        self.ctx.require_credentials(Exchange::Binance)?;
        let (base, path) = self.leverage_endpoint();
        let params = format!("symbol={symbol}&leverage={leverage}");
        let (status, body) = self
            .send_signed(
                reqwest::Method::POST,
                &base,
                path,
                &params,
                self.ctx.order_timeout,
            )
            .await
            .map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::new(
                http_error_kind(status),
                format!("binance set_leverage returned {status}: {body}"),
            ));
        }
        debug!(symbol, leverage, "binance leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("unified_account", &self.unified_account)
            .field("credentials", &self.ctx.credentials.is_some())
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

    fn test_ctx(creds: bool) -> VenueContext {
        VenueContext {
            http: reqwest::Client::new(),
            data_timeout: Duration::from_secs(5),
            order_timeout: Duration::from_secs(10),
            credentials: creds.then(|| crate::venues::VenueCredentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: None,
                testnet: false,
            }),
        }
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let adapter = BinanceAdapter::new(test_ctx(true));
        let sig = adapter.sign("secret", "symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, adapter.sign("secret", "symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, adapter.sign("other", "symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn unified_account_routes_to_papi() {
        let classic = BinanceAdapter::new(test_ctx(true));
        let unified = BinanceAdapter::new(test_ctx(true)).with_unified_account(true);

        assert_eq!(classic.order_endpoint().1, "/fapi/v1/order");
        let (base, path) = unified.order_endpoint();
        assert_eq!(base, PAPI_BASE);
        assert_eq!(path, "/papi/v1/um/order");
        assert_eq!(unified.leverage_endpoint().1, "/papi/v1/um/leverage");
    }

    #[test]
    fn position_side_mismatch_detection() {
        assert!(is_position_side_mismatch(&serde_json::json!({
            "code": -4061, "msg": "Order's position side does not match user's setting."
        })));
        assert!(!is_position_side_mismatch(&serde_json::json!({
            "code": -1102, "msg": "Mandatory parameter missing"
        })));
        assert!(!is_position_side_mismatch(&serde_json::json!({"orderId": 1})));
    }

    #[test]
    fn order_ack_parses_fills() {
        let body = serde_json::json!({
            "orderId": 283194203u64,
            "executedQty": "0.010",
            "avgPrice": "64250.10"
        });
        let ack = parse_order_ack(&body, Some("n".into()));
        assert_eq!(ack.exchange_order_id.as_deref(), Some("283194203"));
        assert_eq!(ack.filled_qty_base, Some(0.010));
        assert_eq!(ack.avg_price, Some(64250.10));
        assert_eq!(ack.note.as_deref(), Some("n"));
    }

    #[test]
    fn premium_index_snapshot_filters_non_usdt() {
        let adapter = BinanceAdapter::new(test_ctx(false));
        let entry = serde_json::json!({
            "symbol": "BTCUSD_PERP",
            "markPrice": "64000",
            "lastFundingRate": "0.0001",
            "nextFundingTime": 1717228800000i64
        });
        assert!(adapter
            .snapshot_from_premium_index(&entry, SourceTag::Ccxt, false)
            .is_none());

        let entry = serde_json::json!({
            "symbol": "BTCUSDT",
            "markPrice": "64000",
            "lastFundingRate": "0.0001",
            "nextFundingTime": 1717228800000i64
        });
        let snap = adapter
            .snapshot_from_premium_index(&entry, SourceTag::Rest, false)
            .unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.funding_interval_hours, DEFAULT_INTERVAL_HOURS);
        assert_eq!(snap.source_tag, SourceTag::Rest);
        assert!(snap.max_leverage.is_none());
    }

    #[test]
    fn cached_interval_overrides_default() {
        let adapter = BinanceAdapter::new(test_ctx(false));
        adapter
            .interval_cache
            .write()
            .insert("SOLUSDT".to_string(), 4.0);
        let entry = serde_json::json!({
            "symbol": "SOLUSDT",
            "markPrice": "150.5",
            "lastFundingRate": "-0.0002",
            "nextFundingTime": 1717228800000i64
        });
        let snap = adapter
            .snapshot_from_premium_index(&entry, SourceTag::Ccxt, false)
            .unwrap();
        assert_eq!(snap.funding_interval_hours, 4.0);
    }
}
