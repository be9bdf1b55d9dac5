// =============================================================================
// OKX USDT-perpetual adapter — base64 HMAC-SHA256 header signing
// =============================================================================
//
// OKX prices swaps in contracts: one contract is `ctVal` of the base asset.
// Orders cross this adapter in base-asset units and are converted both ways.
//
// Quirk: orders default posSide to long/short matching the leg's intent.
// A parameter-error response (51xxx) is retried once with posSide=net,
// appending reduceOnly=true when the request closes a position.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::types::{Exchange, FundingSnapshot, Side, SourceTag};
use crate::venues::{
    get_json, is_usdt_symbol, ms_to_datetime, parse_f64, parse_opt_f64, OrderAck, OrderPlacement,
    OrderRequest, Transport, VenueAdapter, VenueContext,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";
const DEFAULT_INTERVAL_HOURS: f64 = 8.0;

/// Per-symbol instrument metadata from /api/v5/public/instruments.
#[derive(Debug, Clone, Copy)]
struct InstrumentMeta {
    /// Base-asset value of one contract.
    ct_val: f64,
    max_leverage: Option<u32>,
}

pub struct OkxAdapter {
    ctx: VenueContext,
    /// Unified symbol -> instrument metadata, filled lazily.
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
}

/// "BTCUSDT" -> "BTC-USDT-SWAP".
fn inst_id(symbol: &str) -> String {
    let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
    format!("{base}-USDT-SWAP")
}

/// "BTC-USDT-SWAP" -> "BTCUSDT"; None for non-USDT-swap instruments.
fn unified_symbol(inst: &str) -> Option<String> {
    let base = inst.strip_suffix("-USDT-SWAP")?;
    if base.is_empty() {
        return None;
    }
    Some(format!("{base}USDT"))
}

/// OKX business-error code -> taxonomy. 51xxx are request-parameter errors,
/// 501xx are auth failures, 50011 is the rate limiter.
fn okx_error_kind(code: &str) -> ErrorKind {
    if code == "50011" {
        ErrorKind::Transient
    } else if code.starts_with("501") {
        ErrorKind::Auth
    } else if code.starts_with("51") {
        ErrorKind::Validation
    } else {
        ErrorKind::Internal
    }
}

fn is_param_error(code: &str) -> bool {
    code.starts_with("51")
}

impl OkxAdapter {
    pub fn new(ctx: VenueContext) -> Self {
        Self {
            ctx,
            instruments: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(timestamp + method + path + body)).
    fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Send a signed request. Transport failures surface as `reqwest::Error`
    /// so order placement can distinguish an in-flight timeout.
    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
        let creds = self.ctx.credentials.as_ref().expect("checked by caller");
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = Self::sign(
            &creds.api_secret,
            &timestamp,
            method.as_str(),
            path,
            &body_str,
        );

        let mut req = self
            .ctx
            .http
            .request(method, format!("{BASE_URL}{path}"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.as_deref().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .timeout(self.ctx.order_timeout);
        if creds.testnet {
            req = req.header("x-simulated-trading", "1");
        }
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let parsed = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, parsed))
    }

    /// Signed call for non-order operations: transport errors map straight
    /// into the taxonomy and HTTP-level failures are folded in.
    async fn call_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        self.ctx.require_credentials(Exchange::Okx)?;
        let (status, parsed) = self
            .send_signed(method, path, body)
            .await
            .map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::new(
                crate::venues::http_error_kind(status),
                format!("okx {path} returned {status}: {parsed}"),
            ));
        }
        Ok(parsed)
    }

    // -------------------------------------------------------------------------
    // Instrument metadata
    // -------------------------------------------------------------------------

    async fn refresh_instruments(&self) -> EngineResult<()> {
        let url = format!("{BASE_URL}/api/v5/public/instruments?instType=SWAP");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::internal("okx instruments: missing data array"))?;

        let mut cache = self.instruments.write();
        for entry in data {
            let Some(symbol) = entry["instId"].as_str().and_then(unified_symbol) else {
                continue;
            };
            let Ok(ct_val) = parse_f64(&entry["ctVal"]) else {
                continue;
            };
            let max_leverage = parse_opt_f64(&entry["lever"]).map(|l| l as u32);
            cache.insert(
                symbol,
                InstrumentMeta {
                    ct_val,
                    max_leverage,
                },
            );
        }
        debug!(count = cache.len(), "okx instruments refreshed");
        Ok(())
    }

    async fn instrument_meta(&self, symbol: &str) -> EngineResult<InstrumentMeta> {
        if let Some(meta) = self.instruments.read().get(symbol).copied() {
            return Ok(meta);
        }
        self.refresh_instruments().await?;
        self.instruments
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| {
                EngineError::not_supported(format!("okx does not list {symbol} as a USDT swap"))
            })
    }

    /// Batch mark prices, unified-symbol keyed.
    async fn mark_prices(&self) -> EngineResult<HashMap<String, f64>> {
        let url = format!("{BASE_URL}/api/v5/public/mark-price?instType=SWAP");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::internal("okx mark-price: missing data array"))?;
        let mut out = HashMap::new();
        for entry in data {
            if let (Some(symbol), Ok(px)) = (
                entry["instId"].as_str().and_then(unified_symbol),
                parse_f64(&entry["markPx"]),
            ) {
                out.insert(symbol, px);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl VenueAdapter for OkxAdapter {
    fn name(&self) -> Exchange {
        Exchange::Okx
    }

    fn transports(&self) -> &'static [Transport] {
        &[Transport::Library, Transport::Rest]
    }

    #[instrument(skip(self, symbols), name = "okx::fetch_funding")]
    async fn fetch_funding(
        &self,
        transport: Transport,
        symbols: Option<&[String]>,
    ) -> EngineResult<Vec<FundingSnapshot>> {
        let (source_tag, with_leverage) = match transport {
            Transport::Library => (SourceTag::Ccxt, true),
            Transport::Rest => (SourceTag::Rest, false),
            Transport::Ws => {
                return Err(EngineError::not_supported(
                    "okx adapter has no ws funding tier",
                ))
            }
        };

        if with_leverage {
            // Instrument metadata failures degrade to rate-only snapshots.
            if let Err(e) = self.refresh_instruments().await {
                warn!(error = %e, "okx instruments refresh failed");
            }
        }

        let url = format!("{BASE_URL}/api/v5/public/funding-rate?instId=ANY");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::internal("okx funding-rate: missing data array"))?;

        let marks = self.mark_prices().await?;
        let instruments = self.instruments.read();
        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(|x| x.as_str()).collect());

        let mut snapshots = Vec::new();
        for entry in data {
            let Some(symbol) = entry["instId"].as_str().and_then(unified_symbol) else {
                continue;
            };
            if !is_usdt_symbol(&symbol) {
                continue;
            }
            if let Some(w) = &wanted {
                if !w.contains(symbol.as_str()) {
                    continue;
                }
            }
            let Ok(funding_rate_raw) = parse_f64(&entry["fundingRate"]) else {
                continue;
            };
            let Some(&mark_price) = marks.get(&symbol) else {
                continue;
            };

            // fundingTime is the upcoming settlement; the gap to the one
            // after it reveals the cadence.
            let funding_time = entry["fundingTime"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let next_after = entry["nextFundingTime"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let funding_interval_hours = if next_after > funding_time && funding_time > 0 {
                ((next_after - funding_time) as f64 / 3_600_000.0).round().max(1.0)
            } else {
                DEFAULT_INTERVAL_HOURS
            };

            let max_leverage = if with_leverage {
                instruments.get(&symbol).and_then(|m| m.max_leverage)
            } else {
                None
            };

            snapshots.push(FundingSnapshot {
                exchange: Exchange::Okx,
                symbol,
                funding_rate_raw,
                funding_interval_hours,
                next_funding_time: ms_to_datetime(funding_time),
                mark_price,
                open_interest_usd: None,
                volume24h_usd: None,
                max_leverage,
                source_tag,
                fetched_at: Utc::now(),
            });
        }

        debug!(count = snapshots.len(), ?transport, "okx funding fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "okx::fetch_mark_price")]
    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{BASE_URL}/api/v5/public/mark-price?instId={}",
            inst_id(symbol)
        );
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let px = body["data"]
            .as_array()
            .and_then(|d| d.first())
            .map(|e| parse_f64(&e["markPx"]))
            .transpose()?;
        px.ok_or_else(|| EngineError::not_supported(format!("okx has no mark price for {symbol}")))
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>> {
        Ok(self.instrument_meta(symbol).await?.max_leverage)
    }

    async fn contract_size(&self, symbol: &str) -> EngineResult<f64> {
        Ok(self.instrument_meta(symbol).await?.ct_val)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "okx::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement> {
        let meta = self.instrument_meta(&req.symbol).await?;
        let contracts = req.quantity_base / meta.ct_val;
        if contracts <= 0.0 {
            return Err(EngineError::validation(format!(
                "quantity {} below one okx contract ({} base)",
                req.quantity_base, meta.ct_val
            )));
        }

        // First attempt: posSide matches the leg's intent.
        let pos_side = if req.position_is_long() { "long" } else { "short" };
        let body = serde_json::json!({
            "instId": inst_id(&req.symbol),
            "tdMode": "cross",
            "side": match req.side { Side::Buy => "buy", Side::Sell => "sell" },
            "ordType": "market",
            "sz": contracts.to_string(),
            "posSide": pos_side,
        });

        self.ctx.require_credentials(Exchange::Okx)?;
        let first = self
            .send_signed(reqwest::Method::POST, "/api/v5/trade/order", Some(&body))
            .await;
        let (status, parsed) = match first {
            Ok(sb) => sb,
            Err(e) if e.is_timeout() => {
                warn!(symbol = %req.symbol, "okx order deadline elapsed; marking pending");
                return Ok(OrderPlacement::Pending(OrderAck {
                    note: Some("order timed out in flight; reconcile against venue".to_string()),
                    ..OrderAck::default()
                }));
            }
            Err(e) => return Err(e.into()),
        };
        if !status.is_success() {
            return Err(EngineError::new(
                crate::venues::http_error_kind(status),
                format!("okx order returned {status}: {parsed}"),
            ));
        }

        let (code, detail) = okx_result_code(&parsed);
        if code == "0" {
            return Ok(OrderPlacement::Acked(parse_okx_ack(&parsed, meta.ct_val, None)));
        }

        if is_param_error(&code) {
            // Quirk retry: net position mode, reduceOnly when closing.
            debug!(symbol = %req.symbol, code, "okx parameter error; retrying with posSide=net");
            let mut retry = body.clone();
            retry["posSide"] = serde_json::json!("net");
            if req.reduce_only {
                retry["reduceOnly"] = serde_json::json!(true);
            }
            let parsed2 = self
                .call_signed(reqwest::Method::POST, "/api/v5/trade/order", Some(&retry))
                .await?;
            let (code2, detail2) = okx_result_code(&parsed2);
            if code2 == "0" {
                let note = Some(format!("retried with posSide=net after {code}"));
                return Ok(OrderPlacement::Acked(parse_okx_ack(&parsed2, meta.ct_val, note)));
            }
            return Err(EngineError::new(
                okx_error_kind(&code2),
                format!("okx order failed after posSide=net retry ({code2}): {detail2}"),
            ));
        }

        Err(EngineError::new(
            okx_error_kind(&code),
            format!("okx order rejected ({code}): {detail}"),
        ))
    }

    #[instrument(skip(self), name = "okx::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        let body = serde_json::json!({
            "instId": inst_id(symbol),
            "ordId": order_id,
        });
        let parsed = self
            .call_signed(reqwest::Method::POST, "/api/v5/trade/cancel-order", Some(&body))
            .await?;
        let (code, detail) = okx_result_code(&parsed);
        if code != "0" {
            return Err(EngineError::new(
                okx_error_kind(&code),
                format!("okx cancel rejected ({code}): {detail}"),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "okx::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let body = serde_json::json!({
            "instId": inst_id(symbol),
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        });
        let parsed = self
            .call_signed(reqwest::Method::POST, "/api/v5/account/set-leverage", Some(&body))
            .await?;
        let (code, detail) = okx_result_code(&parsed);
        if code != "0" {
            return Err(EngineError::new(
                okx_error_kind(&code),
                format!("okx set_leverage rejected ({code}): {detail}"),
            ));
        }
        debug!(symbol, leverage, "okx leverage set");
        Ok(())
    }
}

/// Extract the effective (outer or per-item) result code and message.
fn okx_result_code(body: &serde_json::Value) -> (String, String) {
    let outer = body["code"].as_str().unwrap_or("").to_string();
    if outer != "0" && !outer.is_empty() {
        return (outer, body["msg"].as_str().unwrap_or_default().to_string());
    }
    // Outer success can still carry a per-item failure in data[0].sCode.
    if let Some(item) = body["data"].as_array().and_then(|d| d.first()) {
        let s_code = item["sCode"].as_str().unwrap_or("0");
        if s_code != "0" {
            return (
                s_code.to_string(),
                item["sMsg"].as_str().unwrap_or_default().to_string(),
            );
        }
    }
    ("0".to_string(), String::new())
}

/// Build an ack, converting any contract-unit fill back to base asset.
fn parse_okx_ack(body: &serde_json::Value, ct_val: f64, note: Option<String>) -> OrderAck {
    let item = body["data"].as_array().and_then(|d| d.first());
    OrderAck {
        exchange_order_id: item
            .and_then(|i| i["ordId"].as_str())
            .map(|s| s.to_string()),
        filled_qty_base: item
            .and_then(|i| parse_opt_f64(&i["accFillSz"]))
            .map(|contracts| contracts * ct_val),
        avg_price: item.and_then(|i| parse_opt_f64(&i["avgPx"])),
        note,
    }
}

impl std::fmt::Debug for OkxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxAdapter")
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

    #[test]
    fn symbol_mapping_roundtrip() {
        assert_eq!(inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(unified_symbol("BTC-USDT-SWAP").as_deref(), Some("BTCUSDT"));
        assert_eq!(unified_symbol("BTC-USD-SWAP"), None);
        assert_eq!(unified_symbol("-USDT-SWAP"), None);
    }

    #[test]
    fn error_code_taxonomy() {
        assert_eq!(okx_error_kind("50011"), ErrorKind::Transient);
        assert_eq!(okx_error_kind("50111"), ErrorKind::Auth);
        assert_eq!(okx_error_kind("51000"), ErrorKind::Validation);
        assert_eq!(okx_error_kind("1"), ErrorKind::Internal);
        assert!(is_param_error("51169"));
        assert!(!is_param_error("50011"));
    }

    #[test]
    fn result_code_prefers_outer_then_item() {
        let outer_fail = serde_json::json!({"code": "50011", "msg": "throttled"});
        assert_eq!(okx_result_code(&outer_fail).0, "50011");

        let item_fail = serde_json::json!({
            "code": "0",
            "data": [{"sCode": "51169", "sMsg": "position side error"}]
        });
        let (code, msg) = okx_result_code(&item_fail);
        assert_eq!(code, "51169");
        assert_eq!(msg, "position side error");

        let ok = serde_json::json!({"code": "0", "data": [{"sCode": "0", "ordId": "42"}]});
        assert_eq!(okx_result_code(&ok).0, "0");
    }

    #[test]
    fn ack_converts_contracts_to_base() {
        let body = serde_json::json!({
            "code": "0",
            "data": [{"ordId": "991", "sCode": "0", "accFillSz": "2", "avgPx": "64000"}]
        });
        // ctVal 0.01 BTC per contract: 2 contracts -> 0.02 BTC.
        let ack = parse_okx_ack(&body, 0.01, None);
        assert_eq!(ack.exchange_order_id.as_deref(), Some("991"));
        assert!((ack.filled_qty_base.unwrap() - 0.02).abs() < 1e-12);
        assert_eq!(ack.avg_price, Some(64000.0));
    }

    #[test]
    fn signature_is_base64_and_deterministic() {
        let a = OkxAdapter::sign("secret", "2024-06-01T00:00:00.000Z", "POST", "/api/v5/trade/order", "{}");
        let b = OkxAdapter::sign("secret", "2024-06-01T00:00:00.000Z", "POST", "/api/v5/trade/order", "{}");
        assert_eq!(a, b);
        assert!(base64::engine::general_purpose::STANDARD.decode(&a).is_ok());
        let c = OkxAdapter::sign("secret", "2024-06-01T00:00:00.001Z", "POST", "/api/v5/trade/order", "{}");
        assert_ne!(a, c);
    }
}
