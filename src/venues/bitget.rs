// =============================================================================
// Bitget USDT-futures adapter — passphrase-bearing base64 HMAC signatures
// =============================================================================
//
// Bitget signs like OKX: base64(HMAC-SHA256(timestamp + method + path + body))
// with ACCESS-KEY / ACCESS-SIGN / ACCESS-TIMESTAMP / ACCESS-PASSPHRASE
// headers, but the timestamp is epoch milliseconds rather than ISO-8601.
//
// The tickers endpoint carries no settlement timestamp; next funding is the
// next whole-interval boundary from UTC midnight, with the cadence taken from
// the contracts endpoint (8h default).
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
    get_json, http_error_kind, is_usdt_symbol, next_funding_boundary, parse_f64, parse_opt_f64,
    timestamp_ms, OrderAck, OrderPlacement, OrderRequest, Transport, VenueAdapter, VenueContext,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const DEFAULT_INTERVAL_HOURS: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
struct ContractMeta {
    funding_interval_hours: f64,
    max_leverage: Option<u32>,
}

pub struct BitgetAdapter {
    ctx: VenueContext,
    contracts: RwLock<HashMap<String, ContractMeta>>,
}

/// Bitget business codes: 40037/40012/40009 credential and signature
/// failures, 429xx throttling, the 4xxxx remainder parameter rejections.
fn bitget_error_kind(code: &str) -> ErrorKind {
    match code {
        "40009" | "40012" | "40037" | "40038" => ErrorKind::Auth,
        c if c.starts_with("429") => ErrorKind::Transient,
        c if c.starts_with('4') => ErrorKind::Validation,
        _ => ErrorKind::Internal,
    }
}

impl BitgetAdapter {
    pub fn new(ctx: VenueContext) -> Self {
        Self {
            ctx,
            contracts: RwLock::new(HashMap::new()),
        }
    }

    fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
        let creds = self.ctx.credentials.as_ref().expect("checked by caller");
        let timestamp = timestamp_ms().to_string();
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
            .header("ACCESS-KEY", &creds.api_key)
            .header("ACCESS-SIGN", sig)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header(
                "ACCESS-PASSPHRASE",
                creds.passphrase.as_deref().unwrap_or_default(),
            )
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

    async fn call_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        self.ctx.require_credentials(Exchange::Bitget)?;
        let (status, parsed) = self
            .send_signed(method, path, body)
            .await
            .map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::new(
                http_error_kind(status),
                format!("bitget {path} returned {status}: {parsed}"),
            ));
        }
        Ok(parsed)
    }

    fn check_code(parsed: &serde_json::Value, what: &str) -> EngineResult<()> {
        let code = parsed["code"].as_str().unwrap_or("");
        if code != "00000" {
            return Err(EngineError::new(
                bitget_error_kind(code),
                format!(
                    "bitget {what} rejected ({code}): {}",
                    parsed["msg"].as_str().unwrap_or_default()
                ),
            ));
        }
        Ok(())
    }

    async fn refresh_contracts(&self) -> EngineResult<()> {
        let url = format!("{BASE_URL}/api/v2/mix/market/contracts?productType={PRODUCT_TYPE}");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::internal("bitget contracts: missing data array"))?;

        let mut cache = self.contracts.write();
        for entry in data {
            let Some(symbol) = entry["symbol"].as_str() else {
                continue;
            };
            if !is_usdt_symbol(symbol) {
                continue;
            }
            let funding_interval_hours = parse_opt_f64(&entry["fundInterval"])
                .filter(|h| *h > 0.0)
                .unwrap_or(DEFAULT_INTERVAL_HOURS);
            let max_leverage = parse_opt_f64(&entry["maxLever"])
                .map(|l| l.floor() as u32)
                .filter(|l| *l > 0);
            cache.insert(
                symbol.to_string(),
                ContractMeta {
                    funding_interval_hours,
                    max_leverage,
                },
            );
        }
        debug!(count = cache.len(), "bitget contracts refreshed");
        Ok(())
    }

    fn snapshot_from_ticker(
        &self,
        entry: &serde_json::Value,
        source_tag: SourceTag,
        with_metadata: bool,
    ) -> Option<FundingSnapshot> {
        let symbol = entry["symbol"].as_str()?.to_uppercase();
        if !is_usdt_symbol(&symbol) {
            return None;
        }
        let mark_price = parse_f64(&entry["markPrice"])
            .or_else(|_| parse_f64(&entry["lastPr"]))
            .ok()?;
        let funding_rate_raw = parse_f64(&entry["fundingRate"]).ok()?;

        let meta = if with_metadata {
            self.contracts.read().get(&symbol).copied()
        } else {
            None
        };
        let interval = meta
            .map(|m| m.funding_interval_hours)
            .unwrap_or(DEFAULT_INTERVAL_HOURS);

        Some(FundingSnapshot {
            exchange: Exchange::Bitget,
            symbol,
            funding_rate_raw,
            funding_interval_hours: interval,
            next_funding_time: next_funding_boundary(Utc::now(), interval),
            mark_price,
            open_interest_usd: None,
            volume24h_usd: parse_opt_f64(&entry["usdtVolume"]),
            max_leverage: meta.and_then(|m| m.max_leverage),
            source_tag,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl VenueAdapter for BitgetAdapter {
    fn name(&self) -> Exchange {
        Exchange::Bitget
    }

    fn transports(&self) -> &'static [Transport] {
        &[Transport::Library, Transport::Rest]
    }

    #[instrument(skip(self, symbols), name = "bitget::fetch_funding")]
    async fn fetch_funding(
        &self,
        transport: Transport,
        symbols: Option<&[String]>,
    ) -> EngineResult<Vec<FundingSnapshot>> {
        let (source_tag, with_metadata) = match transport {
            Transport::Library => (SourceTag::Ccxt, true),
            Transport::Rest => (SourceTag::Rest, false),
            Transport::Ws => {
                return Err(EngineError::not_supported(
                    "bitget adapter has no ws funding tier",
                ))
            }
        };

        if with_metadata {
            if let Err(e) = self.refresh_contracts().await {
                warn!(error = %e, "bitget contracts refresh failed");
            }
        }

        let url = format!("{BASE_URL}/api/v2/mix/market/tickers?productType={PRODUCT_TYPE}");
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        Self::check_code(&body, "tickers")?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::internal("bitget tickers: missing data array"))?;

        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(|x| x.as_str()).collect());

        let snapshots: Vec<FundingSnapshot> = data
            .iter()
            .filter_map(|e| self.snapshot_from_ticker(e, source_tag, with_metadata))
            .filter(|s| {
                wanted
                    .as_ref()
                    .map_or(true, |w| w.contains(s.symbol.as_str()))
            })
            .collect();

        debug!(count = snapshots.len(), ?transport, "bitget funding fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "bitget::fetch_mark_price")]
    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{BASE_URL}/api/v2/mix/market/ticker?productType={PRODUCT_TYPE}&symbol={symbol}"
        );
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        Self::check_code(&body, "ticker")?;
        let entry = body["data"].as_array().and_then(|d| d.first()).ok_or_else(|| {
            EngineError::not_supported(format!("bitget has no USDT-futures ticker for {symbol}"))
        })?;
        parse_f64(&entry["markPrice"]).or_else(|_| parse_f64(&entry["lastPr"]))
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>> {
        if let Some(meta) = self.contracts.read().get(symbol) {
            return Ok(meta.max_leverage);
        }
        self.refresh_contracts().await?;
        Ok(self
            .contracts
            .read()
            .get(symbol)
            .and_then(|m| m.max_leverage))
    }

    async fn contract_size(&self, _symbol: &str) -> EngineResult<f64> {
        // USDT-futures sizes are denominated in base asset.
        Ok(1.0)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "bitget::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement> {
        self.ctx.require_credentials(Exchange::Bitget)?;
        let body = serde_json::json!({
            "symbol": req.symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": "crossed",
            "marginCoin": "USDT",
            "size": req.quantity_base.to_string(),
            "side": match req.side { Side::Buy => "buy", Side::Sell => "sell" },
            "orderType": "market",
            "reduceOnly": if req.reduce_only { "YES" } else { "NO" },
        });

        let sent = self
            .send_signed(
                reqwest::Method::POST,
                "/api/v2/mix/order/place-order",
                Some(&body),
            )
            .await;
        let (status, parsed) = match sent {
            Ok(sb) => sb,
            Err(e) if e.is_timeout() => {
                warn!(symbol = %req.symbol, "bitget order deadline elapsed; marking pending");
                return Ok(OrderPlacement::Pending(OrderAck {
                    note: Some("order timed out in flight; reconcile against venue".to_string()),
                    ..OrderAck::default()
                }));
            }
            Err(e) => return Err(e.into()),
        };
        if !status.is_success() {
            return Err(EngineError::new(
                http_error_kind(status),
                format!("bitget order returned {status}: {parsed}"),
            ));
        }
        Self::check_code(&parsed, "order")?;

        Ok(OrderPlacement::Acked(OrderAck {
            exchange_order_id: parsed["data"]["orderId"].as_str().map(|s| s.to_string()),
            filled_qty_base: None,
            avg_price: None,
            note: None,
        }))
    }

    #[instrument(skip(self), name = "bitget::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "orderId": order_id,
        });
        let parsed = self
            .call_signed(
                reqwest::Method::POST,
                "/api/v2/mix/order/cancel-order",
                Some(&body),
            )
            .await?;
        Self::check_code(&parsed, "cancel")
    }

    #[instrument(skip(self), name = "bitget::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": "USDT",
            "leverage": leverage.to_string(),
        });
        let parsed = self
            .call_signed(
                reqwest::Method::POST,
                "/api/v2/mix/account/set-leverage",
                Some(&body),
            )
            .await?;
        Self::check_code(&parsed, "set_leverage")?;
        debug!(symbol, leverage, "bitget leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for BitgetAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetAdapter")
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

    fn adapter() -> BitgetAdapter {
        BitgetAdapter::new(VenueContext {
            http: reqwest::Client::new(),
            data_timeout: Duration::from_secs(5),
            order_timeout: Duration::from_secs(10),
            credentials: None,
        })
    }

    #[test]
    fn code_taxonomy() {
        assert_eq!(bitget_error_kind("40037"), ErrorKind::Auth);
        assert_eq!(bitget_error_kind("42901"), ErrorKind::Transient);
        assert_eq!(bitget_error_kind("40762"), ErrorKind::Validation);
        assert_eq!(bitget_error_kind("50000"), ErrorKind::Internal);
    }

    #[test]
    fn check_code_passes_success_and_tags_failures() {
        assert!(BitgetAdapter::check_code(
            &serde_json::json!({"code": "00000", "data": {}}),
            "order"
        )
        .is_ok());
        let err = BitgetAdapter::check_code(
            &serde_json::json!({"code": "40762", "msg": "insufficient size"}),
            "order",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.detail.contains("40762"));
    }

    #[test]
    fn signature_is_base64_over_prehash() {
        let a = BitgetAdapter::sign("sec", "1717228800000", "POST", "/api/v2/mix/order/place-order", "{}");
        let b = BitgetAdapter::sign("sec", "1717228800000", "POST", "/api/v2/mix/order/place-order", "{}");
        assert_eq!(a, b);
        assert!(base64::engine::general_purpose::STANDARD.decode(&a).is_ok());
        assert_ne!(
            a,
            BitgetAdapter::sign("sec", "1717228800000", "GET", "/api/v2/mix/order/place-order", "{}")
        );
    }

    #[test]
    fn ticker_snapshot_falls_back_to_boundary_time() {
        let a = adapter();
        let entry = serde_json::json!({
            "symbol": "BTCUSDT",
            "markPrice": "64100.2",
            "fundingRate": "0.00008",
            "usdtVolume": "2200000000"
        });
        let snap = a.snapshot_from_ticker(&entry, SourceTag::Ccxt, false).unwrap();
        assert_eq!(snap.funding_interval_hours, DEFAULT_INTERVAL_HOURS);
        assert!(snap.next_funding_time > snap.fetched_at);
        assert_eq!(snap.volume24h_usd, Some(2_200_000_000.0));
    }

    #[test]
    fn ticker_snapshot_uses_contract_interval() {
        let a = adapter();
        a.contracts.write().insert(
            "DOGEUSDT".to_string(),
            ContractMeta {
                funding_interval_hours: 4.0,
                max_leverage: Some(25),
            },
        );
        let entry = serde_json::json!({
            "symbol": "DOGEUSDT",
            "markPrice": "0.123",
            "fundingRate": "-0.0003"
        });
        let snap = a.snapshot_from_ticker(&entry, SourceTag::Ccxt, true).unwrap();
        assert_eq!(snap.funding_interval_hours, 4.0);
        assert_eq!(snap.max_leverage, Some(25));
    }
}
