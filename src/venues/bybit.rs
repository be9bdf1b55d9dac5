// =============================================================================
// Bybit USDT-perpetual adapter — v5 linear endpoints, X-BAPI header signing
// =============================================================================
//
// Bybit quotes linear-perp quantities directly in base asset, so no contract
// conversion is needed. The signature is hex HMAC-SHA256 over
// `timestamp + api_key + recv_window + body`.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::types::{Exchange, FundingSnapshot, Side, SourceTag};
use crate::venues::{
    get_json, http_error_kind, is_usdt_symbol, ms_to_datetime, parse_f64, parse_opt_f64,
    timestamp_ms, OrderAck, OrderPlacement, OrderRequest, Transport, VenueAdapter, VenueContext,
};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_BASE: &str = "https://api.bybit.com";
const TESTNET_BASE: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const DEFAULT_INTERVAL_HOURS: f64 = 8.0;

/// retCode returned when the requested leverage equals the current one.
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

#[derive(Debug, Clone, Copy)]
struct InstrumentMeta {
    funding_interval_hours: f64,
    max_leverage: Option<u32>,
}

pub struct BybitAdapter {
    ctx: VenueContext,
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
}

/// Bybit business codes: 10003/10004 bad key or signature, 10006 throttled,
/// 110xx order-parameter rejections.
fn bybit_error_kind(ret_code: i64) -> ErrorKind {
    match ret_code {
        10003 | 10004 | 10005 => ErrorKind::Auth,
        10006 | 10016 => ErrorKind::Transient,
        c if (110000..111000).contains(&c) => ErrorKind::Validation,
        _ => ErrorKind::Internal,
    }
}

impl BybitAdapter {
    pub fn new(ctx: VenueContext) -> Self {
        Self {
            ctx,
            instruments: RwLock::new(HashMap::new()),
        }
    }

    fn base(&self) -> &'static str {
        if self.ctx.credentials.as_ref().is_some_and(|c| c.testnet) {
            TESTNET_BASE
        } else {
            MAINNET_BASE
        }
    }

    fn sign(secret: &str, timestamp: &str, api_key: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{api_key}{RECV_WINDOW}{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn send_signed(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
        let creds = self.ctx.credentials.as_ref().expect("checked by caller");
        let timestamp = timestamp_ms().to_string();
        let body_str = body.to_string();
        let sig = Self::sign(&creds.api_secret, &timestamp, &creds.api_key, &body_str);

        let resp = self
            .ctx
            .http
            .post(format!("{}{path}", self.base()))
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .timeout(self.ctx.order_timeout)
            .body(body_str)
            .send()
            .await?;
        let status = resp.status();
        let parsed = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, parsed))
    }

    async fn call_signed(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        self.ctx.require_credentials(Exchange::Bybit)?;
        let (status, parsed) = self.send_signed(path, body).await.map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::new(
                http_error_kind(status),
                format!("bybit {path} returned {status}: {parsed}"),
            ));
        }
        Ok(parsed)
    }

    /// Refresh funding-interval and leverage metadata from instruments-info.
    async fn refresh_instruments(&self) -> EngineResult<()> {
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&limit=1000",
            self.base()
        );
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let list = body["result"]["list"]
            .as_array()
            .ok_or_else(|| EngineError::internal("bybit instruments-info: missing list"))?;

        let mut cache = self.instruments.write();
        for entry in list {
            let Some(symbol) = entry["symbol"].as_str() else {
                continue;
            };
            if !is_usdt_symbol(symbol) {
                continue;
            }
            let funding_interval_hours = entry["fundingInterval"]
                .as_i64()
                .or_else(|| entry["fundingInterval"].as_str().and_then(|s| s.parse().ok()))
                .map(|minutes| minutes as f64 / 60.0)
                .filter(|h| *h > 0.0)
                .unwrap_or(DEFAULT_INTERVAL_HOURS);
            let max_leverage = parse_opt_f64(&entry["leverageFilter"]["maxLeverage"])
                .map(|l| l.floor() as u32)
                .filter(|l| *l > 0);
            cache.insert(
                symbol.to_string(),
                InstrumentMeta {
                    funding_interval_hours,
                    max_leverage,
                },
            );
        }
        debug!(count = cache.len(), "bybit instruments refreshed");
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
        let mark_price = parse_f64(&entry["markPrice"]).ok()?;
        let funding_rate_raw = parse_f64(&entry["fundingRate"]).ok()?;
        let next_ms = entry["nextFundingTime"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| entry["nextFundingTime"].as_i64())
            .unwrap_or(0);

        let meta = if with_metadata {
            self.instruments.read().get(&symbol).copied()
        } else {
            None
        };

        Some(FundingSnapshot {
            exchange: Exchange::Bybit,
            symbol,
            funding_rate_raw,
            funding_interval_hours: meta
                .map(|m| m.funding_interval_hours)
                .unwrap_or(DEFAULT_INTERVAL_HOURS),
            next_funding_time: ms_to_datetime(next_ms),
            mark_price,
            open_interest_usd: parse_opt_f64(&entry["openInterestValue"]),
            volume24h_usd: parse_opt_f64(&entry["turnover24h"]),
            max_leverage: meta.and_then(|m| m.max_leverage),
            source_tag,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn name(&self) -> Exchange {
        Exchange::Bybit
    }

    fn transports(&self) -> &'static [Transport] {
        &[Transport::Library, Transport::Rest]
    }

    #[instrument(skip(self, symbols), name = "bybit::fetch_funding")]
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
                    "bybit adapter has no ws funding tier",
                ))
            }
        };

        if with_metadata {
            if let Err(e) = self.refresh_instruments().await {
                warn!(error = %e, "bybit instruments refresh failed");
            }
        }

        let url = format!("{}/v5/market/tickers?category=linear", self.base());
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let list = body["result"]["list"]
            .as_array()
            .ok_or_else(|| EngineError::internal("bybit tickers: missing list"))?;

        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(|x| x.as_str()).collect());

        let snapshots: Vec<FundingSnapshot> = list
            .iter()
            .filter_map(|e| self.snapshot_from_ticker(e, source_tag, with_metadata))
            .filter(|s| {
                wanted
                    .as_ref()
                    .map_or(true, |w| w.contains(s.symbol.as_str()))
            })
            .collect();

        debug!(count = snapshots.len(), ?transport, "bybit funding fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "bybit::fetch_mark_price")]
    async fn fetch_mark_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{}/v5/market/tickers?category=linear&symbol={symbol}",
            self.base()
        );
        let body = get_json(&self.ctx.http, &url, self.ctx.data_timeout).await?;
        let entry = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| {
                EngineError::not_supported(format!("bybit has no linear ticker for {symbol}"))
            })?;
        parse_f64(&entry["markPrice"])
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> EngineResult<Option<u32>> {
        if let Some(meta) = self.instruments.read().get(symbol) {
            return Ok(meta.max_leverage);
        }
        self.refresh_instruments().await?;
        Ok(self
            .instruments
            .read()
            .get(symbol)
            .and_then(|m| m.max_leverage))
    }

    async fn contract_size(&self, _symbol: &str) -> EngineResult<f64> {
        // Linear perps quote qty in base asset.
        Ok(1.0)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "bybit::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> EngineResult<OrderPlacement> {
        self.ctx.require_credentials(Exchange::Bybit)?;
        let body = serde_json::json!({
            "category": "linear",
            "symbol": req.symbol,
            "side": match req.side { Side::Buy => "Buy", Side::Sell => "Sell" },
            "orderType": "Market",
            "qty": req.quantity_base.to_string(),
            "reduceOnly": req.reduce_only,
        });

        let sent = self.send_signed("/v5/order/create", &body).await;
        let (status, parsed) = match sent {
            Ok(sb) => sb,
            Err(e) if e.is_timeout() => {
                warn!(symbol = %req.symbol, "bybit order deadline elapsed; marking pending");
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
                format!("bybit order returned {status}: {parsed}"),
            ));
        }

        let ret_code = parsed["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            return Err(EngineError::new(
                bybit_error_kind(ret_code),
                format!(
                    "bybit order rejected ({ret_code}): {}",
                    parsed["retMsg"].as_str().unwrap_or_default()
                ),
            ));
        }

        Ok(OrderPlacement::Acked(OrderAck {
            exchange_order_id: parsed["result"]["orderId"].as_str().map(|s| s.to_string()),
            filled_qty_base: None,
            avg_price: None,
            note: None,
        }))
    }

    #[instrument(skip(self), name = "bybit::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        let parsed = self.call_signed("/v5/order/cancel", &body).await?;
        let ret_code = parsed["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            return Err(EngineError::new(
                bybit_error_kind(ret_code),
                format!(
                    "bybit cancel rejected ({ret_code}): {}",
                    parsed["retMsg"].as_str().unwrap_or_default()
                ),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        let parsed = self.call_signed("/v5/position/set-leverage", &body).await?;
        let ret_code = parsed["retCode"].as_i64().unwrap_or(-1);
        // "leverage not modified" means the venue is already where we want it.
        if ret_code != 0 && ret_code != RET_LEVERAGE_NOT_MODIFIED {
            return Err(EngineError::new(
                bybit_error_kind(ret_code),
                format!(
                    "bybit set_leverage rejected ({ret_code}): {}",
                    parsed["retMsg"].as_str().unwrap_or_default()
                ),
            ));
        }
        debug!(symbol, leverage, "bybit leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for BybitAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitAdapter")
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

    fn adapter() -> BybitAdapter {
        BybitAdapter::new(VenueContext {
            http: reqwest::Client::new(),
            data_timeout: Duration::from_secs(5),
            order_timeout: Duration::from_secs(10),
            credentials: None,
        })
    }

    #[test]
    fn ret_code_taxonomy() {
        assert_eq!(bybit_error_kind(10003), ErrorKind::Auth);
        assert_eq!(bybit_error_kind(10006), ErrorKind::Transient);
        assert_eq!(bybit_error_kind(110007), ErrorKind::Validation);
        assert_eq!(bybit_error_kind(-1), ErrorKind::Internal);
    }

    #[test]
    fn signature_covers_timestamp_key_window_body() {
        let a = BybitAdapter::sign("sec", "1717228800000", "key", "{\"a\":1}");
        let b = BybitAdapter::sign("sec", "1717228800000", "key", "{\"a\":1}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, BybitAdapter::sign("sec", "1717228800001", "key", "{\"a\":1}"));
        assert_ne!(a, BybitAdapter::sign("sec", "1717228800000", "key2", "{\"a\":1}"));
    }

    #[test]
    fn ticker_snapshot_uses_instrument_metadata() {
        let a = adapter();
        a.instruments.write().insert(
            "ETHUSDT".to_string(),
            InstrumentMeta {
                funding_interval_hours: 4.0,
                max_leverage: Some(50),
            },
        );
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "markPrice": "3200.5",
            "fundingRate": "0.00012",
            "nextFundingTime": "1717228800000",
            "turnover24h": "1500000000",
            "openInterestValue": "800000000"
        });
        let snap = a.snapshot_from_ticker(&entry, SourceTag::Ccxt, true).unwrap();
        assert_eq!(snap.funding_interval_hours, 4.0);
        assert_eq!(snap.max_leverage, Some(50));
        assert_eq!(snap.volume24h_usd, Some(1_500_000_000.0));

        // Without metadata the 8h default applies and leverage is unknown.
        let bare = a.snapshot_from_ticker(&entry, SourceTag::Rest, false).unwrap();
        assert_eq!(bare.funding_interval_hours, DEFAULT_INTERVAL_HOURS);
        assert!(bare.max_leverage.is_none());
    }

    #[test]
    fn ticker_snapshot_skips_non_usdt() {
        let a = adapter();
        let entry = serde_json::json!({
            "symbol": "BTCPERP",
            "markPrice": "64000",
            "fundingRate": "0.0001",
            "nextFundingTime": "1717228800000"
        });
        assert!(a.snapshot_from_ticker(&entry, SourceTag::Ccxt, false).is_none());
    }
}
