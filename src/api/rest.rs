// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/`. JSON bodies throughout; timestamps are
// ISO-8601 UTC; errors serialise as `{detail, kind}` via EngineError's
// IntoResponse. CORS is permissive unless FA_CORS_ORIGINS narrows it.
//
// The `exchanges` board parameter repeats (`?exchanges=binance&exchanges=okx`),
// so the board route reads the raw pair list instead of a typed Query struct.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderValue,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::board::opportunity::{build_board, BoardFilter, OpportunityRow};
use crate::error::{EngineError, EngineResult};
use crate::execution::{
    CloseRequest, ConvertRequest, EmergencyCloseRequest, HedgeRequest, OpenRequest,
    PreviewRequest,
};
use crate::market::provider::FetchMeta;
use crate::store::risk_ledger::RiskFilter;
use crate::store::templates::TemplateInput;
use crate::types::Exchange;
use crate::vault::CredentialInput;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/health", get(health))
        // ── Market data ─────────────────────────────────────────────
        .route("/api/market/snapshots", get(market_snapshots))
        .route("/api/market/board", get(market_board))
        .route("/api/opportunities", get(opportunities_legacy))
        // ── Execution ───────────────────────────────────────────────
        .route("/api/execution/preview", post(execution_preview))
        .route("/api/execution/open", post(execution_open))
        .route("/api/execution/close", post(execution_close))
        .route("/api/execution/hedge", post(execution_hedge))
        .route("/api/execution/emergency-close", post(execution_emergency_close))
        .route("/api/execution/convert", post(execution_convert))
        // ── Credentials ─────────────────────────────────────────────
        .route("/api/credentials", get(credentials_list))
        .route(
            "/api/credentials/:exchange",
            put(credentials_put).delete(credentials_delete),
        )
        // ── Stores ──────────────────────────────────────────────────
        .route("/api/positions", get(positions_list))
        .route("/api/orders", get(orders_list))
        .route("/api/risk-events", get(risk_events_list))
        .route("/api/risk-events/:id/resolve", post(risk_event_resolve))
        .route("/api/templates", get(templates_list).post(templates_create))
        .route(
            "/api/templates/:id",
            get(templates_get).put(templates_update).delete(templates_delete),
        )
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    server_time: String,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().to_rfc3339(),
    })
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Deserialize)]
struct SnapshotsQuery {
    #[serde(default)]
    force_refresh: bool,
}

async fn market_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotsQuery>,
) -> impl IntoResponse {
    let board = state.provider.fetch_all(query.force_refresh).await;
    Json(board)
}

#[derive(Serialize)]
struct BoardResponse {
    rows: Vec<OpportunityRow>,
    meta: FetchMeta,
}

/// Parsed form of the board query's repeated/typed parameters.
struct BoardQuery {
    filter: BoardFilter,
    force_refresh: bool,
}

/// The `exchanges` key repeats, so the query arrives as raw pairs.
fn parse_board_query(pairs: &[(String, String)]) -> EngineResult<BoardQuery> {
    let mut filter = BoardFilter::default();
    let mut force_refresh = false;

    for (key, value) in pairs {
        match key.as_str() {
            "limit" => {
                let limit: usize = value
                    .parse()
                    .map_err(|_| EngineError::validation(format!("invalid limit '{value}'")))?;
                filter.limit = Some(limit);
            }
            "min_spread_rate_1y_nominal" => {
                filter.min_spread_rate_1y_nominal = Some(value.parse().map_err(|_| {
                    EngineError::validation(format!(
                        "invalid min_spread_rate_1y_nominal '{value}'"
                    ))
                })?);
            }
            "min_next_cycle_score" => {
                filter.min_next_cycle_score = Some(value.parse().map_err(|_| {
                    EngineError::validation(format!("invalid min_next_cycle_score '{value}'"))
                })?);
            }
            "force_refresh" => {
                force_refresh = matches!(value.as_str(), "true" | "1" | "yes");
            }
            "exchanges" => {
                filter.exchanges.insert(value.parse::<Exchange>()?);
            }
            "symbol" => {
                filter = filter.with_symbol_pattern(value)?;
            }
            _ => {}
        }
    }

    Ok(BoardQuery {
        filter,
        force_refresh,
    })
}

async fn market_board(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<BoardResponse>, EngineError> {
    let query = parse_board_query(&pairs)?;
    let board = state.provider.fetch_all(query.force_refresh).await;
    let rows = build_board(&board.snapshots_by_venue, &query.filter);
    Ok(Json(BoardResponse {
        rows,
        meta: board.meta,
    }))
}

/// Flat row shape kept for older dashboard clients: no leg projections, no
/// settlement preview.
#[derive(Serialize)]
struct LegacyOpportunity {
    symbol: String,
    long_exchange: Exchange,
    short_exchange: Exchange,
    spread_rate_1y_nominal: f64,
    max_usable_leverage: Option<u32>,
    leveraged_spread_rate_1y_nominal: Option<f64>,
    next_cycle_score: Option<f64>,
}

async fn opportunities_legacy(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<LegacyOpportunity>>, EngineError> {
    let query = parse_board_query(&pairs)?;
    let board = state.provider.fetch_all(query.force_refresh).await;
    let rows = build_board(&board.snapshots_by_venue, &query.filter);
    Ok(Json(rows.into_iter().map(legacy_row).collect()))
}

fn legacy_row(row: OpportunityRow) -> LegacyOpportunity {
    LegacyOpportunity {
        symbol: row.symbol,
        long_exchange: row.long_exchange,
        short_exchange: row.short_exchange,
        spread_rate_1y_nominal: row.spread_rate_1y_nominal,
        max_usable_leverage: row.max_usable_leverage,
        leveraged_spread_rate_1y_nominal: row.leveraged_spread_rate_1y_nominal,
        next_cycle_score: row.next_cycle_score,
    }
}

// =============================================================================
// Execution
// =============================================================================

async fn execution_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.coordinator.preview(&req).await?;
    Ok(Json(report))
}

async fn execution_open(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.coordinator.open(&req).await?;
    state.increment_version();
    Ok(Json(report))
}

async fn execution_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.coordinator.close(&req).await?;
    state.increment_version();
    Ok(Json(report))
}

async fn execution_hedge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HedgeRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.coordinator.hedge(&req).await?;
    state.increment_version();
    Ok(Json(report))
}

async fn execution_emergency_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmergencyCloseRequest>,
) -> Result<impl IntoResponse, EngineError> {
    info!(count = req.position_ids.len(), "emergency close requested");
    let report = state.coordinator.emergency_close(&req).await?;
    state.increment_version();
    Ok(Json(report))
}

async fn execution_convert(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConvertRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.coordinator.convert_notional(&req).await?;
    Ok(Json(report))
}

// =============================================================================
// Credentials
// =============================================================================

async fn credentials_list(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let masked = state.vault.list_masked().await?;
    Ok(Json(masked))
}

async fn credentials_put(
    State(state): State<Arc<AppState>>,
    Path(exchange): Path<String>,
    Json(input): Json<CredentialInput>,
) -> Result<impl IntoResponse, EngineError> {
    let exchange: Exchange = exchange.parse()?;
    let masked = state.vault.put(exchange, input).await?;
    state.increment_version();
    Ok(Json(masked))
}

async fn credentials_delete(
    State(state): State<Arc<AppState>>,
    Path(exchange): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let exchange: Exchange = exchange.parse()?;
    let deleted = state.vault.delete(exchange).await?;
    state.increment_version();
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// =============================================================================
// Positions / orders
// =============================================================================

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page_limit")]
    limit: usize,
    /// Orders only: restrict to the legs of one position.
    #[serde(default)]
    position_id: Option<String>,
}

fn default_page_limit() -> usize {
    100
}

async fn positions_list(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let positions = state.positions.list(page.limit).await?;
    Ok(Json(positions))
}

async fn orders_list(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let orders = match &page.position_id {
        Some(position_id) => state.orders.list_for_position(position_id).await?,
        None => state.orders.list(page.limit).await?,
    };
    Ok(Json(orders))
}

// =============================================================================
// Risk events
// =============================================================================

#[derive(Deserialize)]
struct RiskQuery {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    resolved: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn risk_events_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RiskQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let filter = RiskFilter {
        severity: query.severity.as_deref().map(str::parse).transpose()?,
        resolved: query.resolved,
        limit: query.limit,
    };
    let events = state.ledger.list(&filter).await?;
    Ok(Json(events))
}

async fn risk_event_resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let event = state.ledger.resolve(&id).await?;
    state.increment_version();
    Ok(Json(event))
}

// =============================================================================
// Templates
// =============================================================================

async fn templates_list(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let templates = state.templates.list().await?;
    Ok(Json(templates))
}

async fn templates_create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TemplateInput>,
) -> Result<impl IntoResponse, EngineError> {
    let template = state.templates.create(input).await?;
    state.increment_version();
    Ok(Json(template))
}

async fn templates_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let template = state
        .templates
        .get(&id)
        .await?
        .ok_or_else(|| EngineError::validation(format!("no template with id {id}")))?;
    Ok(Json(template))
}

async fn templates_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<TemplateInput>,
) -> Result<impl IntoResponse, EngineError> {
    let template = state.templates.update(&id, input).await?;
    state.increment_version();
    Ok(Json(template))
}

async fn templates_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let deleted = state.templates.delete(&id).await?;
    state.increment_version();
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn board_query_parses_repeated_exchanges() {
        let query = parse_board_query(&pairs(&[
            ("limit", "25"),
            ("exchanges", "binance"),
            ("exchanges", "okx"),
            ("min_spread_rate_1y_nominal", "0.05"),
            ("force_refresh", "true"),
            ("symbol", "^BTC"),
        ]))
        .unwrap();

        assert_eq!(query.filter.limit, Some(25));
        assert!(query.force_refresh);
        assert_eq!(query.filter.exchanges.len(), 2);
        assert!(query.filter.exchanges.contains(&Exchange::Binance));
        assert!(query.filter.exchanges.contains(&Exchange::Okx));
        assert_eq!(query.filter.min_spread_rate_1y_nominal, Some(0.05));
        assert!(query.filter.symbol_pattern.as_ref().unwrap().is_match("BTCUSDT"));
    }

    #[test]
    fn board_query_rejects_bad_values() {
        assert!(parse_board_query(&pairs(&[("limit", "abc")])).is_err());
        assert!(parse_board_query(&pairs(&[("exchanges", "kraken")])).is_err());
        assert!(parse_board_query(&pairs(&[("symbol", "[")])).is_err());
        assert!(parse_board_query(&pairs(&[("min_next_cycle_score", "x")])).is_err());
    }

    #[test]
    fn board_query_ignores_unknown_keys() {
        let query = parse_board_query(&pairs(&[("unknown", "1"), ("force_refresh", "0")])).unwrap();
        assert!(!query.force_refresh);
        assert!(query.filter.exchanges.is_empty());
        assert!(query.filter.limit.is_none());
    }
}
