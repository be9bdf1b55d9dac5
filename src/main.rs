// =============================================================================
// fundarb — cross-venue funding-rate arbitrage engine, main entry point
// =============================================================================
//
// Exit codes:
//   0  normal shutdown
//   2  invalid configuration (malformed FA_* value, malformed master key, or
//      stored credentials present with no master key configured)
//   3  database unreachable at startup
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod board;
mod config;
mod error;
mod execution;
mod market;
mod store;
mod types;
mod vault;
mod venues;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Settings;
use crate::vault::CredentialVault;

const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_DATABASE_UNREACHABLE: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("fundarb engine starting up");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    info!(?settings, "configuration loaded");
    if let Some(redis) = &settings.redis_url {
        // Accepted for forward compatibility; no Redis tier exists yet.
        info!(redis_url = %redis, "FA_REDIS_URL is set but unused");
    }

    // ── 2. Database ──────────────────────────────────────────────────────
    let db = match store::open(settings.database_path()) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database unreachable");
            std::process::exit(EXIT_DATABASE_UNREACHABLE);
        }
    };

    // Credentials stored from an earlier run require the master key now;
    // running without it would brick every execution path at request time.
    if settings.credential_encryption_key.is_none() {
        match CredentialVault::has_stored_credentials(&db).await {
            Ok(true) => {
                error!(
                    "exchange credentials exist but FA_CREDENTIAL_ENCRYPTION_KEY is not set"
                );
                std::process::exit(EXIT_INVALID_CONFIG);
            }
            Ok(false) => {
                warn!("credential vault disabled (FA_CREDENTIAL_ENCRYPTION_KEY not set)");
            }
            Err(e) => {
                error!(error = %e, "could not inspect stored credentials");
                std::process::exit(EXIT_DATABASE_UNREACHABLE);
            }
        }
    }

    // ── 3. Shared state & background feeds ───────────────────────────────
    let state = Arc::new(AppState::new(settings, db));
    state.provider.start_streams();
    info!(venues = 5, "market provider ready");

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let bind_addr = state.settings.bind_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind API server");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    server.abort();
    state.cache.clear();

    info!("fundarb engine shut down complete");
    Ok(())
}
