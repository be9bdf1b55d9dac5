// =============================================================================
// Relational store — sqlite schema and connection handle
// =============================================================================
//
// One WAL-mode connection shared behind an async mutex. Writes are per-row
// transactions; the only multi-statement transaction in the system is the
// position+orders insert inside ExecutionCoordinator::open, which must be
// atomic.
// =============================================================================

pub mod orders;
pub mod positions;
pub mod risk_ledger;
pub mod templates;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

pub type Db = Arc<Mutex<Connection>>;

/// Open (creating if needed) the sqlite database and run migrations.
pub fn open(path: &str) -> Result<Db> {
    let p = Path::new(path);
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating database directory")?;
        }
    }

    let conn = Connection::open(p)
        .with_context(|| format!("opening sqlite database at {}", p.display()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        .context("applying sqlite pragmas")?;
    migrate(&conn).context("running schema migration")?;

    info!(path = %p.display(), "database opened");
    Ok(Arc::new(Mutex::new(conn)))
}

/// Idempotent schema creation.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS positions (
            id                 TEXT PRIMARY KEY,
            symbol             TEXT NOT NULL,
            long_exchange      TEXT NOT NULL,
            short_exchange     TEXT NOT NULL,
            long_qty           REAL NOT NULL,
            short_qty          REAL NOT NULL,
            status             TEXT NOT NULL,
            entry_spread_rate  REAL,
            extra              TEXT NOT NULL DEFAULT '{}',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            closed_at          TEXT
        );

        CREATE TABLE IF NOT EXISTS orders (
            id                 TEXT PRIMARY KEY,
            position_id        TEXT REFERENCES positions(id),
            action             TEXT NOT NULL,
            status             TEXT NOT NULL,
            exchange           TEXT NOT NULL,
            symbol             TEXT NOT NULL,
            side               TEXT NOT NULL,
            quantity           REAL NOT NULL,
            filled_qty         REAL,
            avg_price          REAL,
            exchange_order_id  TEXT,
            note               TEXT,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_position ON orders(position_id);

        CREATE TABLE IF NOT EXISTS risk_events (
            id           TEXT PRIMARY KEY,
            event_type   TEXT NOT NULL,
            severity     TEXT NOT NULL,
            message      TEXT NOT NULL,
            context      TEXT NOT NULL DEFAULT '{}',
            resolved     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            resolved_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_risk_events_severity ON risk_events(severity);

        CREATE TABLE IF NOT EXISTS strategy_templates (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            symbol          TEXT NOT NULL,
            long_exchange   TEXT NOT NULL,
            short_exchange  TEXT NOT NULL,
            quantity        REAL,
            notional_usd    REAL,
            leverage        INTEGER,
            hold_hours      REAL,
            note            TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS exchange_credentials (
            exchange    TEXT PRIMARY KEY,
            ciphertext  TEXT NOT NULL,
            testnet     INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// In-memory database for tests.
#[cfg(test)]
pub fn open_in_memory() -> Db {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    migrate(&conn).expect("migration");
    Arc::new(Mutex::new(conn))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        for expected in [
            "exchange_credentials",
            "orders",
            "positions",
            "risk_events",
            "strategy_templates",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn open_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fundarb.db");
        let db = open(path.to_str().unwrap()).unwrap();
        drop(db);
        assert!(path.exists());
    }
}
