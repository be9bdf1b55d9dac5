// =============================================================================
// PositionStore — paired positions with forward-only status transitions
// =============================================================================
//
// A position and its leg orders are born in the same transaction inside
// ExecutionCoordinator::open; `insert_with_orders` is the only multi-row
// transaction in the store layer. Status updates go through the transition
// check in `PositionStatus::can_transition_to`.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::orders::{insert_order, parse_ts, Order};
use crate::store::Db;
use crate::types::{Exchange, PositionStatus};

/// A paired position. Quantities are base-asset units, not contracts.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub long_qty: f64,
    pub short_qty: f64,
    pub status: PositionStatus,
    pub entry_spread_rate: Option<f64>,
    /// Free-form post-trade reconciliation data.
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(
        symbol: &str,
        long_exchange: Exchange,
        short_exchange: Exchange,
        long_qty: f64,
        short_qty: f64,
        status: PositionStatus,
        entry_spread_rate: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            long_exchange,
            short_exchange,
            long_qty,
            short_qty,
            status,
            entry_spread_rate,
            extra: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    let long_exchange: String = row.get("long_exchange")?;
    let short_exchange: String = row.get("short_exchange")?;
    let status: String = row.get("status")?;
    let extra: String = row.get("extra")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let closed_at: Option<String> = row.get("closed_at")?;

    Ok(Position {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        long_exchange: long_exchange.parse().unwrap_or(Exchange::Binance),
        short_exchange: short_exchange.parse().unwrap_or(Exchange::Okx),
        long_qty: row.get("long_qty")?,
        short_qty: row.get("short_qty")?,
        status: status.parse().unwrap_or(PositionStatus::OpenFailed),
        entry_spread_rate: row.get("entry_spread_rate")?,
        extra: serde_json::from_str(&extra).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        closed_at: closed_at.as_deref().map(parse_ts),
    })
}

pub struct PositionStore {
    db: Db,
}

impl PositionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a position and its leg orders atomically.
    pub async fn insert_with_orders(
        &self,
        position: &Position,
        orders: &[Order],
    ) -> EngineResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::internal(format!("begin transaction: {e}")))?;

        tx.execute(
            "INSERT INTO positions (id, symbol, long_exchange, short_exchange, long_qty,
                                    short_qty, status, entry_spread_rate, extra,
                                    created_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                position.id,
                position.symbol,
                position.long_exchange.as_str(),
                position.short_exchange.as_str(),
                position.long_qty,
                position.short_qty,
                position.status.as_str(),
                position.entry_spread_rate,
                position.extra.to_string(),
                position.created_at.to_rfc3339(),
                position.updated_at.to_rfc3339(),
                position.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        for order in orders {
            insert_order(&tx, order)?;
        }

        tx.commit()
            .map_err(|e| EngineError::internal(format!("commit transaction: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<Position>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM positions WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], row_to_position)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, limit: usize) -> EngineResult<Vec<Position>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM positions ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let positions = stmt
            .query_map(params![limit as i64], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub async fn list_open(&self) -> EngineResult<Vec<Position>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM positions WHERE status IN ('open', 'risk_exposed')
             ORDER BY created_at ASC",
        )?;
        let positions = stmt
            .query_map([], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    /// Move a position forward through its state machine. Illegal
    /// transitions are internal errors: the coordinator never asks for them.
    pub async fn update_status(&self, id: &str, next: PositionStatus) -> EngineResult<Position> {
        let conn = self.db.lock().await;
        let current: String = conn
            .query_row(
                "SELECT status FROM positions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|_| EngineError::validation(format!("no position with id {id}")))?;
        let current: PositionStatus = current.parse()?;

        if !current.can_transition_to(next) {
            return Err(EngineError::internal(format!(
                "illegal position transition {current} -> {next}"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let closed_at = matches!(next, PositionStatus::Closed).then(|| now.clone());
        conn.execute(
            "UPDATE positions
             SET status = ?2, updated_at = ?3,
                 closed_at = COALESCE(?4, closed_at)
             WHERE id = ?1",
            params![id, next.as_str(), now, closed_at],
        )?;

        let mut stmt = conn.prepare("SELECT * FROM positions WHERE id = ?1")?;
        let position = stmt.query_row(params![id], row_to_position)?;
        Ok(position)
    }

    /// Merge keys into the position's free-form `extra` JSON.
    pub async fn merge_extra(&self, id: &str, patch: serde_json::Value) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let raw: String = conn
            .query_row(
                "SELECT extra FROM positions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|_| EngineError::validation(format!("no position with id {id}")))?;
        let mut extra: serde_json::Value =
            serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
        if let (Some(obj), Some(patch_obj)) = (extra.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        conn.execute(
            "UPDATE positions SET extra = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, extra.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;
    use crate::types::{OrderAction, OrderStatus, Side};

    fn position(status: PositionStatus) -> Position {
        Position::new(
            "BTCUSDT",
            Exchange::Binance,
            Exchange::Okx,
            0.01,
            0.01,
            status,
            Some(0.3285),
        )
    }

    #[tokio::test]
    async fn insert_with_orders_is_atomic() {
        let db = open_in_memory();
        let store = PositionStore::new(db.clone());

        let pos = position(PositionStatus::Open);
        let long = Order::new(
            Some(pos.id.clone()),
            OrderAction::Open,
            OrderStatus::Ok,
            Exchange::Binance,
            "BTCUSDT",
            Side::Buy,
            0.01,
        );
        // A rollback without a failed sibling violates the order invariant,
        // so the whole transaction must roll back: no position row either.
        let bad = Order::new(
            Some(pos.id.clone()),
            OrderAction::Rollback,
            OrderStatus::Ok,
            Exchange::Binance,
            "BTCUSDT",
            Side::Sell,
            0.01,
        );
        assert!(store
            .insert_with_orders(&pos, &[long.clone(), bad])
            .await
            .is_err());
        assert!(store.get(&pos.id).await.unwrap().is_none());

        // The clean pair commits.
        let short = Order::new(
            Some(pos.id.clone()),
            OrderAction::Open,
            OrderStatus::Ok,
            Exchange::Okx,
            "BTCUSDT",
            Side::Sell,
            0.01,
        );
        store
            .insert_with_orders(&pos, &[long, short])
            .await
            .unwrap();
        let stored = store.get(&pos.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
        assert_eq!(stored.long_exchange, Exchange::Binance);
        assert!((stored.entry_spread_rate.unwrap() - 0.3285).abs() < 1e-12);
    }

    #[tokio::test]
    async fn status_transitions_are_forward_only() {
        let db = open_in_memory();
        let store = PositionStore::new(db);

        let pos = position(PositionStatus::Open);
        store.insert_with_orders(&pos, &[]).await.unwrap();

        let exposed = store
            .update_status(&pos.id, PositionStatus::RiskExposed)
            .await
            .unwrap();
        assert_eq!(exposed.status, PositionStatus::RiskExposed);

        let closed = store
            .update_status(&pos.id, PositionStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.closed_at.is_some());

        // Closed is terminal.
        assert!(store
            .update_status(&pos.id, PositionStatus::Open)
            .await
            .is_err());
        assert!(store
            .update_status(&pos.id, PositionStatus::RiskExposed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn open_failed_is_terminal() {
        let db = open_in_memory();
        let store = PositionStore::new(db);
        let pos = position(PositionStatus::OpenFailed);
        store.insert_with_orders(&pos, &[]).await.unwrap();
        assert!(store
            .update_status(&pos.id, PositionStatus::Closed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_open_includes_risk_exposed() {
        let db = open_in_memory();
        let store = PositionStore::new(db);

        let open = position(PositionStatus::Open);
        let exposed = position(PositionStatus::RiskExposed);
        let failed = position(PositionStatus::OpenFailed);
        store.insert_with_orders(&open, &[]).await.unwrap();
        store.insert_with_orders(&exposed, &[]).await.unwrap();
        store.insert_with_orders(&failed, &[]).await.unwrap();

        let open_list = store.list_open().await.unwrap();
        assert_eq!(open_list.len(), 2);
        assert!(open_list.iter().all(|p| p.status == PositionStatus::Open
            || p.status == PositionStatus::RiskExposed));
    }

    #[tokio::test]
    async fn merge_extra_accumulates_keys() {
        let db = open_in_memory();
        let store = PositionStore::new(db);
        let pos = position(PositionStatus::Open);
        store.insert_with_orders(&pos, &[]).await.unwrap();

        store
            .merge_extra(&pos.id, serde_json::json!({"close_note": "partial"}))
            .await
            .unwrap();
        store
            .merge_extra(&pos.id, serde_json::json!({"hedge_id": "abc"}))
            .await
            .unwrap();

        let stored = store.get(&pos.id).await.unwrap().unwrap();
        assert_eq!(stored.extra["close_note"], "partial");
        assert_eq!(stored.extra["hedge_id"], "abc");
    }
}
