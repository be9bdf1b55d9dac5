// =============================================================================
// OrderStore — per-leg order rows
// =============================================================================
//
// Rows are written once in their terminal (or pending-reconciliation) state
// by the execution coordinator. A rollback order must reference a position
// that already has a failed sibling leg; the store enforces that invariant
// on insert.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::Db;
use crate::types::{Exchange, OrderAction, OrderStatus, Side};

/// One order leg as persisted. Quantities are base-asset units.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub position_id: Option<String>,
    pub action: OrderAction,
    pub status: OrderStatus,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub filled_qty: Option<f64>,
    pub avg_price: Option<f64>,
    pub exchange_order_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Fresh order row with generated id and timestamps.
    pub fn new(
        position_id: Option<String>,
        action: OrderAction,
        status: OrderStatus,
        exchange: Exchange,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            position_id,
            action,
            status,
            exchange,
            symbol: symbol.to_string(),
            side,
            quantity,
            filled_qty: None,
            avg_price: None,
            exchange_order_id: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let action: String = row.get("action")?;
    let status: String = row.get("status")?;
    let exchange: String = row.get("exchange")?;
    let side: String = row.get("side")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Order {
        id: row.get("id")?,
        position_id: row.get("position_id")?,
        action: action.parse().unwrap_or(OrderAction::Open),
        status: status.parse().unwrap_or(OrderStatus::Failed),
        exchange: exchange.parse().unwrap_or(Exchange::Binance),
        symbol: row.get("symbol")?,
        side: if side == "sell" { Side::Sell } else { Side::Buy },
        quantity: row.get("quantity")?,
        filled_qty: row.get("filled_qty")?,
        avg_price: row.get("avg_price")?,
        exchange_order_id: row.get("exchange_order_id")?,
        note: row.get("note")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Insert an order within an existing connection context, enforcing the
/// rollback-sibling invariant. Shared by the store and by the transactional
/// position insert.
pub(crate) fn insert_order(conn: &Connection, order: &Order) -> EngineResult<()> {
    if order.action == OrderAction::Rollback {
        let position_id = order.position_id.as_deref().ok_or_else(|| {
            EngineError::internal("rollback order must reference a position")
        })?;
        let failed_siblings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE position_id = ?1 AND status = 'failed'",
            params![position_id],
            |row| row.get(0),
        )?;
        if failed_siblings == 0 {
            return Err(EngineError::internal(
                "rollback order requires a failed sibling leg",
            ));
        }
    }

    conn.execute(
        "INSERT INTO orders (id, position_id, action, status, exchange, symbol, side,
                             quantity, filled_qty, avg_price, exchange_order_id, note,
                             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            order.id,
            order.position_id,
            order.action.as_str(),
            order.status.as_str(),
            order.exchange.as_str(),
            order.symbol,
            order.side.as_str(),
            order.quantity,
            order.filled_qty,
            order.avg_price,
            order.exchange_order_id,
            order.note,
            order.created_at.to_rfc3339(),
            order.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub struct OrderStore {
    db: Db,
}

impl OrderStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, order: &Order) -> EngineResult<()> {
        let conn = self.db.lock().await;
        insert_order(&conn, order)
    }

    /// Newest-first page.
    pub async fn list(&self, limit: usize) -> EngineResult<Vec<Order>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM orders ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let orders = stmt
            .query_map(params![limit as i64], row_to_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub async fn list_for_position(&self, position_id: &str) -> EngineResult<Vec<Order>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM orders WHERE position_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let orders = stmt
            .query_map(params![position_id], row_to_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }
}

// =============================================================================
// Tests
// =============================================================================
