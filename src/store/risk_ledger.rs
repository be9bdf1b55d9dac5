// =============================================================================
// RiskLedger — append-only ledger of risk events
// =============================================================================
//
// Events are never deleted; `resolved` flips exactly once (false -> true)
// and resolving an already-resolved event is a no-op. Critical events carry
// full context JSON; the operator is the escalation path, the ledger never
// remediates anything on its own.
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::orders::parse_ts;
use crate::store::Db;
use crate::types::RiskSeverity;

/// A single ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct RiskEvent {
    pub id: String,
    /// Machine tag, e.g. `open_second_leg_failed_rolled_back`.
    pub event_type: String,
    pub severity: RiskSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RiskEvent {
    pub fn new(
        event_type: &str,
        severity: RiskSeverity,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            severity,
            message: message.into(),
            context,
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Query filter for the ledger.
#[derive(Debug, Clone, Default)]
pub struct RiskFilter {
    pub severity: Option<RiskSeverity>,
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RiskEvent> {
    let severity: String = row.get("severity")?;
    let context: String = row.get("context")?;
    let created_at: String = row.get("created_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let resolved: i64 = row.get("resolved")?;

    Ok(RiskEvent {
        id: row.get("id")?,
        event_type: row.get("event_type")?,
        severity: severity.parse().unwrap_or(RiskSeverity::Info),
        message: row.get("message")?,
        context: serde_json::from_str(&context).unwrap_or_else(|_| serde_json::json!({})),
        resolved: resolved != 0,
        created_at: parse_ts(&created_at),
        resolved_at: resolved_at.as_deref().map(parse_ts),
    })
}

pub struct RiskLedger {
    db: Db,
}

impl RiskLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append an event. This write happens before the surrounding operation
    /// responds to its caller; high and critical events are also logged.
    pub async fn append(&self, event: RiskEvent) -> EngineResult<RiskEvent> {
        if event.severity >= RiskSeverity::High {
            warn!(
                event_type = %event.event_type,
                severity = %event.severity,
                message = %event.message,
                "risk event recorded"
            );
        }

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO risk_events (id, event_type, severity, message, context,
                                      resolved, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.event_type,
                event.severity.as_str(),
                event.message,
                event.context.to_string(),
                event.resolved as i64,
                event.created_at.to_rfc3339(),
                event.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(event)
    }

    pub async fn list(&self, filter: &RiskFilter) -> EngineResult<Vec<RiskEvent>> {
        let conn = self.db.lock().await;

        let mut sql = String::from("SELECT * FROM risk_events WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(severity) = filter.severity {
            sql.push_str(" AND severity = ?");
            args.push(Box::new(severity.as_str().to_string()));
        }
        if let Some(resolved) = filter.resolved {
            sql.push_str(" AND resolved = ?");
            args.push(Box::new(resolved as i64));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        args.push(Box::new(filter.limit.unwrap_or(100) as i64));

        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
                row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<RiskEvent>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM risk_events WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], row_to_event)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Flip resolved false -> true. Idempotent on already-resolved events.
    pub async fn resolve(&self, id: &str) -> EngineResult<RiskEvent> {
        {
            let conn = self.db.lock().await;
            let updated = conn.execute(
                "UPDATE risk_events SET resolved = 1, resolved_at = ?2
                 WHERE id = ?1 AND resolved = 0",
                params![id, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                // Either missing or already resolved; disambiguate below.
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM risk_events WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(EngineError::validation(format!(
                        "no risk event with id {id}"
                    )));
                }
            }
        }
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::internal("risk event vanished during resolve"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn ledger() -> RiskLedger {
        RiskLedger::new(open_in_memory())
    }

    #[tokio::test]
    async fn append_and_filtered_list() {
        let ledger = ledger();
        ledger
            .append(RiskEvent::new(
                "open_second_leg_failed_rolled_back",
                RiskSeverity::High,
                "short leg failed on okx; binance leg rolled back",
                serde_json::json!({"symbol": "BTCUSDT"}),
            ))
            .await
            .unwrap();
        ledger
            .append(RiskEvent::new(
                "hedge_order_placed",
                RiskSeverity::Warning,
                "manual hedge",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let all = ledger.list(&RiskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let high_only = ledger
            .list(&RiskFilter {
                severity: Some(RiskSeverity::High),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(high_only.len(), 1);
        assert_eq!(high_only[0].event_type, "open_second_leg_failed_rolled_back");
        assert_eq!(high_only[0].context["symbol"], "BTCUSDT");
    }

    #[tokio::test]
    async fn resolve_flips_once_and_is_idempotent() {
        let ledger = ledger();
        let event = ledger
            .append(RiskEvent::new(
                "rollback_failed",
                RiskSeverity::Critical,
                "one-sided exposure",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert!(!event.resolved);

        let resolved = ledger.resolve(&event.id).await.unwrap();
        assert!(resolved.resolved);
        let first_resolved_at = resolved.resolved_at.unwrap();

        // Second resolve keeps the original resolution timestamp.
        let again = ledger.resolve(&event.id).await.unwrap();
        assert!(again.resolved);
        assert_eq!(again.resolved_at.unwrap(), first_resolved_at);

        let unresolved = ledger
            .list(&RiskFilter {
                resolved: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(unresolved.is_empty());
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_a_validation_error() {
        let ledger = ledger();
        let err = ledger.resolve("nope").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
