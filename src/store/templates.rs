// =============================================================================
// TemplateStore — strategy parameter presets
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::orders::parse_ts;
use crate::store::Db;
use crate::types::Exchange;

/// A saved strategy preset; `name` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyTemplate {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub quantity: Option<f64>,
    pub notional_usd: Option<f64>,
    pub leverage: Option<u32>,
    pub hold_hours: Option<f64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create/update payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub hold_hours: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl TemplateInput {
    fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("template name is required"));
        }
        if self.long_exchange == self.short_exchange {
            return Err(EngineError::validation(
                "long and short exchange must differ",
            ));
        }
        Ok(())
    }
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<StrategyTemplate> {
    let long_exchange: String = row.get("long_exchange")?;
    let short_exchange: String = row.get("short_exchange")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let leverage: Option<i64> = row.get("leverage")?;

    Ok(StrategyTemplate {
        id: row.get("id")?,
        name: row.get("name")?,
        symbol: row.get("symbol")?,
        long_exchange: long_exchange.parse().unwrap_or(Exchange::Binance),
        short_exchange: short_exchange.parse().unwrap_or(Exchange::Okx),
        quantity: row.get("quantity")?,
        notional_usd: row.get("notional_usd")?,
        leverage: leverage.map(|l| l as u32),
        hold_hours: row.get("hold_hours")?,
        note: row.get("note")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct TemplateStore {
    db: Db,
}

impl TemplateStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: TemplateInput) -> EngineResult<StrategyTemplate> {
        input.validate()?;
        let now = Utc::now();
        let template = StrategyTemplate {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            symbol: input.symbol.to_uppercase(),
            long_exchange: input.long_exchange,
            short_exchange: input.short_exchange,
            quantity: input.quantity,
            notional_usd: input.notional_usd,
            leverage: input.leverage,
            hold_hours: input.hold_hours,
            note: input.note,
            created_at: now,
            updated_at: now,
        };

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO strategy_templates (id, name, symbol, long_exchange, short_exchange,
                                             quantity, notional_usd, leverage, hold_hours, note,
                                             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                template.id,
                template.name,
                template.symbol,
                template.long_exchange.as_str(),
                template.short_exchange.as_str(),
                template.quantity,
                template.notional_usd,
                template.leverage.map(|l| l as i64),
                template.hold_hours,
                template.note,
                template.created_at.to_rfc3339(),
                template.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::validation(format!("template name '{}' already exists", template.name))
            } else {
                e.into()
            }
        })?;
        Ok(template)
    }

    pub async fn list(&self) -> EngineResult<Vec<StrategyTemplate>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM strategy_templates ORDER BY name ASC")?;
        let templates = stmt
            .query_map([], row_to_template)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(templates)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<StrategyTemplate>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM strategy_templates WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], row_to_template)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn update(&self, id: &str, input: TemplateInput) -> EngineResult<StrategyTemplate> {
        input.validate()?;
        let conn = self.db.lock().await;
        let updated = conn
            .execute(
                "UPDATE strategy_templates
                 SET name = ?2, symbol = ?3, long_exchange = ?4, short_exchange = ?5,
                     quantity = ?6, notional_usd = ?7, leverage = ?8, hold_hours = ?9,
                     note = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    id,
                    input.name,
                    input.symbol.to_uppercase(),
                    input.long_exchange.as_str(),
                    input.short_exchange.as_str(),
                    input.quantity,
                    input.notional_usd,
                    input.leverage.map(|l| l as i64),
                    input.hold_hours,
                    input.note,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EngineError::validation(format!("template name '{}' already exists", input.name))
                } else {
                    EngineError::from(e)
                }
            })?;
        if updated == 0 {
            return Err(EngineError::validation(format!("no template with id {id}")));
        }

        let mut stmt = conn.prepare("SELECT * FROM strategy_templates WHERE id = ?1")?;
        let template = stmt.query_row(params![id], row_to_template)?;
        Ok(template)
    }

    pub async fn delete(&self, id: &str) -> EngineResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM strategy_templates WHERE id = ?1",
            params![id],
        )?;
        Ok(deleted > 0)
    }
}

// =============================================================================
// Tests
// =============================================================================
