//! Position rows: one exchange position instance tracked end-to-end.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::models::Side;
use crate::pricing::PricingSnapshot;

use super::{from_ts, opt_from_ts, to_ts, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// JSON sidecar on every position row. The settings snapshot is the source
/// of truth for reconciliation; live policy only matters for new positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionMetadata {
    pub settings_snapshot: Option<PricingSnapshot>,
    #[serde(default)]
    pub resync_count: u32,
    pub last_resync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub sl_price: Option<f64>,
    pub tp1_price: Option<f64>,
    pub tp1_quantity: Option<f64>,
    pub tp2_price: Option<f64>,
    pub tp2_quantity: Option<f64>,
    pub tp3_price: Option<f64>,
    pub tp3_quantity: Option<f64>,
    pub sl_order_id: Option<String>,
    pub tp1_order_id: Option<String>,
    pub tp2_order_id: Option<String>,
    pub tp3_order_id: Option<String>,
    pub tp1_filled: bool,
    pub tp2_filled: bool,
    pub tp3_filled: bool,
    pub status: PositionStatus,
    pub close_reason: Option<String>,
    pub close_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub check_errors: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub alert_id: Option<String>,
    pub metadata: PositionMetadata,
}

impl PositionRow {
    pub fn tp_price(&self, level: u8) -> Option<f64> {
        match level {
            1 => self.tp1_price,
            2 => self.tp2_price,
            3 => self.tp3_price,
            _ => None,
        }
    }

    pub fn tp_quantity(&self, level: u8) -> Option<f64> {
        match level {
            1 => self.tp1_quantity,
            2 => self.tp2_quantity,
            3 => self.tp3_quantity,
            _ => None,
        }
    }

    pub fn tp_order_id(&self, level: u8) -> Option<&str> {
        match level {
            1 => self.tp1_order_id.as_deref(),
            2 => self.tp2_order_id.as_deref(),
            3 => self.tp3_order_id.as_deref(),
            _ => None,
        }
    }

    pub fn tp_filled(&self, level: u8) -> bool {
        match level {
            1 => self.tp1_filled,
            2 => self.tp2_filled,
            3 => self.tp3_filled,
            _ => false,
        }
    }

    /// Fill flags are monotone: this only ever sets.
    pub fn set_tp_filled(&mut self, level: u8) {
        match level {
            1 => self.tp1_filled = true,
            2 => self.tp2_filled = true,
            3 => self.tp3_filled = true,
            _ => {}
        }
    }

    pub fn set_tp_order(&mut self, level: u8, order_id: Option<String>) {
        match level {
            1 => self.tp1_order_id = order_id,
            2 => self.tp2_order_id = order_id,
            3 => self.tp3_order_id = order_id,
            _ => {}
        }
    }

    pub fn set_tp_target(&mut self, level: u8, price: f64, quantity: f64) {
        match level {
            1 => {
                self.tp1_price = Some(price);
                self.tp1_quantity = Some(quantity);
            }
            2 => {
                self.tp2_price = Some(price);
                self.tp2_quantity = Some(quantity);
            }
            3 => {
                self.tp3_price = Some(price);
                self.tp3_quantity = Some(quantity);
            }
            _ => {}
        }
    }

    pub fn filled_flags(&self) -> [bool; 3] {
        [self.tp1_filled, self.tp2_filled, self.tp3_filled]
    }

    pub fn filled_count(&self) -> u8 {
        self.filled_flags().iter().filter(|f| **f).count() as u8
    }

    /// All bracket order ids currently recorded on the row.
    pub fn known_order_ids(&self) -> Vec<&str> {
        [
            self.sl_order_id.as_deref(),
            self.tp1_order_id.as_deref(),
            self.tp2_order_id.as_deref(),
            self.tp3_order_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn within_resync_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.last_resync_at {
            Some(at) => now - at < Duration::minutes(5),
            None => false,
        }
    }

    pub fn unrealized(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.quantity * self.side.sign()
    }
}

fn map_row(row: &Row) -> rusqlite::Result<PositionRow> {
    let side: String = row.get("side")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(PositionRow {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).unwrap_or(Side::Buy),
        entry_price: row.get("entry_price")?,
        quantity: row.get("quantity")?,
        leverage: row.get::<_, i64>("leverage")? as u32,
        sl_price: row.get("sl_price")?,
        tp1_price: row.get("tp1_price")?,
        tp1_quantity: row.get("tp1_quantity")?,
        tp2_price: row.get("tp2_price")?,
        tp2_quantity: row.get("tp2_quantity")?,
        tp3_price: row.get("tp3_price")?,
        tp3_quantity: row.get("tp3_quantity")?,
        sl_order_id: row.get("sl_order_id")?,
        tp1_order_id: row.get("tp1_order_id")?,
        tp2_order_id: row.get("tp2_order_id")?,
        tp3_order_id: row.get("tp3_order_id")?,
        tp1_filled: row.get::<_, i64>("tp1_filled")? != 0,
        tp2_filled: row.get::<_, i64>("tp2_filled")? != 0,
        tp3_filled: row.get::<_, i64>("tp3_filled")? != 0,
        status: if status == "closed" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
        close_reason: row.get("close_reason")?,
        close_price: row.get("close_price")?,
        realized_pnl: row.get("realized_pnl")?,
        current_price: row.get("current_price")?,
        unrealized_pnl: row.get("unrealized_pnl")?,
        last_check_at: opt_from_ts(row.get("last_check_at")?),
        check_errors: row.get("check_errors")?,
        last_error: row.get("last_error")?,
        created_at: from_ts(&row.get::<_, String>("created_at")?),
        closed_at: opt_from_ts(row.get("closed_at")?),
        alert_id: row.get("alert_id")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

impl Db {
    /// Returns false when the open-position unique constraint fired (a
    /// concurrent writer won); callers re-read the winner and continue.
    pub fn insert_position(&self, pos: &PositionRow) -> Result<bool> {
        let metadata = serde_json::to_string(&pos.metadata)?;
        self.with(|conn| {
            let result = conn.execute(
                "INSERT INTO positions (
                    id, user_id, symbol, side, entry_price, quantity, leverage,
                    sl_price, tp1_price, tp1_quantity, tp2_price, tp2_quantity,
                    tp3_price, tp3_quantity, sl_order_id, tp1_order_id,
                    tp2_order_id, tp3_order_id, tp1_filled, tp2_filled,
                    tp3_filled, status, created_at, alert_id, metadata
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                           ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22,
                           ?23, ?24, ?25)",
                params![
                    pos.id,
                    pos.user_id,
                    pos.symbol,
                    pos.side.as_str(),
                    pos.entry_price,
                    pos.quantity,
                    pos.leverage as i64,
                    pos.sl_price,
                    pos.tp1_price,
                    pos.tp1_quantity,
                    pos.tp2_price,
                    pos.tp2_quantity,
                    pos.tp3_price,
                    pos.tp3_quantity,
                    pos.sl_order_id,
                    pos.tp1_order_id,
                    pos.tp2_order_id,
                    pos.tp3_order_id,
                    pos.tp1_filled as i64,
                    pos.tp2_filled as i64,
                    pos.tp3_filled as i64,
                    pos.status.as_str(),
                    to_ts(pos.created_at),
                    pos.alert_id,
                    metadata,
                ],
            );
            match result {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Persist every mutable column of the row.
    pub fn update_position(&self, pos: &PositionRow) -> Result<()> {
        let metadata = serde_json::to_string(&pos.metadata)?;
        self.with(|conn| {
            conn.execute(
                "UPDATE positions SET
                    quantity = ?2, sl_price = ?3,
                    tp1_price = ?4, tp1_quantity = ?5,
                    tp2_price = ?6, tp2_quantity = ?7,
                    tp3_price = ?8, tp3_quantity = ?9,
                    sl_order_id = ?10, tp1_order_id = ?11,
                    tp2_order_id = ?12, tp3_order_id = ?13,
                    tp1_filled = ?14, tp2_filled = ?15, tp3_filled = ?16,
                    status = ?17, close_reason = ?18, close_price = ?19,
                    realized_pnl = ?20, current_price = ?21,
                    unrealized_pnl = ?22, last_check_at = ?23,
                    check_errors = ?24, last_error = ?25, closed_at = ?26,
                    metadata = ?27
                 WHERE id = ?1",
                params![
                    pos.id,
                    pos.quantity,
                    pos.sl_price,
                    pos.tp1_price,
                    pos.tp1_quantity,
                    pos.tp2_price,
                    pos.tp2_quantity,
                    pos.tp3_price,
                    pos.tp3_quantity,
                    pos.sl_order_id,
                    pos.tp1_order_id,
                    pos.tp2_order_id,
                    pos.tp3_order_id,
                    pos.tp1_filled as i64,
                    pos.tp2_filled as i64,
                    pos.tp3_filled as i64,
                    pos.status.as_str(),
                    pos.close_reason,
                    pos.close_price,
                    pos.realized_pnl,
                    pos.current_price,
                    pos.unrealized_pnl,
                    pos.last_check_at.map(to_ts),
                    pos.check_errors,
                    pos.last_error,
                    pos.closed_at.map(to_ts),
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_position_row(&self, id: &str) -> Result<Option<PositionRow>> {
        self.with(|conn| {
            conn.query_row("SELECT * FROM positions WHERE id = ?1", params![id], map_row)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
        })
    }

    pub fn open_positions_for_user(&self, user_id: &str) -> Result<Vec<PositionRow>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM positions WHERE user_id = ?1 AND status = 'open'
                 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![user_id], map_row)?;
            rows.collect()
        })
    }

    pub fn open_position_by_key(
        &self,
        user_id: &str,
        symbol: &str,
        side: Side,
    ) -> Result<Option<PositionRow>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT * FROM positions
                 WHERE user_id = ?1 AND symbol = ?2 AND side = ?3 AND status = 'open'",
                params![user_id, symbol, side.as_str()],
                map_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn count_open_positions(&self, user_id: &str) -> Result<u32> {
        self.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM positions WHERE user_id = ?1 AND status = 'open'",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u32)
        })
    }

    /// Sum of realized PnL on positions closed at or after `since`.
    pub fn realized_pnl_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<f64> {
        self.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions
                 WHERE user_id = ?1 AND status = 'closed' AND closed_at >= ?2",
                params![user_id, to_ts(since)],
                |row| row.get(0),
            )
        })
    }

    pub fn recent_positions(&self, limit: usize) -> Result<Vec<PositionRow>> {
        self.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM positions ORDER BY created_at DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit as i64], map_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_position(id: &str, user: &str, symbol: &str) -> PositionRow {
        PositionRow {
            id: id.into(),
            user_id: user.into(),
            symbol: symbol.into(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            leverage: 10,
            sl_price: Some(98.0),
            tp1_price: Some(103.0),
            tp1_quantity: Some(0.6),
            tp2_price: Some(105.0),
            tp2_quantity: Some(0.4),
            tp3_price: None,
            tp3_quantity: None,
            sl_order_id: Some("sl-1".into()),
            tp1_order_id: Some("tp1-1".into()),
            tp2_order_id: Some("tp2-1".into()),
            tp3_order_id: None,
            tp1_filled: false,
            tp2_filled: false,
            tp3_filled: false,
            status: PositionStatus::Open,
            close_reason: None,
            close_price: None,
            realized_pnl: None,
            current_price: None,
            unrealized_pnl: None,
            last_check_at: None,
            check_errors: 0,
            last_error: None,
            created_at: Utc::now(),
            closed_at: None,
            alert_id: None,
            metadata: PositionMetadata::default(),
        }
    }

    #[test]
    fn open_unique_constraint_reports_conflict() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.insert_position(&sample_position("p1", "u1", "BTCUSDT")).unwrap());
        // Same (user, symbol, side, open) loses the race.
        assert!(!db.insert_position(&sample_position("p2", "u1", "BTCUSDT")).unwrap());
        // A different symbol is fine.
        assert!(db.insert_position(&sample_position("p3", "u1", "ETHUSDT")).unwrap());
    }

    #[test]
    fn closed_position_frees_the_slot() {
        let db = Db::open_in_memory().unwrap();
        let mut pos = sample_position("p1", "u1", "BTCUSDT");
        db.insert_position(&pos).unwrap();

        pos.status = PositionStatus::Closed;
        pos.close_reason = Some("tp1_hit".into());
        pos.close_price = Some(103.0);
        pos.realized_pnl = Some(3.0);
        pos.closed_at = Some(Utc::now());
        db.update_position(&pos).unwrap();

        assert!(db.insert_position(&sample_position("p2", "u1", "BTCUSDT")).unwrap());
        assert_eq!(db.count_open_positions("u1").unwrap(), 1);

        let closed = db.get_position_row("p1").unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("tp1_hit"));
    }

    #[test]
    fn metadata_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let mut pos = sample_position("p1", "u1", "BTCUSDT");
        pos.metadata.resync_count = 2;
        pos.metadata.recovered = true;
        pos.metadata.last_resync_at = Some(Utc::now());
        db.insert_position(&pos).unwrap();

        let row = db.get_position_row("p1").unwrap().unwrap();
        assert_eq!(row.metadata.resync_count, 2);
        assert!(row.metadata.recovered);
        assert!(row.metadata.last_resync_at.is_some());
    }

    #[test]
    fn resync_cooldown_boundary() {
        let now = Utc::now();
        let mut pos = sample_position("p1", "u1", "BTCUSDT");

        pos.metadata.last_resync_at = Some(now - Duration::seconds(4 * 60 + 59));
        assert!(pos.within_resync_cooldown(now));

        pos.metadata.last_resync_at = Some(now - Duration::seconds(5 * 60 + 1));
        assert!(!pos.within_resync_cooldown(now));
    }

    #[test]
    fn realized_pnl_window() {
        let db = Db::open_in_memory().unwrap();
        let mut pos = sample_position("p1", "u1", "BTCUSDT");
        pos.status = PositionStatus::Closed;
        pos.realized_pnl = Some(-25.0);
        pos.closed_at = Some(Utc::now());
        db.insert_position(&pos).unwrap();
        db.update_position(&pos).unwrap();

        let today = db
            .realized_pnl_since("u1", Utc::now() - Duration::hours(24))
            .unwrap();
        assert_eq!(today, -25.0);
    }
}
