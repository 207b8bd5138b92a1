//! Alert rows: one external signal snapshot per user.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::models::Side;

use super::{from_ts, opt_from_ts, to_ts, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Ignored,
    Executed,
    Error,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Ignored => "ignored",
            AlertStatus::Executed => "executed",
            AlertStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ignored" => AlertStatus::Ignored,
            "executed" => AlertStatus::Executed,
            "error" => AlertStatus::Error,
            _ => AlertStatus::Pending,
        }
    }
}

/// Immutable after insert except status, error, execution timestamp and the
/// derived latencies.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRow {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub sl: Option<f64>,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
    pub main_tp: Option<f64>,
    pub atr: Option<f64>,
    pub leverage: Option<u32>,
    pub strength: Option<f64>,
    pub tier: Option<String>,
    pub mode: Option<String>,
    pub raw_payload: String,
    pub tv_ts: Option<i64>,
    pub webhook_received_at: DateTime<Utc>,
    pub exchange_executed_at: Option<DateTime<Utc>>,
    pub webhook_latency_ms: Option<i64>,
    pub execution_latency_ms: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub status: AlertStatus,
    pub error_message: Option<String>,
    pub is_test: bool,
}

fn map_row(row: &Row) -> rusqlite::Result<AlertRow> {
    let side: String = row.get("side")?;
    let status: String = row.get("status")?;
    Ok(AlertRow {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side).unwrap_or(Side::Buy),
        entry_price: row.get("entry_price")?,
        sl: row.get("sl")?,
        tp1: row.get("tp1")?,
        tp2: row.get("tp2")?,
        tp3: row.get("tp3")?,
        main_tp: row.get("main_tp")?,
        atr: row.get("atr")?,
        leverage: row.get::<_, Option<i64>>("leverage")?.map(|l| l as u32),
        strength: row.get("strength")?,
        tier: row.get("tier")?,
        mode: row.get("mode")?,
        raw_payload: row.get("raw_payload")?,
        tv_ts: row.get("tv_ts")?,
        webhook_received_at: from_ts(&row.get::<_, String>("webhook_received_at")?),
        exchange_executed_at: opt_from_ts(row.get("exchange_executed_at")?),
        webhook_latency_ms: row.get("webhook_latency_ms")?,
        execution_latency_ms: row.get("execution_latency_ms")?,
        total_latency_ms: row.get("total_latency_ms")?,
        status: AlertStatus::parse(&status),
        error_message: row.get("error_message")?,
        is_test: row.get::<_, i64>("is_test")? != 0,
    })
}

impl Db {
    pub fn insert_alert(&self, alert: &AlertRow) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO alerts (
                    id, user_id, symbol, side, entry_price, sl, tp1, tp2, tp3,
                    main_tp, atr, leverage, strength, tier, mode, raw_payload,
                    tv_ts, webhook_received_at, webhook_latency_ms, status, is_test
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                           ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    alert.id,
                    alert.user_id,
                    alert.symbol,
                    alert.side.as_str(),
                    alert.entry_price,
                    alert.sl,
                    alert.tp1,
                    alert.tp2,
                    alert.tp3,
                    alert.main_tp,
                    alert.atr,
                    alert.leverage.map(|l| l as i64),
                    alert.strength,
                    alert.tier,
                    alert.mode,
                    alert.raw_payload,
                    alert.tv_ts,
                    to_ts(alert.webhook_received_at),
                    alert.webhook_latency_ms,
                    alert.status.as_str(),
                    alert.is_test as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn mark_alert_ignored(&self, alert_id: &str, reason: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE alerts SET status = 'ignored', error_message = ?2 WHERE id = ?1",
                params![alert_id, reason],
            )?;
            Ok(())
        })
    }

    pub fn mark_alert_error(&self, alert_id: &str, message: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE alerts SET status = 'error', error_message = ?2 WHERE id = ?1",
                params![alert_id, message],
            )?;
            Ok(())
        })
    }

    /// Record execution and the derived latencies.
    pub fn mark_alert_executed(&self, alert_id: &str, executed_at: DateTime<Utc>) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE alerts SET
                    status = 'executed',
                    exchange_executed_at = ?2,
                    execution_latency_ms =
                        CAST((julianday(?2) - julianday(webhook_received_at)) * 86400000 AS INTEGER),
                    total_latency_ms =
                        COALESCE(webhook_latency_ms, 0) +
                        CAST((julianday(?2) - julianday(webhook_received_at)) * 86400000 AS INTEGER)
                 WHERE id = ?1",
                params![alert_id, to_ts(executed_at)],
            )?;
            Ok(())
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<AlertRow>> {
        self.with(|conn| {
            conn.query_row("SELECT * FROM alerts WHERE id = ?1", params![alert_id], map_row)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
        })
    }

    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRow>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM alerts ORDER BY webhook_received_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(id: &str) -> AlertRow {
        AlertRow {
            id: id.into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            entry_price: 50_000.0,
            sl: Some(49_000.0),
            tp1: Some(51_000.0),
            tp2: None,
            tp3: None,
            main_tp: None,
            atr: Some(120.0),
            leverage: Some(10),
            strength: Some(0.8),
            tier: Some("Premium".into()),
            mode: None,
            raw_payload: "{}".into(),
            tv_ts: Some(1_700_000_000_000),
            webhook_received_at: Utc::now(),
            exchange_executed_at: None,
            webhook_latency_ms: Some(150),
            execution_latency_ms: None,
            total_latency_ms: None,
            status: AlertStatus::Pending,
            error_message: None,
            is_test: false,
        }
    }

    #[test]
    fn insert_and_transition() {
        let db = Db::open_in_memory().unwrap();
        let alert = sample("a1");
        db.insert_alert(&alert).unwrap();

        db.mark_alert_ignored("a1", "bot disabled").unwrap();
        let row = db.get_alert("a1").unwrap().unwrap();
        assert_eq!(row.status, AlertStatus::Ignored);
        assert_eq!(row.error_message.as_deref(), Some("bot disabled"));
    }

    #[test]
    fn executed_computes_latencies() {
        let db = Db::open_in_memory().unwrap();
        let alert = sample("a2");
        let received = alert.webhook_received_at;
        db.insert_alert(&alert).unwrap();

        db.mark_alert_executed("a2", received + Duration::milliseconds(2000))
            .unwrap();
        let row = db.get_alert("a2").unwrap().unwrap();
        assert_eq!(row.status, AlertStatus::Executed);
        let exec = row.execution_latency_ms.unwrap();
        assert!((1900..=2100).contains(&exec), "exec latency {exec}");
        assert_eq!(row.total_latency_ms.unwrap(), 150 + exec);
    }

    #[test]
    fn recent_orders_by_time() {
        let db = Db::open_in_memory().unwrap();
        for (i, id) in ["a1", "a2", "a3"].iter().enumerate() {
            let mut alert = sample(id);
            alert.webhook_received_at = Utc::now() + Duration::seconds(i as i64);
            db.insert_alert(&alert).unwrap();
        }
        let rows = db.recent_alerts(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "a3");
    }
}
