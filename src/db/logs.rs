//! Audit streams: monitoring logs, bot logs, and dispatcher metrics.
//!
//! Bot logs go through a channel drained by an independent task so a slow
//! write never blocks a placement.

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{to_ts, Db};

/// One reconciliation audit entry.
#[derive(Debug, Clone, Default)]
pub struct MonitoringLogEntry {
    pub check_type: String,
    pub status: String,
    pub user_id: Option<String>,
    pub symbol: Option<String>,
    pub issues: Vec<String>,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    pub actions: Vec<String>,
}

impl Db {
    pub fn insert_monitoring_log(&self, entry: &MonitoringLogEntry) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO monitoring_logs (
                    check_type, status, user_id, symbol, issues,
                    expected_data, actual_data, actions_taken, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.check_type,
                    entry.status,
                    entry.user_id,
                    entry.symbol,
                    serde_json::to_string(&entry.issues).unwrap_or_default(),
                    entry.expected.as_ref().map(|v| v.to_string()),
                    entry.actual.as_ref().map(|v| v.to_string()),
                    serde_json::to_string(&entry.actions).unwrap_or_default(),
                    to_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_bot_log(
        &self,
        level: &str,
        source: &str,
        user_id: Option<&str>,
        message: &str,
        details: Option<&Value>,
    ) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO bot_logs (level, source, user_id, message, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    level,
                    source,
                    user_id,
                    message,
                    details.map(|v| v.to_string()),
                    to_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_performance_metric(
        &self,
        symbol: &str,
        users_total: usize,
        executed: usize,
        ignored: usize,
        errors: usize,
        elapsed_ms: i64,
    ) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO performance_metrics
                    (symbol, users_total, executed, ignored, errors, elapsed_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    symbol,
                    users_total as i64,
                    executed as i64,
                    ignored as i64,
                    errors as i64,
                    elapsed_ms,
                    to_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }
}

#[derive(Debug)]
struct BotLogMessage {
    level: &'static str,
    source: &'static str,
    user_id: Option<String>,
    message: String,
    details: Option<Value>,
}

/// Fire-and-forget handle to the bot-log consumer task.
#[derive(Clone)]
pub struct BotLogger {
    tx: mpsc::UnboundedSender<BotLogMessage>,
}

impl BotLogger {
    /// Spawn the consumer; dropping every handle shuts it down.
    pub fn spawn(db: Db) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BotLogMessage>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = db.insert_bot_log(
                    msg.level,
                    msg.source,
                    msg.user_id.as_deref(),
                    &msg.message,
                    msg.details.as_ref(),
                ) {
                    warn!("bot log write failed: {e:#}");
                }
            }
        });
        Self { tx }
    }

    /// A logger that drops everything; handy in tests.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn log(
        &self,
        level: &'static str,
        source: &'static str,
        user_id: Option<&str>,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        let _ = self.tx.send(BotLogMessage {
            level,
            source,
            user_id: user_id.map(str::to_string),
            message: message.into(),
            details,
        });
    }

    pub fn info(&self, source: &'static str, user_id: Option<&str>, message: impl Into<String>) {
        self.log("info", source, user_id, message, None);
    }

    pub fn error(&self, source: &'static str, user_id: Option<&str>, message: impl Into<String>) {
        self.log("error", source, user_id, message, None);
    }
}
