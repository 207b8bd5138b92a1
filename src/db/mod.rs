//! Database layer
//!
//! A single SQLite handle shared across the engine. WAL mode lets the read
//! endpoints run concurrently with monitor writes; every position row is the
//! serialization point for mutations about that position.

pub mod alerts;
pub mod locks;
pub mod logs;
pub mod positions;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

pub use alerts::{AlertRow, AlertStatus};
pub use logs::{BotLogger, MonitoringLogEntry};
pub use positions::{PositionMetadata, PositionRow, PositionStatus};
pub use settings::{ApiKeyRow, UserSettingsRow};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    sl REAL,
    tp1 REAL,
    tp2 REAL,
    tp3 REAL,
    main_tp REAL,
    atr REAL,
    leverage INTEGER,
    strength REAL,
    tier TEXT,
    mode TEXT,
    raw_payload TEXT NOT NULL,
    tv_ts INTEGER,
    webhook_received_at TEXT NOT NULL,
    exchange_executed_at TEXT,
    webhook_latency_ms INTEGER,
    execution_latency_ms INTEGER,
    total_latency_ms INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    is_test INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_alerts_user
    ON alerts(user_id, webhook_received_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    quantity REAL NOT NULL,
    leverage INTEGER NOT NULL,
    sl_price REAL,
    tp1_price REAL,
    tp1_quantity REAL,
    tp2_price REAL,
    tp2_quantity REAL,
    tp3_price REAL,
    tp3_quantity REAL,
    sl_order_id TEXT,
    tp1_order_id TEXT,
    tp2_order_id TEXT,
    tp3_order_id TEXT,
    tp1_filled INTEGER NOT NULL DEFAULT 0,
    tp2_filled INTEGER NOT NULL DEFAULT 0,
    tp3_filled INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'open',
    close_reason TEXT,
    close_price REAL,
    realized_pnl REAL,
    current_price REAL,
    unrealized_pnl REAL,
    last_check_at TEXT,
    check_errors INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    closed_at TEXT,
    alert_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

-- One open position per (user, symbol, side); closed rows accumulate.
CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique
    ON positions(user_id, symbol, side) WHERE status = 'open';

CREATE INDEX IF NOT EXISTS idx_positions_user_status
    ON positions(user_id, status);

CREATE INDEX IF NOT EXISTS idx_positions_closed_at
    ON positions(user_id, closed_at) WHERE status = 'closed';

CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    bot_active INTEGER NOT NULL DEFAULT 1,
    settings_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    settings_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_api_keys (
    user_id TEXT PRIMARY KEY,
    api_key_enc TEXT NOT NULL,
    secret_enc TEXT NOT NULL,
    passphrase_enc TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitor_locks (
    lock_type TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitoring_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    check_type TEXT NOT NULL,
    status TEXT NOT NULL,
    user_id TEXT,
    symbol TEXT,
    issues TEXT,
    expected_data TEXT,
    actual_data TEXT,
    actions_taken TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_monitoring_logs_recent
    ON monitoring_logs(created_at DESC);

CREATE TABLE IF NOT EXISTS bot_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    source TEXT NOT NULL,
    user_id TEXT,
    message TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    users_total INTEGER NOT NULL,
    executed INTEGER NOT NULL,
    ignored INTEGER NOT NULL,
    errors INTEGER NOT NULL,
    elapsed_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS banned_symbols (
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, symbol)
);
"#;

/// Shared database handle. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open database {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("init schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("init schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(Into::into)
    }
}

// Millisecond precision with a Z suffix keeps SQLite's date functions and
// lexicographic ordering happy.
pub(crate) fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn from_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn opt_from_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(from_ts)
}
