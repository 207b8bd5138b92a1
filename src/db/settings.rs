//! User/admin settings, API key rows, and the symbol ban list.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{to_ts, Db};

#[derive(Debug, Clone)]
pub struct UserSettingsRow {
    pub user_id: String,
    pub bot_active: bool,
    pub settings: Value,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub user_id: String,
    pub api_key_enc: String,
    pub secret_enc: String,
    pub passphrase_enc: String,
    pub is_active: bool,
}

impl Db {
    pub fn upsert_user_settings(&self, user_id: &str, settings: &Value) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO user_settings (user_id, settings_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    settings_json = excluded.settings_json,
                    updated_at = excluded.updated_at",
                params![user_id, json, to_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettingsRow>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT user_id, bot_active, settings_json FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let json: String = row.get(2)?;
                    Ok(UserSettingsRow {
                        user_id: row.get(0)?,
                        bot_active: row.get::<_, i64>(1)? != 0,
                        settings: serde_json::from_str(&json).unwrap_or(Value::Null),
                    })
                },
            )
            .optional()
        })
    }

    pub fn set_bot_active(&self, user_id: &str, active: bool) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE user_settings SET bot_active = ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id, active as i64, to_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Every user with a settings row; the dispatcher's fan-out set.
    pub fn list_user_ids(&self) -> Result<Vec<String>> {
        self.with(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM user_settings ORDER BY user_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn upsert_admin_settings(&self, settings: &Value) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO admin_settings (id, settings_json, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    settings_json = excluded.settings_json,
                    updated_at = excluded.updated_at",
                params![json, to_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_admin_settings(&self) -> Result<Option<Value>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT settings_json FROM admin_settings WHERE id = 1",
                [],
                |row| {
                    let json: String = row.get(0)?;
                    Ok(serde_json::from_str(&json).unwrap_or(Value::Null))
                },
            )
            .optional()
        })
    }

    pub fn upsert_api_keys(
        &self,
        user_id: &str,
        api_key_enc: &str,
        secret_enc: &str,
        passphrase_enc: &str,
    ) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO user_api_keys
                    (user_id, api_key_enc, secret_enc, passphrase_enc, is_active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    api_key_enc = excluded.api_key_enc,
                    secret_enc = excluded.secret_enc,
                    passphrase_enc = excluded.passphrase_enc,
                    is_active = 1,
                    updated_at = excluded.updated_at",
                params![user_id, api_key_enc, secret_enc, passphrase_enc, to_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_api_keys(&self, user_id: &str) -> Result<Option<ApiKeyRow>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT user_id, api_key_enc, secret_enc, passphrase_enc, is_active
                 FROM user_api_keys WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(ApiKeyRow {
                        user_id: row.get(0)?,
                        api_key_enc: row.get(1)?,
                        secret_enc: row.get(2)?,
                        passphrase_enc: row.get(3)?,
                        is_active: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()
        })
    }

    /// Users the reconciler walks: active credentials on file.
    pub fn list_users_with_active_keys(&self) -> Result<Vec<String>> {
        self.with(|conn| {
            let mut stmt = conn
                .prepare("SELECT user_id FROM user_api_keys WHERE is_active = 1 ORDER BY user_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn ban_symbol(&self, user_id: &str, symbol: &str, reason: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO banned_symbols (user_id, symbol, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, symbol, reason, to_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn is_symbol_banned(&self, user_id: &str, symbol: &str) -> Result<bool> {
        self.with(|conn| {
            conn.query_row(
                "SELECT 1 FROM banned_symbols WHERE user_id = ?1 AND symbol = ?2",
                params![user_id, symbol],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
        })
    }
}
