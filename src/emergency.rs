//! Emergency controller
//!
//! On demand per user: disable the bot, cancel brackets, flat-close every
//! open position and record realized PnL. Safe to call repeatedly; already
//! closed positions are left alone.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::credentials::CredentialStatus;
use crate::db::MonitoringLogEntry;
use crate::monitor::finalize;
use crate::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyReport {
    pub user_id: String,
    pub closed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub async fn emergency_shutdown(state: &Arc<AppState>, user_id: &str) -> Result<EmergencyReport> {
    state.db.set_bot_active(user_id, false)?;
    info!(user_id, "emergency shutdown: bot disabled");

    let creds = match state.vault.get(user_id)? {
        CredentialStatus::Ready(creds) => creds,
        CredentialStatus::NotConfigured => bail!("user {user_id} has no api keys configured"),
        CredentialStatus::Inactive => bail!("user {user_id} api keys are inactive"),
    };
    let exchange = state.connector.connect(&creds);

    let mut report = EmergencyReport {
        user_id: user_id.to_string(),
        closed: Vec::new(),
        failed: Vec::new(),
    };

    for mut pos in state.db.open_positions_for_user(user_id)? {
        let symbol = pos.symbol.clone();
        match finalize::close_and_finalize(state, &exchange, &mut pos, "emergency_shutdown").await {
            Ok(()) => report.closed.push(symbol),
            Err(e) => {
                error!(user_id, symbol = %symbol, "emergency close failed: {e:#}");
                report.failed.push((symbol, format!("{e:#}")));
            }
        }
    }

    let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
        check_type: "emergency_close".into(),
        status: if report.failed.is_empty() {
            "completed".into()
        } else {
            "partial".into()
        },
        user_id: Some(user_id.to_string()),
        symbol: None,
        issues: Vec::new(),
        expected: None,
        actual: Some(json!({
            "closed": report.closed,
            "failed": report.failed.len(),
        })),
        actions: report
            .closed
            .iter()
            .map(|s| format!("closed {s}"))
            .collect(),
    });
    state.bot_log.info(
        "emergency",
        Some(user_id),
        format!(
            "emergency shutdown: {} closed, {} failed",
            report.closed.len(),
            report.failed.len()
        ),
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PositionMetadata, PositionRow, PositionStatus};
    use crate::exchange::HoldSide;
    use crate::models::Side;
    use crate::testutil::{seed_user, test_state, MockExchange};
    use chrono::Utc;
    use serde_json::json;

    fn open_row(id: &str, symbol: &str) -> PositionRow {
        PositionRow {
            id: id.into(),
            user_id: "u1".into(),
            symbol: symbol.into(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            leverage: 10,
            sl_price: Some(98.0),
            tp1_price: Some(103.0),
            tp1_quantity: Some(1.0),
            tp2_price: None,
            tp2_quantity: None,
            tp3_price: None,
            tp3_quantity: None,
            sl_order_id: Some(format!("{id}-sl")),
            tp1_order_id: Some(format!("{id}-tp1")),
            tp2_order_id: None,
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

    #[tokio::test(start_paused = true)]
    async fn closes_everything_and_is_idempotent() {
        let mock = MockExchange::new();
        mock.set_position("BTCUSDT", HoldSide::Long, 1.0, 100.0);
        mock.set_position("ETHUSDT", HoldSide::Long, 1.0, 100.0);
        mock.set_ticker("BTCUSDT", 99.0);
        mock.set_ticker("ETHUSDT", 101.0);
        mock.state.lock().auto_reduce_on_close = true;

        let state = test_state(mock.clone());
        seed_user(&state, "u1", json!({}));
        state.db.insert_position(&open_row("p1", "BTCUSDT")).unwrap();
        state.db.insert_position(&open_row("p2", "ETHUSDT")).unwrap();

        let report = emergency_shutdown(&state, "u1").await.unwrap();
        assert_eq!(report.closed.len(), 2);
        assert!(report.failed.is_empty());

        assert!(!state.db.get_user_settings("u1").unwrap().unwrap().bot_active);
        for id in ["p1", "p2"] {
            let row = state.db.get_position_row(id).unwrap().unwrap();
            assert_eq!(row.status, PositionStatus::Closed);
            assert_eq!(row.close_reason.as_deref(), Some("emergency_shutdown"));
            assert!(row.realized_pnl.is_some());
        }

        // Second invocation finds nothing to do.
        let again = emergency_shutdown(&state, "u1").await.unwrap();
        assert!(again.closed.is_empty());
        assert!(again.failed.is_empty());
    }
}
