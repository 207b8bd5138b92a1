//! Reconciler ("monitor")
//!
//! A periodically started, singleton-leased loop that makes the database
//! agree with the exchange for every user and every open position. Only the
//! lease holder makes state-changing calls; concurrent starters observe the
//! lease and no-op.

pub mod finalize;
pub mod orphan;
pub mod resync;
pub mod verify;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialStatus;
use crate::db::locks::POSITION_MONITOR_LOCK;
use crate::exchange::{Exchange, HoldSide};
use crate::AppState;

#[derive(Debug, Default, Clone, Serialize)]
pub struct MonitorSummary {
    pub skipped: bool,
    pub reason: Option<String>,
    pub users_checked: usize,
    pub positions_checked: usize,
    pub recovered: usize,
    pub orphan_orders_cancelled: usize,
    pub errors: usize,
}

/// One reconciliation cycle. Acquires the lease, walks every user with
/// active credentials, releases the lease on the way out whatever happened.
pub async fn run_cycle(
    state: &Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
) -> MonitorSummary {
    let instance_id = Uuid::new_v4().to_string();

    if let Err(e) = state.db.gc_expired_locks() {
        warn!("lease gc failed: {e:#}");
    }
    match state.db.try_acquire_lock(
        POSITION_MONITOR_LOCK,
        &instance_id,
        state.config.monitor_lease_ttl_secs,
    ) {
        Ok(true) => {}
        Ok(false) => {
            return MonitorSummary {
                skipped: true,
                reason: Some("Another instance holds the lock".into()),
                ..Default::default()
            };
        }
        Err(e) => {
            error!("lease acquisition failed: {e:#}");
            return MonitorSummary {
                skipped: true,
                reason: Some(format!("lease error: {e}")),
                ..Default::default()
            };
        }
    }

    let mut summary = MonitorSummary::default();
    if let Err(e) = walk_users(state, shutdown, &mut summary).await {
        error!("monitor cycle failed: {e:#}");
        summary.errors += 1;
    }

    if let Err(e) = state.db.release_lock(POSITION_MONITOR_LOCK, &instance_id) {
        warn!("lease release failed: {e:#}");
    }

    if summary.positions_checked > 0 || summary.errors > 0 {
        info!(
            users = summary.users_checked,
            positions = summary.positions_checked,
            recovered = summary.recovered,
            orphan_orders = summary.orphan_orders_cancelled,
            errors = summary.errors,
            "monitor cycle complete"
        );
    }
    summary
}

async fn walk_users(
    state: &Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
    summary: &mut MonitorSummary,
) -> Result<()> {
    let users = state.db.list_users_with_active_keys()?;
    for user_id in users {
        if *shutdown.borrow() {
            info!("monitor cycle interrupted by shutdown");
            break;
        }
        let creds = match state.vault.get(&user_id) {
            Ok(CredentialStatus::Ready(creds)) => creds,
            Ok(_) => continue,
            Err(e) => {
                error!(user_id, "credential decryption failed, skipping user: {e:#}");
                summary.errors += 1;
                continue;
            }
        };
        let exchange = state.connector.connect(&creds);
        summary.users_checked += 1;
        if let Err(e) = reconcile_user(state, &exchange, &user_id, summary).await {
            error!(user_id, "user reconcile failed: {e:#}");
            state
                .bot_log
                .error("monitor", Some(&user_id), format!("reconcile failed: {e:#}"));
            summary.errors += 1;
        }
    }
    Ok(())
}

async fn reconcile_user(
    state: &Arc<AppState>,
    exchange: &Arc<dyn Exchange>,
    user_id: &str,
    summary: &mut MonitorSummary,
) -> Result<()> {
    // The position list is the authority; if we cannot read it we must not
    // touch this user at all, and especially not close anything.
    let ex_positions = match exchange.get_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!(user_id, "get_positions failed, skipping user: {e}");
            return Ok(());
        }
    };

    let db_open = state.db.open_positions_for_user(user_id)?;
    let mut db_keys: HashSet<(String, HoldSide)> = HashSet::new();

    for mut pos in db_open {
        let hold_side = HoldSide::from(pos.side);
        db_keys.insert((pos.symbol.clone(), hold_side));
        summary.positions_checked += 1;

        let matched = ex_positions
            .iter()
            .any(|p| p.symbol == pos.symbol && p.hold_side == hold_side && p.total_size > 0.0);
        let result = if matched {
            verify::full_verification(state, exchange, &mut pos).await
        } else {
            // Possibly closed on exchange, or the bulk list lied. An empty
            // list is never trusted blanket-wise; each position gets its own
            // direct read.
            verify::verify_absent_or_reconcile(state, exchange, &mut pos).await
        };
        if let Err(e) = result {
            error!(user_id, symbol = %pos.symbol, "position reconcile failed: {e:#}");
            summary.errors += 1;
        }
    }

    // Exchange-only positions are orphans to adopt.
    for ex_pos in &ex_positions {
        if ex_pos.total_size <= 0.0 {
            continue;
        }
        if db_keys.contains(&(ex_pos.symbol.clone(), ex_pos.hold_side)) {
            continue;
        }
        match orphan::recover_position(state, exchange, user_id, ex_pos).await {
            Ok(()) => summary.recovered += 1,
            Err(e) => {
                error!(user_id, symbol = %ex_pos.symbol, "orphan recovery failed: {e:#}");
                summary.errors += 1;
            }
        }
    }

    match orphan::cleanup_orphan_orders(state, exchange, user_id).await {
        Ok(n) => summary.orphan_orders_cancelled += n,
        Err(e) => {
            warn!(user_id, "orphan order cleanup failed: {e:#}");
            summary.errors += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use crate::testutil::{seed_user, test_state, MockExchange};
    use serde_json::json;

    #[tokio::test]
    async fn second_starter_observes_lease_and_noops() {
        let mock = MockExchange::new();
        mock.set_position("ETHUSDT", HoldSide::Long, 0.5, 3000.0);
        let state = test_state(mock.clone());
        seed_user(&state, "u1", json!({}));

        state
            .db
            .try_acquire_lock(POSITION_MONITOR_LOCK, "other-instance", 120)
            .unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let summary = run_cycle(&state, &rx).await;
        assert!(summary.skipped);
        assert_eq!(
            summary.reason.as_deref(),
            Some("Another instance holds the lock")
        );
        // The loser made no exchange calls: the orphan was not recovered.
        assert!(state.db.open_positions_for_user("u1").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_recovers_orphans_and_releases_lease() {
        let mock = MockExchange::new();
        mock.set_position("ETHUSDT", HoldSide::Long, 0.5, 3000.0);
        mock.set_ticker("ETHUSDT", 3000.0);
        let state = test_state(mock.clone());
        seed_user(&state, "u1", json!({}));

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let summary = run_cycle(&state, &rx).await;
        assert!(!summary.skipped);
        assert_eq!(summary.users_checked, 1);
        assert_eq!(summary.recovered, 1);

        let row = state
            .db
            .open_position_by_key("u1", "ETHUSDT", Side::Buy)
            .unwrap()
            .unwrap();
        assert!(row.metadata.recovered);

        // The lease was released on the way out.
        assert!(state
            .db
            .try_acquire_lock(POSITION_MONITOR_LOCK, "next", 120)
            .unwrap());
    }

    #[tokio::test]
    async fn failed_position_list_skips_user_without_closing() {
        let mock = MockExchange::new();
        mock.state.lock().fail_get_positions = true;
        let state = test_state(mock.clone());
        seed_user(&state, "u1", json!({}));

        let mut pos = crate::db::PositionRow {
            id: "p1".into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
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
            sl_order_id: None,
            tp1_order_id: None,
            tp2_order_id: None,
            tp3_order_id: None,
            tp1_filled: false,
            tp2_filled: false,
            tp3_filled: false,
            status: crate::db::PositionStatus::Open,
            close_reason: None,
            close_price: None,
            realized_pnl: None,
            current_price: None,
            unrealized_pnl: None,
            last_check_at: None,
            check_errors: 0,
            last_error: None,
            created_at: chrono::Utc::now(),
            closed_at: None,
            alert_id: None,
            metadata: Default::default(),
        };
        state.db.insert_position(&pos).unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let summary = run_cycle(&state, &rx).await;
        assert!(!summary.skipped);

        // A failed position list must never close database positions.
        pos = state.db.get_position_row("p1").unwrap().unwrap();
        assert_eq!(pos.status, crate::db::PositionStatus::Open);
        assert_eq!(pos.check_errors, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_before_touching_users() {
        let mock = MockExchange::new();
        mock.set_position("ETHUSDT", HoldSide::Long, 0.5, 3000.0);
        mock.set_ticker("ETHUSDT", 3000.0);
        let state = test_state(mock.clone());
        seed_user(&state, "u1", json!({}));

        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        let summary = run_cycle(&state, &rx).await;
        assert_eq!(summary.users_checked, 0);
        assert_eq!(summary.recovered, 0);
    }
}
