//! Orphan handling: exchange positions with no database row, and live plan
//! orders no open position owns.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::db::{MonitoringLogEntry, PositionMetadata, PositionRow, PositionStatus};
use crate::exchange::{
    BatchOp, BracketKind, BracketRequest, Exchange, ExchangePosition, PlanCategory, PlanOrder,
};
use crate::policy;
use crate::pricing::{self, PricingSnapshot};
use crate::AppState;

/// Adopt an exchange position the database does not know about. The bracket
/// is priced from *live* policy (recovery has no snapshot); the snapshot
/// written here governs every later reconcile.
pub async fn recover_position(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    user_id: &str,
    ex_pos: &ExchangePosition,
) -> Result<()> {
    let symbol = ex_pos.symbol.as_str();
    let side = ex_pos.hold_side.side();
    let meta = exchange.get_contract_meta(symbol).await?;
    let policy = policy::resolve_for_user(&state.db, user_id, symbol)?;

    let snapshot = PricingSnapshot::from_policy(
        &policy,
        ex_pos.average_entry,
        ex_pos.leverage.max(1),
        None,
        None,
        None,
    );
    let plan = pricing::plan_bracket(&snapshot, side, ex_pos.total_size, &meta, [false; 3]);

    let pl_orders = exchange
        .list_plan_orders(Some(symbol), PlanCategory::ProfitLoss)
        .await
        .unwrap_or_default();
    let np_orders = exchange
        .list_plan_orders(Some(symbol), PlanCategory::NormalPlan)
        .await
        .unwrap_or_default();
    let ours = |o: &&PlanOrder| o.is_close && o.hold_side == ex_pos.hold_side;
    let existing_sl = pl_orders.iter().filter(ours).find(|o| o.plan_type.is_stop_loss());
    let has_brackets = existing_sl.is_some() || np_orders.iter().filter(ours).count() > 0;

    let mut row = PositionRow {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        symbol: symbol.to_string(),
        side,
        entry_price: ex_pos.average_entry,
        quantity: ex_pos.total_size,
        leverage: ex_pos.leverage.max(1),
        sl_price: Some(plan.sl_price),
        tp1_price: None,
        tp1_quantity: None,
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
        status: PositionStatus::Open,
        close_reason: None,
        close_price: None,
        realized_pnl: None,
        current_price: Some(ex_pos.average_entry),
        unrealized_pnl: None,
        last_check_at: None,
        check_errors: 0,
        last_error: None,
        created_at: Utc::now(),
        closed_at: None,
        alert_id: None,
        metadata: PositionMetadata {
            settings_snapshot: Some(snapshot),
            recovered: true,
            ..Default::default()
        },
    };
    for leg in &plan.tps {
        row.set_tp_target(leg.level, leg.price, leg.size);
    }

    let mut actions = Vec::new();
    if has_brackets {
        // Someone (or a previous life of this engine) already protected the
        // position; adopt what we can match instead of stacking orders.
        if let Some(sl) = existing_sl {
            row.sl_order_id = Some(sl.order_id.clone());
            row.sl_price = Some(sl.trigger_price);
            actions.push(format!("adopted live sl {}", sl.order_id));
        }
        for leg in &plan.tps {
            if let Some(matched) = np_orders.iter().filter(ours).find(|o| {
                leg.price > 0.0 && ((o.trigger_price - leg.price) / leg.price).abs() <= 0.005
            }) {
                row.set_tp_order(leg.level, Some(matched.order_id.clone()));
                actions.push(format!("adopted live tp{} {}", leg.level, matched.order_id));
            }
        }
    } else if state.config.dry_run {
        info!(user_id, symbol, "DRY RUN: would place recovery bracket");
    } else {
        let mut ops = vec![BatchOp {
            id: "sl".into(),
            request: BracketRequest {
                symbol: symbol.to_string(),
                kind: BracketKind::StopLoss,
                hold_side: ex_pos.hold_side,
                trigger_price: plan.sl_price,
                size: Some(ex_pos.total_size),
                execute_price: 0.0,
            },
        }];
        for leg in &plan.tps {
            ops.push(BatchOp {
                id: format!("tp{}", leg.level),
                request: BracketRequest {
                    symbol: symbol.to_string(),
                    kind: BracketKind::TakeProfit,
                    hold_side: ex_pos.hold_side,
                    trigger_price: leg.price,
                    size: Some(leg.size),
                    execute_price: 0.0,
                },
            });
        }
        for outcome in exchange.batch(ops).await {
            match outcome.result {
                Ok(order) => {
                    if outcome.id == "sl" {
                        row.sl_order_id = Some(order.order_id.clone());
                        actions.push(format!("placed sl {}", order.order_id));
                    } else if let Ok(level) =
                        outcome.id.trim_start_matches("tp").parse::<u8>()
                    {
                        row.set_tp_order(level, Some(order.order_id.clone()));
                        actions.push(format!("placed tp{level} {}", order.order_id));
                    }
                }
                Err(e) => {
                    warn!(user_id, symbol, op = %outcome.id, "recovery bracket failed: {e}");
                    actions.push(format!("{} placement failed: {e}", outcome.id));
                }
            }
        }
    }

    if !state.db.insert_position(&row)? {
        // A concurrent recovery won the unique constraint; theirs is as good
        // as ours.
        info!(user_id, symbol, "recovery lost insert race; keeping existing row");
        return Ok(());
    }

    let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
        check_type: "orphan_recovered".into(),
        status: "completed".into(),
        user_id: Some(user_id.to_string()),
        symbol: Some(symbol.to_string()),
        issues: vec!["position on exchange with no database row".into()],
        expected: None,
        actual: Some(json!({
            "size": ex_pos.total_size,
            "entry": ex_pos.average_entry,
            "leverage": ex_pos.leverage,
        })),
        actions,
    });
    info!(user_id, symbol, size = ex_pos.total_size, "orphan position recovered");
    Ok(())
}

/// Cancel live close-side plan orders that no open position references.
/// Orders referenced only by closed positions count as orphans too.
pub async fn cleanup_orphan_orders(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    user_id: &str,
) -> Result<usize> {
    let open = state.db.open_positions_for_user(user_id)?;
    let referenced: HashSet<String> = open
        .iter()
        .flat_map(|p| p.known_order_ids().into_iter().map(str::to_string))
        .collect();

    let mut cancelled = 0;
    for category in [PlanCategory::ProfitLoss, PlanCategory::NormalPlan] {
        let orders = match exchange.list_plan_orders(None, category).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(user_id, "orphan cleanup list failed: {e}");
                continue;
            }
        };
        for order in orders
            .iter()
            .filter(|o| o.is_close && !referenced.contains(&o.order_id))
        {
            match exchange
                .cancel_plan(&order.symbol, &order.order_id, category)
                .await
            {
                Ok(()) => {
                    cancelled += 1;
                    info!(
                        user_id,
                        symbol = %order.symbol,
                        order_id = %order.order_id,
                        "orphan plan order cancelled"
                    );
                }
                Err(e) => warn!(
                    user_id,
                    order_id = %order.order_id,
                    "orphan cancel failed: {e}"
                ),
            }
        }
    }

    if cancelled > 0 {
        let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
            check_type: "deviations".into(),
            status: "orphan_orders_cancelled".into(),
            user_id: Some(user_id.to_string()),
            symbol: None,
            issues: vec![format!("{cancelled} unowned close-side plan orders")],
            expected: None,
            actual: None,
            actions: vec![format!("cancelled {cancelled} orders")],
        });
    }
    Ok(cancelled)
}
