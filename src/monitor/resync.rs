//! Selective resync: cancel and re-place the bracket legs that drifted.
//!
//! Guarded by a 5-minute per-position cooldown and a pre-resync safety pass
//! that prefers marking a TP filled over cancelling an order the exchange
//! already executed.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::db::{MonitoringLogEntry, PositionRow};
use crate::exchange::{
    BatchOp, BracketKind, BracketRequest, ContractMeta, Exchange, HoldSide, PlanCategory,
};
use crate::models::Side;
use crate::AppState;

use super::finalize;
use super::verify::ResyncNeeds;

/// Manual review is flagged (but the attempt still proceeds) past this count.
const RESYNC_REVIEW_THRESHOLD: u32 = 3;
/// A close fill matching a leg size within this fraction proves it executed.
const FILL_MATCH_TOLERANCE: f64 = 0.10;

fn level_passed(side: Side, mark: f64, trigger: f64, is_sl: bool) -> bool {
    match (side, is_sl) {
        // For a long, price falling to the SL or rising to a TP means the
        // trigger is no longer ahead of the market.
        (Side::Buy, true) => mark <= trigger,
        (Side::Buy, false) => mark >= trigger,
        (Side::Sell, true) => mark >= trigger,
        (Side::Sell, false) => mark <= trigger,
    }
}

pub async fn maybe_resync(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
    meta: &ContractMeta,
    mark: f64,
    mut needs: ResyncNeeds,
) -> Result<()> {
    let now = Utc::now();
    let hold_side = HoldSide::from(pos.side);
    let symbol = pos.symbol.clone();

    if pos.within_resync_cooldown(now) {
        debug!(symbol = %symbol, "resync skipped: cooldown");
        return Ok(());
    }
    if pos.metadata.resync_count >= RESYNC_REVIEW_THRESHOLD {
        warn!(
            symbol = %symbol,
            count = pos.metadata.resync_count,
            "position keeps needing resync; flagging for manual review"
        );
        let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
            check_type: "deviations".into(),
            status: "needs_manual_review".into(),
            user_id: Some(pos.user_id.clone()),
            symbol: Some(symbol.clone()),
            issues: needs.issues.clone(),
            expected: None,
            actual: Some(json!({"resync_count": pos.metadata.resync_count})),
            actions: Vec::new(),
        });
    }

    let mut actions: Vec<String> = Vec::new();

    // Safety (i): an apparently missing TP may simply have filled.
    if !needs.tps.is_empty() {
        let from = pos.created_at.timestamp_millis();
        let fills = exchange
            .get_fill_history(&symbol, from, now.timestamp_millis(), 200)
            .await
            .unwrap_or_default();
        needs.tps.retain(|leg| {
            let executed = fills.iter().any(|f| {
                f.is_close && leg.size > 0.0 && (f.size - leg.size).abs() <= leg.size * FILL_MATCH_TOLERANCE
            });
            if executed {
                pos.set_tp_filled(leg.level);
                actions.push(format!("tp{} confirmed filled from history", leg.level));
            }
            !executed
        });
    }

    // Safety (ii): the position may have fully closed under us.
    match exchange.get_position(&symbol).await {
        Ok(Some(p)) if p.hold_side == hold_side && p.total_size >= meta.min_qty => {
            if p.total_size < pos.quantity {
                pos.quantity = p.total_size;
            }
        }
        Ok(_) => {
            finalize::finalize_position(state, exchange, pos, meta, None, "selective_resync")
                .await?;
            let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
                check_type: "selective_resync".into(),
                status: "closed_before_resync".into(),
                user_id: Some(pos.user_id.clone()),
                symbol: Some(symbol.clone()),
                issues: needs.issues,
                expected: None,
                actual: None,
                actions,
            });
            return Ok(());
        }
        Err(e) => {
            // Resyncing blind is worse than waiting a cycle.
            pos.check_errors += 1;
            pos.last_error = Some(format!("pre-resync position read: {e}"));
            return Ok(());
        }
    }

    // Safety (iii): legs flagged because the TP listing came back empty may
    // be listing noise; live close-side TPs on a re-list confirm it.
    if !needs.tps.is_empty() && needs.tp_list_was_empty {
        if let Ok(live) = exchange
            .list_plan_orders(Some(&symbol), PlanCategory::NormalPlan)
            .await
        {
            if live.iter().any(|o| o.is_close && o.hold_side == hold_side) {
                debug!(symbol = %symbol, "tp orders visible on re-list; skipping tp resync");
                needs.tps.clear();
            }
        }
    }

    if needs.is_empty() {
        if !actions.is_empty() {
            state.db.update_position(pos)?;
        }
        return Ok(());
    }

    // SL leg first: a position without a stop is the worst state to be in.
    if let Some(target) = needs.sl_target {
        if let Some(old_id) = pos.sl_order_id.clone() {
            let _ = exchange
                .cancel_plan(&symbol, &old_id, PlanCategory::ProfitLoss)
                .await;
        }
        if level_passed(pos.side, mark, target, true) {
            // The stop level is already behind the market: a trigger there
            // would never fire usefully. Flatten now.
            actions.push(format!("sl {target} already passed at {mark}; closing position"));
            let close = finalize::verified_close(exchange, &symbol, hold_side, None).await?;
            if close.confirmed {
                pos.metadata.last_resync_at = Some(now);
                pos.metadata.resync_count += 1;
                finalize::finalize_position(
                    state,
                    exchange,
                    pos,
                    meta,
                    Some("sl_hit_delayed"),
                    "sl_repair",
                )
                .await?;
                let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
                    check_type: "sl_repair".into(),
                    status: "closed".into(),
                    user_id: Some(pos.user_id.clone()),
                    symbol: Some(symbol.clone()),
                    issues: needs.issues,
                    expected: Some(json!({"sl": target})),
                    actual: Some(json!({"mark": mark})),
                    actions,
                });
                return Ok(());
            }
            pos.check_errors += 1;
            pos.last_error = Some("sl-passed close could not be confirmed".into());
        } else {
            match exchange
                .place_bracket(&BracketRequest {
                    symbol: symbol.clone(),
                    kind: BracketKind::StopLoss,
                    hold_side,
                    trigger_price: target,
                    size: Some(pos.quantity),
                    execute_price: 0.0,
                })
                .await
            {
                Ok(order) => {
                    pos.sl_order_id = Some(order.order_id);
                    pos.sl_price = Some(target);
                    actions.push(format!("sl re-placed at {target}"));
                }
                Err(e) => {
                    pos.check_errors += 1;
                    pos.last_error = Some(format!("sl re-place failed: {e}"));
                    actions.push(format!("sl re-place failed: {e}"));
                }
            }
        }
    }

    // TP legs: cancel stale ids, close passed levels at market, batch the rest.
    let mut ops = Vec::new();
    for leg in &needs.tps {
        if let Some(old_id) = pos.tp_order_id(leg.level).map(str::to_string) {
            let _ = exchange
                .cancel_plan(&symbol, &old_id, PlanCategory::NormalPlan)
                .await;
            pos.set_tp_order(leg.level, None);
        }
        if level_passed(pos.side, mark, leg.price, false) {
            actions.push(format!(
                "tp{} level {} already passed at {mark}; closing leg",
                leg.level, leg.price
            ));
            let close =
                finalize::verified_close(exchange, &symbol, hold_side, Some(leg.size)).await?;
            if close.confirmed {
                pos.set_tp_filled(leg.level);
                pos.quantity = (pos.quantity - leg.size).max(0.0);
            } else {
                pos.check_errors += 1;
                pos.last_error = Some(format!("tp{} market close unconfirmed", leg.level));
            }
        } else {
            ops.push(BatchOp {
                id: format!("tp{}", leg.level),
                request: BracketRequest {
                    symbol: symbol.clone(),
                    kind: BracketKind::TakeProfit,
                    hold_side,
                    trigger_price: leg.price,
                    size: Some(leg.size),
                    execute_price: 0.0,
                },
            });
        }
    }
    if !ops.is_empty() {
        let outcomes = exchange.batch(ops).await;
        for outcome in outcomes {
            let level: u8 = outcome.id.trim_start_matches("tp").parse().unwrap_or(0);
            let Some(leg) = needs.tps.iter().find(|l| l.level == level) else {
                continue;
            };
            match outcome.result {
                Ok(order) => {
                    pos.set_tp_target(leg.level, leg.price, leg.size);
                    pos.set_tp_order(leg.level, Some(order.order_id));
                    actions.push(format!("tp{} re-placed at {} x {}", leg.level, leg.price, leg.size));
                }
                Err(e) => {
                    pos.check_errors += 1;
                    pos.last_error = Some(format!("tp{} re-place failed: {e}", leg.level));
                    actions.push(format!("tp{} re-place failed: {e}", leg.level));
                }
            }
        }
    }

    pos.metadata.last_resync_at = Some(now);
    pos.metadata.resync_count += 1;
    state.db.update_position(pos)?;

    let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
        check_type: "selective_resync".into(),
        status: "completed".into(),
        user_id: Some(pos.user_id.clone()),
        symbol: Some(symbol),
        issues: needs.issues,
        expected: None,
        actual: Some(json!({"mark": mark, "resync_count": pos.metadata.resync_count})),
        actions,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_levels_by_side() {
        // Long SL at 98: mark 97.8 is at-or-through.
        assert!(level_passed(Side::Buy, 97.8, 98.0, true));
        assert!(!level_passed(Side::Buy, 98.2, 98.0, true));
        // Long TP at 103: mark 103.5 is through.
        assert!(level_passed(Side::Buy, 103.5, 103.0, false));
        assert!(!level_passed(Side::Buy, 102.0, 103.0, false));
        // Short mirrors.
        assert!(level_passed(Side::Sell, 102.5, 102.0, true));
        assert!(level_passed(Side::Sell, 96.5, 97.0, false));
    }
}
