//! Full verification of one matched position.
//!
//! All decisions in one pass are made against a single snapshot fetched
//! here; anything that looks like it changed mid-pass is deferred to the
//! next cycle rather than re-decided.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::db::{MonitoringLogEntry, PositionRow};
use crate::exchange::{
    BracketKind, BracketRequest, ContractMeta, Exchange, ExchangePosition, ExchangeResult,
    HoldSide, PlanCategory, PlanOrder,
};
use crate::pricing::{self, PricingSnapshot};
use crate::AppState;

use super::{finalize, resync};

const POSITION_READ_RETRIES: usize = 3;
const POSITION_READ_BACKOFF: Duration = Duration::from_secs(1);
const TP_LIST_RETRY_DELAY: Duration = Duration::from_millis(500);
/// A quantity below 99 % of ours means something closed.
const PARTIAL_CLOSE_RATIO: f64 = 0.99;
/// Partial-close delta must match a TP size within this fraction.
const TP_DELTA_TOLERANCE: f64 = 0.10;
const SL_PRICE_TOLERANCE: f64 = 0.005;
const TP_PRICE_TOLERANCE: f64 = 0.005;
const TP_SIZE_TOLERANCE: f64 = 0.05;

/// One bracket leg that needs to be re-placed.
#[derive(Debug, Clone)]
pub struct TpTarget {
    pub level: u8,
    pub price: f64,
    pub size: f64,
}

/// What selective resync has to fix.
#[derive(Debug, Default)]
pub struct ResyncNeeds {
    pub sl_target: Option<f64>,
    pub tps: Vec<TpTarget>,
    pub issues: Vec<String>,
    /// The TP listing came back empty; the legs above were flagged missing
    /// rather than drifted, so a re-list may reveal pure listing noise.
    pub tp_list_was_empty: bool,
}

impl ResyncNeeds {
    pub fn is_empty(&self) -> bool {
        self.sl_target.is_none() && self.tps.is_empty()
    }
}

/// Read the position with retries; `Ok(None)` is a *confirmed* absence
/// (every read succeeded and came back empty).
async fn fetch_position_with_retry(
    exchange: &Arc<dyn Exchange>,
    symbol: &str,
    hold_side: HoldSide,
) -> ExchangeResult<Option<ExchangePosition>> {
    let mut last_err = None;
    for attempt in 0..POSITION_READ_RETRIES {
        match exchange.get_position(symbol).await {
            Ok(Some(p)) if p.hold_side == hold_side => return Ok(Some(p)),
            Ok(_) => {}
            Err(e) if e.is_transient() => last_err = Some(e),
            Err(e) => return Err(e),
        }
        if attempt + 1 < POSITION_READ_RETRIES {
            sleep(POSITION_READ_BACKOFF).await;
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

fn bump_check_error(state: &AppState, pos: &mut PositionRow, error: String) {
    pos.check_errors += 1;
    pos.last_error = Some(error);
    pos.last_check_at = Some(Utc::now());
    if let Err(e) = state.db.update_position(pos) {
        warn!(symbol = %pos.symbol, "position update failed: {e:#}");
    }
}

fn highest_filled_level(pos: &PositionRow) -> u8 {
    (1..=3u8).rev().find(|&l| pos.tp_filled(l)).unwrap_or(0)
}

fn breakeven_owed(pos: &PositionRow, snap: &PricingSnapshot) -> bool {
    snap.sl_to_breakeven && highest_filled_level(pos) >= snap.breakeven_trigger_tp
}

/// Cancel the old SL and place one at breakeven; never regress to a less
/// safe stop. Returns whether a new SL was placed.
async fn rewrite_sl_to_breakeven(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
    snap: &PricingSnapshot,
    meta: &ContractMeta,
) -> Result<bool> {
    let target = pricing::round_price(
        pricing::breakeven_price(snap.entry_price, pos.side, snap.fee_aware_breakeven),
        meta.price_places,
    );
    if let Some(current) = pos.sl_price {
        if pricing::sl_is_safer_or_equal(current, target, pos.side, 1e-9) {
            return Ok(false);
        }
    }

    if let Some(old_id) = pos.sl_order_id.clone() {
        if let Err(e) = exchange
            .cancel_plan(&pos.symbol, &old_id, PlanCategory::ProfitLoss)
            .await
        {
            debug!(symbol = %pos.symbol, "old SL cancel failed (may be gone): {e}");
        }
    }

    match exchange
        .place_bracket(&BracketRequest {
            symbol: pos.symbol.clone(),
            kind: BracketKind::StopLoss,
            hold_side: HoldSide::from(pos.side),
            trigger_price: target,
            size: Some(pos.quantity),
            execute_price: 0.0,
        })
        .await
    {
        Ok(order) => {
            let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
                check_type: "sl_repair".into(),
                status: "completed".into(),
                user_id: Some(pos.user_id.clone()),
                symbol: Some(pos.symbol.clone()),
                issues: vec!["breakeven owed".into()],
                expected: Some(json!({"sl": target})),
                actual: Some(json!({"sl": pos.sl_price})),
                actions: vec![format!("sl moved to breakeven {target}")],
            });
            pos.sl_order_id = Some(order.order_id);
            pos.sl_price = Some(target);
            Ok(true)
        }
        Err(e) => {
            pos.check_errors += 1;
            pos.last_error = Some(format!("breakeven SL placement failed: {e}"));
            Ok(false)
        }
    }
}

/// Detect a partial close and attribute it to a TP level. Returns the level
/// that flipped, if any.
fn detect_partial_close(pos: &mut PositionRow, live_size: f64, mark: f64) -> Option<u8> {
    let delta = pos.quantity - live_size;
    let mut best: Option<(u8, f64)> = None;
    for level in 1..=3u8 {
        if pos.tp_filled(level) {
            continue;
        }
        let Some(size) = pos.tp_quantity(level) else {
            continue;
        };
        if size > 0.0 && (delta - size).abs() <= size * TP_DELTA_TOLERANCE {
            // Near-equal sizes disambiguate by trigger proximity to the mark.
            let distance = pos
                .tp_price(level)
                .map(|p| (p - mark).abs())
                .unwrap_or(f64::MAX);
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((level, distance));
            }
        }
    }
    let level = best.map(|(l, _)| l);
    if let Some(level) = level {
        pos.set_tp_filled(level);
    }
    pos.quantity = live_size;
    level
}

/// Compare live orders against expectations and collect what needs repair.
fn build_needs(
    pos: &PositionRow,
    snap: &PricingSnapshot,
    expected: &pricing::BracketPlan,
    sl_orders: &[&PlanOrder],
    tp_orders: &[&PlanOrder],
    meta: &ContractMeta,
) -> ResyncNeeds {
    let mut needs = ResyncNeeds {
        tp_list_was_empty: tp_orders.is_empty(),
        ..Default::default()
    };
    let owed = breakeven_owed(pos, snap);
    let breakeven_target = pricing::round_price(
        pricing::breakeven_price(snap.entry_price, pos.side, snap.fee_aware_breakeven),
        meta.price_places,
    );
    let sl_target = if owed {
        breakeven_target
    } else {
        expected.sl_price
    };

    match sl_orders {
        [only] => {
            let trigger = only.trigger_price;
            if owed {
                if !pricing::sl_is_safer_or_equal(trigger, snap.entry_price, pos.side, 1e-4) {
                    needs.issues.push(format!(
                        "sl at {trigger} but breakeven owed (entry {})",
                        snap.entry_price
                    ));
                    needs.sl_target = Some(breakeven_target);
                }
            } else if expected.sl_price > 0.0
                && ((trigger - expected.sl_price) / expected.sl_price).abs() > SL_PRICE_TOLERANCE
            {
                needs
                    .issues
                    .push(format!("sl price {trigger} drifted from {}", expected.sl_price));
                needs.sl_target = Some(expected.sl_price);
            }
        }
        [] => {
            needs.issues.push("sl order missing".into());
            needs.sl_target = Some(sl_target);
        }
        many => {
            needs.issues.push(format!("{} sl orders live", many.len()));
            needs.sl_target = Some(sl_target);
        }
    }

    if tp_orders.len() != expected.tps.len() {
        needs.issues.push(format!(
            "{} tp orders live, {} expected",
            tp_orders.len(),
            expected.tps.len()
        ));
    }
    let mut unclaimed: Vec<&PlanOrder> = tp_orders.to_vec();
    for leg in &expected.tps {
        let matched = unclaimed.iter().position(|o| {
            leg.price > 0.0
                && ((o.trigger_price - leg.price) / leg.price).abs() <= TP_PRICE_TOLERANCE
                && (leg.size <= 0.0 || ((o.size - leg.size) / leg.size).abs() <= TP_SIZE_TOLERANCE)
        });
        match matched {
            Some(idx) => {
                unclaimed.swap_remove(idx);
            }
            None => {
                needs
                    .issues
                    .push(format!("tp{} missing or drifted (want {} x {})", leg.level, leg.price, leg.size));
                needs.tps.push(TpTarget {
                    level: leg.level,
                    price: leg.price,
                    size: leg.size,
                });
            }
        }
    }

    needs
}

/// The per-position reconciliation pass.
pub async fn full_verification(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
) -> Result<()> {
    let symbol = pos.symbol.clone();
    let hold_side = HoldSide::from(pos.side);
    let meta = match exchange.get_contract_meta(&symbol).await {
        Ok(meta) => meta,
        Err(e) => {
            bump_check_error(state, pos, format!("contract meta: {e}"));
            return Ok(());
        }
    };

    // (a) authoritative position, retried; absence must be triple-confirmed.
    let live = match fetch_position_with_retry(exchange, &symbol, hold_side).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            let in_list = match exchange.get_positions().await {
                Ok(list) => list
                    .iter()
                    .any(|p| p.symbol == symbol && p.hold_side == hold_side && p.total_size > 0.0),
                // A failed list is not evidence of absence.
                Err(_) => true,
            };
            let now_ms = Utc::now().timestamp_millis();
            let fills_readable = exchange
                .get_fill_history(&symbol, now_ms - 300_000, now_ms, 50)
                .await
                .is_ok();
            if !in_list && fills_readable {
                finalize::finalize_position(state, exchange, pos, &meta, None, "full_verification")
                    .await?;
            } else {
                bump_check_error(state, pos, "position absent but not confirmed".into());
            }
            return Ok(());
        }
        Err(e) => {
            bump_check_error(state, pos, format!("position read: {e}"));
            return Ok(());
        }
    };

    // (b) current mark.
    let mark = match exchange.get_ticker(&symbol).await {
        Ok(t) => t.last_price,
        Err(e) => {
            bump_check_error(state, pos, format!("ticker: {e}"));
            return Ok(());
        }
    };

    // (c) live bracket orders, with one retry against a falsely empty TP list.
    let pl_orders = match exchange
        .list_plan_orders(Some(&symbol), PlanCategory::ProfitLoss)
        .await
    {
        Ok(orders) => orders,
        Err(e) => {
            bump_check_error(state, pos, format!("plan orders: {e}"));
            return Ok(());
        }
    };
    let snap_levels = pos
        .metadata
        .settings_snapshot
        .as_ref()
        .map(|s| s.tp_levels)
        .unwrap_or(3);
    let expected_tp_count = snap_levels.saturating_sub(pos.filled_count()) as usize;
    let mut np_orders = match exchange
        .list_plan_orders(Some(&symbol), PlanCategory::NormalPlan)
        .await
    {
        Ok(orders) => orders,
        Err(e) => {
            bump_check_error(state, pos, format!("plan orders: {e}"));
            return Ok(());
        }
    };
    if expected_tp_count > 0
        && !np_orders
            .iter()
            .any(|o| o.is_close && o.hold_side == hold_side)
    {
        sleep(TP_LIST_RETRY_DELAY).await;
        if let Ok(retry) = exchange
            .list_plan_orders(Some(&symbol), PlanCategory::NormalPlan)
            .await
        {
            np_orders = retry;
        }
    }

    // (d) partial close detection + breakeven.
    let mut sl_rewritten = false;
    if live.total_size < pos.quantity * PARTIAL_CLOSE_RATIO {
        let before = pos.quantity;
        let flipped = detect_partial_close(pos, live.total_size, mark);
        match flipped {
            Some(level) => {
                let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
                    check_type: "full_verification".into(),
                    status: "partial_close".into(),
                    user_id: Some(pos.user_id.clone()),
                    symbol: Some(symbol.clone()),
                    issues: Vec::new(),
                    expected: Some(json!({"quantity": before})),
                    actual: Some(json!({"quantity": live.total_size})),
                    actions: vec![format!("tp{level} marked filled")],
                });
                if let Some(snap) = pos.metadata.settings_snapshot.clone() {
                    if breakeven_owed(pos, &snap) {
                        sl_rewritten =
                            rewrite_sl_to_breakeven(state, exchange, pos, &snap, &meta).await?;
                    }
                }
            }
            None => {
                // Quantity shrank but nothing matches: ambiguous, log only.
                let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
                    check_type: "deviations".into(),
                    status: "ambiguous".into(),
                    user_id: Some(pos.user_id.clone()),
                    symbol: Some(symbol.clone()),
                    issues: vec![format!(
                        "quantity {before} -> {} with no matching tp",
                        live.total_size
                    )],
                    expected: None,
                    actual: None,
                    actions: Vec::new(),
                });
            }
        }
    }

    // (e)+(f) expected bracket vs live orders, rounded before comparison.
    let close_side = |o: &PlanOrder| o.is_close && o.hold_side == hold_side;
    let sl_orders: Vec<&PlanOrder> = pl_orders
        .iter()
        .filter(|o| close_side(o) && o.plan_type.is_stop_loss())
        .collect();
    let tp_orders: Vec<&PlanOrder> = np_orders.iter().filter(|o| close_side(o)).collect();

    if let (Some(snap), Some(expected)) = (
        pos.metadata.settings_snapshot.clone(),
        pricing::expected_bracket(pos, &meta),
    ) {
        let mut needs = build_needs(pos, &snap, &expected, &sl_orders, &tp_orders, &meta);
        if sl_rewritten {
            // The SL was already repaired this pass; the order listings
            // above predate it.
            needs.sl_target = None;
        }

        // If every order id we recorded is still live, trust our own book
        // and skip resync regardless of price nits.
        let live_ids: HashSet<&str> = pl_orders
            .iter()
            .chain(np_orders.iter())
            .map(|o| o.order_id.as_str())
            .collect();
        let mut recorded: Vec<&str> = Vec::new();
        if let Some(id) = pos.sl_order_id.as_deref() {
            recorded.push(id);
        }
        for level in 1..=snap.tp_levels {
            if !pos.tp_filled(level) {
                if let Some(id) = pos.tp_order_id(level) {
                    recorded.push(id);
                }
            }
        }
        let all_recorded_live = recorded.len() == 1 + expected.tps.len()
            && recorded.iter().all(|id| live_ids.contains(id));

        if !needs.is_empty() && !all_recorded_live {
            resync::maybe_resync(state, exchange, pos, &meta, mark, needs).await?;
        }
    }

    if pos.status == crate::db::PositionStatus::Open {
        pos.current_price = Some(mark);
        pos.unrealized_pnl = Some(pos.unrealized(mark));
    }
    pos.last_check_at = Some(Utc::now());
    state.db.update_position(pos)?;
    Ok(())
}

/// A position the bulk listing no longer shows: re-verify directly and only
/// finalize on confirmed absence.
pub async fn verify_absent_or_reconcile(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
) -> Result<()> {
    let hold_side = HoldSide::from(pos.side);
    match exchange.get_position(&pos.symbol).await {
        Ok(Some(p)) if p.hold_side == hold_side && p.total_size > 0.0 => {
            // The listing was stale; reconcile normally.
            full_verification(state, exchange, pos).await
        }
        Ok(_) => {
            let meta = match exchange.get_contract_meta(&pos.symbol).await {
                Ok(meta) => meta,
                Err(e) => {
                    bump_check_error(state, pos, format!("contract meta: {e}"));
                    return Ok(());
                }
            };
            finalize::finalize_position(state, exchange, pos, &meta, None, "full_verification")
                .await?;
            Ok(())
        }
        Err(e) => {
            bump_check_error(state, pos, format!("absence re-check: {e}"));
            Ok(())
        }
    }
}
