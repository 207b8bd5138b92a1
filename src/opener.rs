//! Position opener
//!
//! Sizes, prices and places the market entry plus the protective bracket,
//! then persists the position with its settings snapshot. A position is
//! never left naked: a stop-loss that cannot be placed forces an emergency
//! close and a symbol ban.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{PositionMetadata, PositionRow, PositionStatus};
use crate::exchange::{
    BatchOp, BracketKind, BracketRequest, ContractMeta, Exchange, HoldSide, TradeSide,
};
use crate::models::NormalizedSignal;
use crate::monitor::finalize;
use crate::policy::{SizingType, UserPolicy};
use crate::pricing::{self, PricingSnapshot};
use crate::AppState;

const BRACKET_RETRIES: usize = 2;

#[derive(Debug)]
pub struct OpenedPosition {
    pub position_id: String,
    pub entry_order_id: String,
    pub executed_at: DateTime<Utc>,
}

/// Position size by sizing type, floored to contract precision.
pub fn compute_size(
    policy: &UserPolicy,
    entry_price: f64,
    leverage: u32,
    available_balance: Option<f64>,
    meta: &ContractMeta,
) -> Result<f64> {
    let leverage = leverage.max(1) as f64;
    let raw = match policy.position_sizing_type {
        SizingType::FixedUsdt => policy.position_size_value / entry_price,
        SizingType::Percent => {
            let balance =
                available_balance.ok_or_else(|| anyhow!("balance required for percent sizing"))?;
            (balance * policy.position_size_value / 100.0) * leverage / entry_price
        }
        SizingType::ScalpingMode => {
            let frac = (policy.max_loss_per_trade / (policy.max_margin_per_trade * leverage))
                .clamp(policy.sl_percent_min / 100.0, policy.sl_percent_max / 100.0);
            let by_loss = policy.max_loss_per_trade / (entry_price * frac);
            let by_margin = policy.max_margin_per_trade * leverage / entry_price;
            by_loss.min(by_margin)
        }
    };

    let size = pricing::round_size(raw, meta.volume_places);
    if size < meta.min_qty {
        bail!(
            "computed size {size} below contract minimum {} for {}",
            meta.min_qty,
            meta.symbol
        );
    }
    Ok(size)
}

pub async fn open_position(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    user_id: &str,
    signal: &NormalizedSignal,
    policy: &UserPolicy,
    alert_id: Option<&str>,
) -> Result<OpenedPosition> {
    let symbol = signal.symbol.as_str();
    let meta = exchange
        .get_contract_meta(symbol)
        .await
        .with_context(|| format!("contract metadata for {symbol}"))?;

    let leverage = policy.effective_leverage(symbol, signal.leverage);
    for hold_side in [HoldSide::Long, HoldSide::Short] {
        if let Err(e) = exchange.set_leverage(symbol, hold_side, leverage).await {
            warn!(user_id, symbol, ?hold_side, "set_leverage failed: {e}");
        }
    }

    let balance = if policy.position_sizing_type == SizingType::Percent {
        Some(
            exchange
                .get_account()
                .await
                .context("account balance for percent sizing")?
                .available,
        )
    } else {
        None
    };
    let quantity = compute_size(policy, signal.entry_price, leverage, balance, &meta)?;

    let snapshot = PricingSnapshot::from_policy(
        policy,
        signal.entry_price,
        leverage,
        signal.atr,
        signal.sl,
        signal.main_tp,
    );
    let plan = pricing::plan_bracket(&snapshot, signal.side, quantity, &meta, [false; 3]);

    if state.config.dry_run {
        info!(
            user_id,
            symbol,
            side = signal.side.as_str(),
            quantity,
            sl = plan.sl_price,
            "DRY RUN: would open position with {} TP legs",
            plan.tps.len()
        );
        return Ok(OpenedPosition {
            position_id: format!("dry_run_{}", Uuid::new_v4()),
            entry_order_id: "dry_run".into(),
            executed_at: Utc::now(),
        });
    }

    let hold_side = HoldSide::from(signal.side);
    let entry = exchange
        .place_market(symbol, TradeSide::open(signal.side), quantity, None, false)
        .await
        .context("entry market order")?;
    let executed_at = Utc::now();

    // SL sized against the whole position; TPs are close-side plan orders.
    let mut ops = vec![BatchOp {
        id: "sl".into(),
        request: BracketRequest {
            symbol: symbol.to_string(),
            kind: BracketKind::StopLoss,
            hold_side,
            trigger_price: plan.sl_price,
            size: Some(quantity),
            execute_price: 0.0,
        },
    }];
    for leg in &plan.tps {
        ops.push(BatchOp {
            id: format!("tp{}", leg.level),
            request: BracketRequest {
                symbol: symbol.to_string(),
                kind: BracketKind::TakeProfit,
                hold_side,
                trigger_price: leg.price,
                size: Some(leg.size),
                execute_price: 0.0,
            },
        });
    }

    let placed = place_with_retries(exchange, ops).await;

    if !placed.contains_key("sl") {
        // Never leave the position naked: flatten it and ban the symbol.
        warn!(user_id, symbol, "stop-loss placement failed after retries; emergency closing");
        let close = finalize::verified_close(exchange, symbol, hold_side, Some(quantity)).await;
        state
            .db
            .ban_symbol(user_id, symbol, "stop-loss placement failed")?;
        state.bot_log.error(
            "opener",
            Some(user_id),
            format!("{symbol}: SL placement failed, position emergency-closed (confirmed: {})",
                close.map(|c| c.confirmed).unwrap_or(false)),
        );
        bail!("stop-loss placement failed; position closed and {symbol} banned");
    }

    let mut row = PositionRow {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        symbol: symbol.to_string(),
        side: signal.side,
        entry_price: signal.entry_price,
        quantity,
        leverage,
        sl_price: Some(plan.sl_price),
        tp1_price: None,
        tp1_quantity: None,
        tp2_price: None,
        tp2_quantity: None,
        tp3_price: None,
        tp3_quantity: None,
        sl_order_id: placed.get("sl").cloned(),
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
        current_price: Some(signal.entry_price),
        unrealized_pnl: Some(0.0),
        last_check_at: None,
        check_errors: 0,
        last_error: None,
        created_at: executed_at,
        closed_at: None,
        alert_id: alert_id.map(str::to_string),
        metadata: PositionMetadata {
            settings_snapshot: Some(snapshot),
            ..Default::default()
        },
    };
    for leg in &plan.tps {
        row.set_tp_target(leg.level, leg.price, leg.size);
        row.set_tp_order(leg.level, placed.get(&format!("tp{}", leg.level)).cloned());
    }

    if !state.db.insert_position(&row)? {
        // Lost an insert race; the reconciler will converge on the winner.
        warn!(user_id, symbol, "open position row already exists; leaving recovery to the monitor");
    }

    info!(
        user_id,
        symbol,
        side = signal.side.as_str(),
        quantity,
        leverage,
        sl = plan.sl_price,
        tps = plan.tps.len(),
        "position opened"
    );

    Ok(OpenedPosition {
        position_id: row.id,
        entry_order_id: entry.order_id,
        executed_at,
    })
}

/// One batch round plus up to two retry rounds for the legs that failed.
async fn place_with_retries(
    exchange: &Arc<dyn Exchange>,
    ops: Vec<BatchOp>,
) -> HashMap<String, String> {
    let mut requests: HashMap<String, BracketRequest> = ops
        .iter()
        .map(|op| (op.id.clone(), op.request.clone()))
        .collect();
    let mut placed = HashMap::new();
    let mut pending = ops;

    for attempt in 0..=BRACKET_RETRIES {
        if pending.is_empty() {
            break;
        }
        let outcomes = exchange.batch(std::mem::take(&mut pending)).await;
        for outcome in outcomes {
            match outcome.result {
                Ok(order) => {
                    requests.remove(&outcome.id);
                    placed.insert(outcome.id, order.order_id);
                }
                Err(e) => {
                    warn!(op = %outcome.id, attempt, "bracket placement failed: {e}");
                    if attempt < BRACKET_RETRIES {
                        if let Some(request) = requests.get(&outcome.id) {
                            pending.push(BatchOp {
                                id: outcome.id,
                                request: request.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    placed
}
