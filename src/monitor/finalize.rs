//! Closing machinery: verified closes and position finalization.
//!
//! Finalization writes the terminal close fields exactly once; any closure
//! the engine itself initiates goes through the verified-close ladder and
//! counts as successful only when the exchange quantity actually dropped.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::db::{MonitoringLogEntry, PositionRow, PositionStatus};
use crate::exchange::{ContractMeta, Exchange, HoldSide, PlanCategory, TradeSide};
use crate::models::Side;
use crate::AppState;

const CLOSE_ATTEMPTS: usize = 3;
const CLOSE_SETTLE: Duration = Duration::from_millis(300);
/// Price tolerance when inferring a close reason from the close price.
const REASON_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Copy)]
pub struct CloseConfirm {
    pub confirmed: bool,
}

async fn remaining_size(
    exchange: &Arc<dyn Exchange>,
    symbol: &str,
    hold_side: HoldSide,
) -> Option<f64> {
    match exchange.get_position(symbol).await {
        Ok(Some(p)) if p.hold_side == hold_side => Some(p.total_size),
        Ok(_) => Some(0.0),
        Err(_) => None,
    }
}

/// Close with verification: market close up to 3x re-reading quantity, then
/// flash close, then a reduce-only limit 0.1 % through the book. Success
/// means the quantity dropped by at least 1 %.
pub async fn verified_close(
    exchange: &Arc<dyn Exchange>,
    symbol: &str,
    hold_side: HoldSide,
    size: Option<f64>,
) -> Result<CloseConfirm> {
    let before = match remaining_size(exchange, symbol, hold_side).await {
        Some(size) => size,
        None => bail!("cannot snapshot {symbol} before close"),
    };
    if before <= 0.0 {
        return Ok(CloseConfirm { confirmed: true });
    }
    let target = size.unwrap_or(before).min(before);
    let close_side = TradeSide::close(hold_side);

    let dropped = |after: f64| after <= before * 0.99 + 1e-12;

    for attempt in 1..=CLOSE_ATTEMPTS {
        match exchange
            .place_market(symbol, close_side, target, None, true)
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(symbol, attempt, "close order failed: {e}"),
        }
        sleep(CLOSE_SETTLE).await;
        if let Some(after) = remaining_size(exchange, symbol, hold_side).await {
            if dropped(after) {
                return Ok(CloseConfirm { confirmed: true });
            }
        }
    }

    match exchange.flash_close(symbol, hold_side, size).await {
        Ok(executed) => {
            sleep(CLOSE_SETTLE).await;
            if executed {
                if let Some(after) = remaining_size(exchange, symbol, hold_side).await {
                    if dropped(after) {
                        return Ok(CloseConfirm { confirmed: true });
                    }
                }
            }
        }
        Err(e) => warn!(symbol, "flash close failed: {e}"),
    }

    // Last resort: a reduce-only limit priced through the book.
    if let Ok(ticker) = exchange.get_ticker(symbol).await {
        let price = match hold_side {
            HoldSide::Long => ticker.last_price * 0.999,
            HoldSide::Short => ticker.last_price * 1.001,
        };
        if let Err(e) = exchange
            .place_market(symbol, close_side, target, Some(price), true)
            .await
        {
            warn!(symbol, "reduce-only limit close failed: {e}");
        }
        sleep(CLOSE_SETTLE).await;
        if let Some(after) = remaining_size(exchange, symbol, hold_side).await {
            if dropped(after) {
                return Ok(CloseConfirm { confirmed: true });
            }
        }
    }

    Ok(CloseConfirm { confirmed: false })
}

/// Close reason from fill flags first, then by where the close price landed
/// relative to the bracket, with 0.5 % tolerance.
pub fn infer_close_reason(pos: &PositionRow, close_price: f64) -> String {
    for level in (1..=3u8).rev() {
        if pos.tp_filled(level) {
            return format!("tp{level}_hit");
        }
    }

    let crossed_sl = pos.sl_price.map(|sl| match pos.side {
        Side::Buy => close_price <= sl * (1.0 + REASON_TOLERANCE),
        Side::Sell => close_price >= sl * (1.0 - REASON_TOLERANCE),
    });
    if crossed_sl == Some(true) {
        return "sl_hit".into();
    }

    for level in (1..=3u8).rev() {
        let crossed = pos.tp_price(level).map(|tp| match pos.side {
            Side::Buy => close_price >= tp * (1.0 - REASON_TOLERANCE),
            Side::Sell => close_price <= tp * (1.0 + REASON_TOLERANCE),
        });
        if crossed == Some(true) {
            return format!("tp{level}_hit");
        }
    }

    let pnl = (close_price - pos.entry_price) * pos.side.sign();
    if pnl >= 0.0 {
        "manual_profit".into()
    } else {
        "manual_loss".into()
    }
}

/// Volume-weighted close price from post-open close fills; ticker fallback.
async fn resolve_close_price(exchange: &Arc<dyn Exchange>, pos: &PositionRow) -> f64 {
    let from = pos.created_at.timestamp_millis();
    let to = Utc::now().timestamp_millis();
    let fills = exchange
        .get_fill_history(&pos.symbol, from, to, 200)
        .await
        .unwrap_or_default();

    let mut volume = 0.0;
    let mut notional = 0.0;
    for fill in fills.iter().filter(|f| f.is_close && f.ts_ms >= from) {
        volume += fill.size;
        notional += fill.size * fill.price;
    }
    if volume > 0.0 {
        return notional / volume;
    }

    match exchange.get_ticker(&pos.symbol).await {
        Ok(t) => t.last_price,
        Err(_) => pos.current_price.unwrap_or(pos.entry_price),
    }
}

/// Write the terminal state for a position the exchange reports closed.
/// Idempotent; gated against racing an in-flight TP fill. Returns whether
/// the position was finalized.
pub async fn finalize_position(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
    meta: &ContractMeta,
    forced_reason: Option<&str>,
    check_type: &str,
) -> Result<bool> {
    if pos.status == PositionStatus::Closed {
        return Ok(false);
    }
    let hold_side = HoldSide::from(pos.side);

    // Gate 1: a live close-side TP may be mid-fill; never race it. Only for
    // closures we infer; a forced reason means we executed the close
    // ourselves and already verified the reduction.
    if forced_reason.is_none() {
        let live_tps = exchange
            .list_plan_orders(Some(&pos.symbol), PlanCategory::NormalPlan)
            .await
            .context("listing TP orders before finalize")?;
        if live_tps
            .iter()
            .any(|o| o.is_close && o.hold_side == hold_side)
        {
            debug!(symbol = %pos.symbol, "finalize deferred: live TP orders remain");
            return Ok(false);
        }
    }

    // Gate 2: the position must actually be gone (below one lot).
    if let Some(size) = remaining_size(exchange, &pos.symbol, hold_side).await {
        if size >= meta.min_qty {
            debug!(symbol = %pos.symbol, size, "finalize deferred: position still holds size");
            return Ok(false);
        }
    } else {
        bail!("cannot confirm {} is closed", pos.symbol);
    }

    let close_price = resolve_close_price(exchange, pos).await;
    let reason = forced_reason
        .map(str::to_string)
        .unwrap_or_else(|| infer_close_reason(pos, close_price));
    let realized = (close_price - pos.entry_price) * pos.quantity * pos.side.sign();

    pos.status = PositionStatus::Closed;
    pos.close_price = Some(close_price);
    pos.close_reason = Some(reason.clone());
    pos.realized_pnl = Some(realized);
    pos.closed_at = Some(Utc::now());
    pos.current_price = Some(close_price);
    pos.unrealized_pnl = Some(0.0);
    state.db.update_position(pos)?;

    // Sweep any leftover plan orders for the symbol.
    for category in [PlanCategory::ProfitLoss, PlanCategory::NormalPlan] {
        if let Ok(orders) = exchange.list_plan_orders(Some(&pos.symbol), category).await {
            for order in orders
                .iter()
                .filter(|o| o.is_close && o.hold_side == hold_side)
            {
                if let Err(e) = exchange
                    .cancel_plan(&pos.symbol, &order.order_id, category)
                    .await
                {
                    warn!(symbol = %pos.symbol, order_id = %order.order_id, "cancel after close failed: {e}");
                }
            }
        }
    }

    let _ = state.db.insert_monitoring_log(&MonitoringLogEntry {
        check_type: check_type.into(),
        status: "position_closed".into(),
        user_id: Some(pos.user_id.clone()),
        symbol: Some(pos.symbol.clone()),
        issues: Vec::new(),
        expected: None,
        actual: Some(json!({
            "close_price": close_price,
            "close_reason": reason,
            "realized_pnl": realized,
        })),
        actions: vec!["finalized".into()],
    });

    info!(
        user_id = %pos.user_id,
        symbol = %pos.symbol,
        close_price,
        realized,
        reason = %reason,
        "position closed"
    );
    Ok(true)
}

/// Cancel the known bracket, flatten the position, then finalize with the
/// given reason. Used by duplicate-replace and the emergency controller.
pub async fn close_and_finalize(
    state: &AppState,
    exchange: &Arc<dyn Exchange>,
    pos: &mut PositionRow,
    reason: &str,
) -> Result<()> {
    if pos.status == PositionStatus::Closed {
        return Ok(());
    }
    let hold_side = HoldSide::from(pos.side);

    if let Some(sl_id) = pos.sl_order_id.clone() {
        let _ = exchange
            .cancel_plan(&pos.symbol, &sl_id, PlanCategory::ProfitLoss)
            .await;
    }
    for level in 1..=3u8 {
        if let Some(tp_id) = pos.tp_order_id(level).map(str::to_string) {
            let _ = exchange
                .cancel_plan(&pos.symbol, &tp_id, PlanCategory::NormalPlan)
                .await;
        }
    }

    let close = verified_close(exchange, &pos.symbol, hold_side, Some(pos.quantity)).await?;
    if !close.confirmed {
        bail!("could not confirm {} position reduction", pos.symbol);
    }
    sleep(Duration::from_millis(500)).await;

    let meta = exchange
        .get_contract_meta(&pos.symbol)
        .await
        .with_context(|| format!("contract metadata for {}", pos.symbol))?;

    if !finalize_position(state, exchange, pos, &meta, Some(reason), "emergency_close").await? {
        bail!("{} still reports open after close", pos.symbol);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PositionMetadata;

    fn position(side: Side) -> PositionRow {
        PositionRow {
            id: "p1".into(),
            user_id: "u1".into(),
            symbol: "TESTUSDT".into(),
            side,
            entry_price: 100.0,
            quantity: 1.0,
            leverage: 10,
            sl_price: Some(98.0),
            tp1_price: Some(103.0),
            tp1_quantity: Some(0.6),
            tp2_price: Some(105.0),
            tp2_quantity: Some(0.4),
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

    #[test]
    fn filled_flag_dominates_reason() {
        let mut pos = position(Side::Buy);
        pos.tp2_filled = true;
        assert_eq!(infer_close_reason(&pos, 97.0), "tp2_hit");
    }

    #[test]
    fn sl_direction_wins_within_tolerance() {
        let pos = position(Side::Buy);
        assert_eq!(infer_close_reason(&pos, 98.1), "sl_hit");
        assert_eq!(infer_close_reason(&pos, 97.0), "sl_hit");
    }

    #[test]
    fn tp_direction_picks_highest_crossed() {
        let pos = position(Side::Buy);
        assert_eq!(infer_close_reason(&pos, 105.2), "tp2_hit");
        assert_eq!(infer_close_reason(&pos, 103.1), "tp1_hit");
    }

    #[test]
    fn manual_reasons_by_pnl_sign() {
        let pos = position(Side::Buy);
        assert_eq!(infer_close_reason(&pos, 101.0), "manual_profit");
        assert_eq!(infer_close_reason(&pos, 99.5), "manual_loss");
    }

    #[test]
    fn sell_side_mirrors() {
        let mut pos = position(Side::Sell);
        pos.sl_price = Some(102.0);
        pos.tp1_price = Some(97.0);
        pos.tp2_price = Some(95.0);
        assert_eq!(infer_close_reason(&pos, 102.2), "sl_hit");
        assert_eq!(infer_close_reason(&pos, 94.9), "tp2_hit");
    }

    use crate::testutil::{test_state, MockExchange};

    #[tokio::test(start_paused = true)]
    async fn finalize_is_idempotent() {
        let mock = MockExchange::new();
        let state = test_state(mock.clone());
        let mut pos = position(Side::Buy);
        pos.status = PositionStatus::Closed;
        pos.close_reason = Some("tp1_hit".into());
        pos.close_price = Some(103.0);
        pos.realized_pnl = Some(3.0);
        pos.closed_at = Some(Utc::now());
        state.db.insert_position(&pos).unwrap();
        state.db.update_position(&pos).unwrap();

        let exchange: Arc<dyn Exchange> = mock.clone();
        let meta = crate::testutil::default_meta("TESTUSDT");
        let finalized =
            finalize_position(&state, &exchange, &mut pos, &meta, None, "full_verification")
                .await
                .unwrap();
        assert!(!finalized);
        // Terminal fields are untouched.
        assert_eq!(pos.close_reason.as_deref(), Some("tp1_hit"));
        assert_eq!(pos.close_price, Some(103.0));
        assert_eq!(pos.realized_pnl, Some(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_defers_while_tp_orders_live() {
        use crate::exchange::{PlanOrder, PlanType};
        let mock = MockExchange::new();
        mock.set_ticker("TESTUSDT", 103.0);
        mock.state.lock().plan_orders.push(PlanOrder {
            order_id: "tp1-1".into(),
            symbol: "TESTUSDT".into(),
            plan_type: PlanType::NormalPlan,
            trigger_price: 103.0,
            size: 0.6,
            is_close: true,
            hold_side: HoldSide::Long,
        });
        let state = test_state(mock.clone());
        let mut pos = position(Side::Buy);
        state.db.insert_position(&pos).unwrap();

        let exchange: Arc<dyn Exchange> = mock.clone();
        let meta = crate::testutil::default_meta("TESTUSDT");
        let finalized =
            finalize_position(&state, &exchange, &mut pos, &meta, None, "full_verification")
                .await
                .unwrap();
        assert!(!finalized);
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn verified_close_falls_back_to_flash_close() {
        let mock = MockExchange::new();
        // Market closes do NOT reduce (auto_reduce_on_close = false), so the
        // ladder has to reach flash_close, which always reduces in the mock.
        mock.set_position("TESTUSDT", HoldSide::Long, 1.0, 100.0);
        mock.set_ticker("TESTUSDT", 99.0);

        let exchange: Arc<dyn Exchange> = mock.clone();
        let confirm = verified_close(&exchange, "TESTUSDT", HoldSide::Long, None)
            .await
            .unwrap();
        assert!(confirm.confirmed);
        // Three market attempts were made before the fallback.
        assert_eq!(mock.state.lock().market_orders.len(), 3);
        assert!(mock.state.lock().positions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn verified_close_on_flat_position_is_trivially_confirmed() {
        let mock = MockExchange::new();
        let exchange: Arc<dyn Exchange> = mock.clone();
        let confirm = verified_close(&exchange, "TESTUSDT", HoldSide::Long, Some(1.0))
            .await
            .unwrap();
        assert!(confirm.confirmed);
        assert!(mock.state.lock().market_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_price_prefers_vwap_of_close_fills() {
        use crate::exchange::Fill;
        let mock = MockExchange::new();
        mock.set_ticker("TESTUSDT", 50.0);
        let state = test_state(mock.clone());
        let mut pos = position(Side::Buy);
        pos.tp1_filled = true;
        state.db.insert_position(&pos).unwrap();

        let now = Utc::now().timestamp_millis();
        {
            let mut s = mock.state.lock();
            s.fills.push(Fill {
                symbol: "TESTUSDT".into(),
                is_close: true,
                price: 103.0,
                size: 0.6,
                ts_ms: now,
            });
            s.fills.push(Fill {
                symbol: "TESTUSDT".into(),
                is_close: true,
                price: 104.0,
                size: 0.4,
                ts_ms: now,
            });
        }

        let exchange: Arc<dyn Exchange> = mock.clone();
        let meta = crate::testutil::default_meta("TESTUSDT");
        let finalized =
            finalize_position(&state, &exchange, &mut pos, &meta, None, "full_verification")
                .await
                .unwrap();
        assert!(finalized);
        // vwap = (103*0.6 + 104*0.4) / 1.0
        let close = pos.close_price.unwrap();
        assert!((close - 103.4).abs() < 1e-9, "close {close}");
        assert_eq!(pos.close_reason.as_deref(), Some("tp1_hit"));
    }
}
