//! Pricing engine
//!
//! Pure and deterministic: given the open-time snapshot, a quantity and the
//! contract precision, produce the SL price, TP prices and per-TP sizes.
//! Every output is rounded to exchange precision here, so reconciliation
//! never compares against a target the exchange could not hold.

use serde::{Deserialize, Serialize};

use crate::db::positions::PositionRow;
use crate::exchange::ContractMeta;
use crate::models::Side;
use crate::policy::{CalculatorType, SizingType, SlMethod, TpStrategy, UserPolicy};

/// Breakeven buffer when fees are ignored: 0.01 % past entry.
const BREAKEVEN_BUFFER: f64 = 0.0001;
/// Fee-aware buffer: one round-trip taker fee (0.12 %) so closing there
/// nets zero.
const FEE_AWARE_BREAKEVEN_BUFFER: f64 = 0.0012;

pub fn round_price(price: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (price * factor).round() / factor
}

/// Sizes are floored so we never target more than we hold.
pub fn round_size(size: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    ((size * factor) + 1e-9).floor() / factor
}

/// The pricing-relevant policy fields frozen into a position at open time,
/// plus the open-time inputs. Reconciliation recomputes from this, never
/// from live policy, so user edits cannot perturb live orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub position_sizing_type: SizingType,
    pub calculator_type: CalculatorType,
    pub sl_method: SlMethod,
    pub tp_strategy: TpStrategy,
    pub tp_levels: u8,
    pub tp1_close_percent: f64,
    pub tp2_close_percent: f64,
    pub tp3_close_percent: f64,
    pub simple_sl_percent: f64,
    pub simple_tp_percent: f64,
    pub simple_tp2_percent: f64,
    pub simple_tp3_percent: f64,
    pub rr_sl_percent_margin: f64,
    pub tp1_rr_ratio: f64,
    pub tp2_rr_ratio: f64,
    pub tp3_rr_ratio: f64,
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,
    pub atr_tp2_multiplier: f64,
    pub atr_tp3_multiplier: f64,
    pub sl_to_breakeven: bool,
    pub breakeven_trigger_tp: u8,
    pub fee_aware_breakeven: bool,
    pub taker_fee_rate: f64,
    pub max_margin_per_trade: f64,
    pub max_loss_per_trade: f64,
    pub sl_percent_min: f64,
    pub sl_percent_max: f64,

    // Open-time inputs.
    pub entry_price: f64,
    pub leverage: u32,
    pub atr: Option<f64>,
    /// SL level supplied by the signal; wins over `sl_method` when present.
    pub signal_sl: Option<f64>,
    pub main_tp: Option<f64>,
}

impl PricingSnapshot {
    pub fn from_policy(
        policy: &UserPolicy,
        entry_price: f64,
        leverage: u32,
        atr: Option<f64>,
        signal_sl: Option<f64>,
        main_tp: Option<f64>,
    ) -> Self {
        Self {
            position_sizing_type: policy.position_sizing_type,
            calculator_type: policy.calculator_type,
            sl_method: policy.sl_method,
            tp_strategy: policy.tp_strategy,
            tp_levels: policy.tp_levels.clamp(1, 3),
            tp1_close_percent: policy.tp1_close_percent,
            tp2_close_percent: policy.tp2_close_percent,
            tp3_close_percent: policy.tp3_close_percent,
            simple_sl_percent: policy.simple_sl_percent,
            simple_tp_percent: policy.simple_tp_percent,
            simple_tp2_percent: policy.simple_tp2_percent,
            simple_tp3_percent: policy.simple_tp3_percent,
            rr_sl_percent_margin: policy.rr_sl_percent_margin,
            tp1_rr_ratio: policy.tp1_rr_ratio,
            tp2_rr_ratio: policy.tp2_rr_ratio,
            tp3_rr_ratio: policy.tp3_rr_ratio,
            atr_sl_multiplier: policy.atr_sl_multiplier,
            atr_tp_multiplier: policy.atr_tp_multiplier,
            atr_tp2_multiplier: policy.atr_tp2_multiplier,
            atr_tp3_multiplier: policy.atr_tp3_multiplier,
            sl_to_breakeven: policy.sl_to_breakeven,
            breakeven_trigger_tp: policy.breakeven_trigger_tp,
            fee_aware_breakeven: policy.fee_aware_breakeven,
            taker_fee_rate: policy.taker_fee_rate,
            max_margin_per_trade: policy.max_margin_per_trade,
            max_loss_per_trade: policy.max_loss_per_trade,
            sl_percent_min: policy.sl_percent_min,
            sl_percent_max: policy.sl_percent_max,
            entry_price,
            leverage: leverage.max(1),
            atr,
            signal_sl,
            main_tp,
        }
    }
}

/// One protective take-profit leg.
#[derive(Debug, Clone, PartialEq)]
pub struct TpLeg {
    pub level: u8,
    pub price: f64,
    pub size: f64,
}

/// The full protective bracket for a position.
#[derive(Debug, Clone)]
pub struct BracketPlan {
    pub sl_price: f64,
    pub tps: Vec<TpLeg>,
}

/// Unrounded SL price. The signal's explicit level wins; scalping-mode
/// sizing derives its own distance from the loss budget.
pub fn compute_sl_price(snap: &PricingSnapshot, side: Side, quantity: f64) -> f64 {
    let entry = snap.entry_price;
    let leverage = snap.leverage.max(1) as f64;

    if snap.position_sizing_type == SizingType::ScalpingMode {
        let denom = snap.max_margin_per_trade * leverage;
        let frac = if denom > 0.0 {
            (snap.max_loss_per_trade / denom)
                .clamp(snap.sl_percent_min / 100.0, snap.sl_percent_max / 100.0)
        } else {
            snap.sl_percent_max / 100.0
        };
        return entry - side.sign() * entry * frac;
    }

    if let Some(sl) = snap.signal_sl {
        return sl;
    }

    let distance = match snap.sl_method {
        SlMethod::PercentEntry => entry * snap.simple_sl_percent / 100.0,
        // margin * p / size with margin = size * entry / leverage
        SlMethod::PercentMargin => entry * snap.rr_sl_percent_margin / (100.0 * leverage),
        SlMethod::AtrBased => match snap.atr {
            Some(atr) if atr > 0.0 => atr * snap.atr_sl_multiplier,
            _ => entry * snap.simple_sl_percent / 100.0,
        },
        SlMethod::FixedUsdt => {
            if quantity > 0.0 {
                snap.max_loss_per_trade / quantity
            } else {
                entry * snap.simple_sl_percent / 100.0
            }
        }
    };
    entry - side.sign() * distance
}

/// Unrounded TP prices for levels 1..=3.
pub fn compute_tp_prices(snap: &PricingSnapshot, side: Side, sl_price: f64) -> [f64; 3] {
    let entry = snap.entry_price;
    let sign = side.sign();
    match snap.calculator_type {
        CalculatorType::SimplePercent => [
            entry * (1.0 + sign * snap.simple_tp_percent / 100.0),
            entry * (1.0 + sign * snap.simple_tp2_percent / 100.0),
            entry * (1.0 + sign * snap.simple_tp3_percent / 100.0),
        ],
        CalculatorType::RiskReward => {
            let risk = (entry - sl_price).abs();
            [
                entry + sign * risk * snap.tp1_rr_ratio,
                entry + sign * risk * snap.tp2_rr_ratio,
                entry + sign * risk * snap.tp3_rr_ratio,
            ]
        }
        CalculatorType::AtrBased => match snap.atr {
            Some(atr) if atr > 0.0 => [
                entry + sign * atr * snap.atr_tp_multiplier,
                entry + sign * atr * snap.atr_tp2_multiplier,
                entry + sign * atr * snap.atr_tp3_multiplier,
            ],
            _ => [
                entry * (1.0 + sign * snap.simple_tp_percent / 100.0),
                entry * (1.0 + sign * snap.simple_tp2_percent / 100.0),
                entry * (1.0 + sign * snap.simple_tp3_percent / 100.0),
            ],
        },
    }
}

/// Smart redistribution: split `quantity` across unfilled TP levels so every
/// slice clears `min_qty`, collapsing 3 → 2 → 1 as needed. Filled levels
/// contribute nothing.
pub fn distribute_tp_sizes(
    quantity: f64,
    tp_levels: u8,
    close_percents: [f64; 3],
    filled: [bool; 3],
    min_qty: f64,
    volume_places: u32,
) -> Vec<(u8, f64)> {
    let levels: Vec<u8> = (1..=tp_levels.clamp(1, 3))
        .filter(|&l| !filled[(l - 1) as usize])
        .collect();
    if levels.is_empty() || quantity <= 0.0 {
        return Vec::new();
    }
    if levels.len() == 1 {
        return round_slices(quantity, &[(levels[0], quantity)], volume_places);
    }

    let total_weight: f64 = levels
        .iter()
        .map(|&l| close_percents[(l - 1) as usize].max(0.0))
        .sum();
    let mut slices: Vec<(u8, f64)> = levels
        .iter()
        .map(|&l| {
            let weight = close_percents[(l - 1) as usize].max(0.0);
            let share = if total_weight > 0.0 {
                weight / total_weight
            } else {
                1.0 / levels.len() as f64
            };
            (l, quantity * share)
        })
        .collect();

    if slices.len() == 3 && slices.iter().any(|(_, s)| *s < min_qty) {
        // Fold the last level's share equally into the first two.
        let (_, last) = slices.pop().unwrap_or((0, 0.0));
        slices[0].1 += last / 2.0;
        slices[1].1 += last / 2.0;
    }

    if slices.len() == 2 && slices.iter().any(|(_, s)| *s < min_qty) {
        let (low_idx, high_idx) = if slices[0].1 < slices[1].1 { (0, 1) } else { (1, 0) };
        let remainder = quantity - min_qty;
        if remainder < min_qty {
            // Even a 2-way split is infeasible: one TP carries everything.
            let first = slices[0].0;
            return round_slices(quantity, &[(first, quantity)], volume_places);
        }
        slices[low_idx].1 = min_qty;
        slices[high_idx].1 = remainder;
    }

    round_slices(quantity, &slices, volume_places)
}

/// Floor-round all slices; the last absorbs the rounding remainder so the
/// total never exceeds `quantity`.
fn round_slices(quantity: f64, slices: &[(u8, f64)], volume_places: u32) -> Vec<(u8, f64)> {
    let mut out = Vec::with_capacity(slices.len());
    let mut allocated = 0.0;
    for (i, (level, size)) in slices.iter().enumerate() {
        let rounded = if i + 1 == slices.len() {
            round_size(quantity - allocated, volume_places)
        } else {
            round_size(*size, volume_places)
        };
        allocated += rounded;
        out.push((*level, rounded));
    }
    out.retain(|(_, s)| *s > 0.0);
    out
}

/// SL level that nets ~zero when hit after the trigger TP filled.
pub fn breakeven_price(entry: f64, side: Side, fee_aware: bool) -> f64 {
    let buffer = if fee_aware {
        FEE_AWARE_BREAKEVEN_BUFFER
    } else {
        BREAKEVEN_BUFFER
    };
    entry * (1.0 + side.sign() * buffer)
}

/// For a long, a higher stop is safer; for a short, lower.
pub fn sl_is_safer_or_equal(candidate: f64, reference: f64, side: Side, tolerance: f64) -> bool {
    match side {
        Side::Buy => candidate >= reference - tolerance,
        Side::Sell => candidate <= reference + tolerance,
    }
}

/// The complete bracket for (snapshot, quantity), rounded to contract
/// precision.
pub fn plan_bracket(
    snap: &PricingSnapshot,
    side: Side,
    quantity: f64,
    meta: &ContractMeta,
    filled: [bool; 3],
) -> BracketPlan {
    let sl_raw = compute_sl_price(snap, side, quantity);
    let sl_price = round_price(sl_raw, meta.price_places);

    if snap.tp_strategy == TpStrategy::MainTpOnly {
        let price = snap
            .main_tp
            .unwrap_or_else(|| compute_tp_prices(snap, side, sl_raw)[0]);
        let tps = if filled[0] {
            Vec::new()
        } else {
            round_slices(quantity, &[(1, quantity)], meta.volume_places)
                .into_iter()
                .map(|(level, size)| TpLeg {
                    level,
                    price: round_price(price, meta.price_places),
                    size,
                })
                .collect()
        };
        return BracketPlan { sl_price, tps };
    }

    let prices = compute_tp_prices(snap, side, sl_raw);
    let tps = distribute_tp_sizes(
        quantity,
        snap.tp_levels,
        [
            snap.tp1_close_percent,
            snap.tp2_close_percent,
            snap.tp3_close_percent,
        ],
        filled,
        meta.min_qty,
        meta.volume_places,
    )
    .into_iter()
    .map(|(level, size)| TpLeg {
        level,
        price: round_price(prices[(level - 1) as usize], meta.price_places),
        size,
    })
    .collect();

    BracketPlan { sl_price, tps }
}

/// Expected bracket for a live position. Prefers the targets committed at
/// open time; recomputes from the snapshot's parameters only when the stored
/// per-TP sizes no longer sum to the live quantity (within 1e-4).
pub fn expected_bracket(pos: &PositionRow, meta: &ContractMeta) -> Option<BracketPlan> {
    let snap = pos.metadata.settings_snapshot.as_ref()?;

    let mut stored = Vec::new();
    let mut stored_sum = 0.0;
    for level in 1..=snap.tp_levels {
        if pos.tp_filled(level) {
            continue;
        }
        if let (Some(price), Some(size)) = (pos.tp_price(level), pos.tp_quantity(level)) {
            stored_sum += size;
            stored.push(TpLeg { level, price, size });
        }
    }

    let all_filled = (1..=snap.tp_levels).all(|l| pos.tp_filled(l));
    if (stored_sum - pos.quantity).abs() <= 1e-4 && (!stored.is_empty() || all_filled) {
        let sl_price = pos.sl_price.unwrap_or_else(|| {
            round_price(
                compute_sl_price(snap, pos.side, pos.quantity),
                meta.price_places,
            )
        });
        return Some(BracketPlan {
            sl_price,
            tps: stored,
        });
    }

    Some(plan_bracket(
        snap,
        pos.side,
        pos.quantity,
        meta,
        pos.filled_flags(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ContractMeta {
        ContractMeta {
            symbol: "TESTUSDT".into(),
            price_places: 2,
            volume_places: 1,
            min_qty: 0.1,
        }
    }

    fn rr_snapshot() -> PricingSnapshot {
        let policy = UserPolicy {
            calculator_type: CalculatorType::RiskReward,
            tp_levels: 2,
            tp1_rr_ratio: 1.5,
            tp2_rr_ratio: 2.5,
            tp1_close_percent: 60.0,
            tp2_close_percent: 40.0,
            ..UserPolicy::default()
        };
        PricingSnapshot::from_policy(&policy, 100.0, 10, Some(1.0), Some(98.0), None)
    }

    #[test]
    fn risk_reward_bracket_from_signal_sl() {
        let plan = plan_bracket(&rr_snapshot(), Side::Buy, 1.0, &meta(), [false; 3]);
        assert_eq!(plan.sl_price, 98.0);
        assert_eq!(plan.tps.len(), 2);
        assert_eq!(plan.tps[0], TpLeg { level: 1, price: 103.0, size: 0.6 });
        assert_eq!(plan.tps[1], TpLeg { level: 2, price: 105.0, size: 0.4 });
    }

    #[test]
    fn risk_reward_sell_mirrors() {
        let policy = UserPolicy {
            calculator_type: CalculatorType::RiskReward,
            tp_levels: 1,
            tp1_rr_ratio: 2.0,
            ..UserPolicy::default()
        };
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 10, None, Some(102.0), None);
        let plan = plan_bracket(&snap, Side::Sell, 1.0, &meta(), [false; 3]);
        assert_eq!(plan.sl_price, 102.0);
        assert_eq!(plan.tps[0].price, 96.0);
    }

    #[test]
    fn percent_margin_sl_distance() {
        let policy = UserPolicy {
            sl_method: SlMethod::PercentMargin,
            rr_sl_percent_margin: 10.0,
            ..UserPolicy::default()
        };
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 10, None, None, None);
        // margin = q*100/10; distance = margin*0.10/q = 1.0
        let sl = compute_sl_price(&snap, Side::Buy, 1.0);
        assert!((sl - 99.0).abs() < 1e-9);
        let sl = compute_sl_price(&snap, Side::Sell, 1.0);
        assert!((sl - 101.0).abs() < 1e-9);
    }

    #[test]
    fn atr_sl_distance() {
        let policy = UserPolicy {
            sl_method: SlMethod::AtrBased,
            atr_sl_multiplier: 1.5,
            ..UserPolicy::default()
        };
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 10, Some(2.0), None, None);
        assert!((compute_sl_price(&snap, Side::Buy, 1.0) - 97.0).abs() < 1e-9);
    }

    #[test]
    fn scalping_mode_clamps_sl_fraction() {
        let policy = UserPolicy {
            position_sizing_type: SizingType::ScalpingMode,
            max_margin_per_trade: 100.0,
            max_loss_per_trade: 10.0,
            sl_percent_min: 0.5,
            sl_percent_max: 2.0,
            ..UserPolicy::default()
        };
        // raw fraction = 10 / (100 * 10) = 1%, inside the clamp band
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 10, None, Some(98.0), None);
        assert!((compute_sl_price(&snap, Side::Buy, 1.0) - 99.0).abs() < 1e-9);

        // with 50x leverage the raw fraction 0.2% clamps up to 0.5%
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 50, None, None, None);
        assert!((compute_sl_price(&snap, Side::Buy, 1.0) - 99.5).abs() < 1e-9);
    }

    #[test]
    fn three_way_split_redistributes_then_collapses() {
        // 3-way split of 0.3 with min 0.2 is hopeless: collapse to one TP.
        let sizes = distribute_tp_sizes(0.3, 3, [60.0, 40.0, 20.0], [false; 3], 0.2, 1);
        assert_eq!(sizes, vec![(1, 0.3)]);
    }

    #[test]
    fn three_way_split_redistributes_to_two() {
        // 50/30/20 of 1.0 with min 0.25: TP3 slice 0.2 folds into TP1/TP2.
        let sizes = distribute_tp_sizes(1.0, 3, [50.0, 30.0, 20.0], [false; 3], 0.25, 2);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0], (1, 0.6));
        assert_eq!(sizes[1], (2, 0.4));
        assert!(sizes.iter().all(|(_, s)| *s >= 0.25));
    }

    #[test]
    fn two_way_split_forces_min_qty() {
        // 90/10 of 1.0 with min 0.2: the small slice is forced to exactly
        // min_qty and the rest goes to the other leg.
        let sizes = distribute_tp_sizes(1.0, 2, [90.0, 10.0, 0.0], [false; 3], 0.2, 2);
        assert_eq!(sizes, vec![(1, 0.8), (2, 0.2)]);
    }

    #[test]
    fn filled_levels_contribute_zero() {
        let sizes = distribute_tp_sizes(0.4, 3, [50.0, 30.0, 20.0], [true, false, false], 0.1, 2);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].0, 2);
        assert_eq!(sizes[1].0, 3);
        let total: f64 = sizes.iter().map(|(_, s)| s).sum();
        assert!((total - 0.4).abs() < 1e-9);
    }

    #[test]
    fn sizes_sum_never_exceeds_quantity() {
        let sizes = distribute_tp_sizes(0.999, 3, [50.0, 30.0, 20.0], [false; 3], 0.01, 2);
        let total: f64 = sizes.iter().map(|(_, s)| s).sum();
        assert!(total <= 0.999 + 1e-9);
        for (_, s) in &sizes {
            assert!(*s >= 0.01);
        }
    }

    #[test]
    fn breakeven_buffers() {
        assert!((breakeven_price(100.0, Side::Buy, true) - 100.12).abs() < 1e-9);
        assert!((breakeven_price(100.0, Side::Buy, false) - 100.01).abs() < 1e-9);
        assert!((breakeven_price(100.0, Side::Sell, true) - 99.88).abs() < 1e-9);
    }

    #[test]
    fn safer_sl_comparison() {
        assert!(sl_is_safer_or_equal(100.2, 100.12, Side::Buy, 1e-4));
        assert!(!sl_is_safer_or_equal(99.0, 100.12, Side::Buy, 1e-4));
        assert!(sl_is_safer_or_equal(99.8, 99.88, Side::Sell, 1e-4));
    }

    #[test]
    fn rounding_rules() {
        assert_eq!(round_price(103.456, 2), 103.46);
        assert_eq!(round_size(0.29, 1), 0.2);
        assert_eq!(round_size(0.30000000000000004, 1), 0.3);
    }

    #[test]
    fn main_tp_only_uses_single_leg() {
        let policy = UserPolicy {
            tp_strategy: TpStrategy::MainTpOnly,
            ..UserPolicy::default()
        };
        let snap = PricingSnapshot::from_policy(&policy, 100.0, 10, None, Some(98.0), Some(104.5));
        let plan = plan_bracket(&snap, Side::Buy, 1.0, &meta(), [false; 3]);
        assert_eq!(plan.tps.len(), 1);
        assert_eq!(plan.tps[0].price, 104.5);
        assert_eq!(plan.tps[0].size, 1.0);
    }

    mod expected {
        use super::*;
        use crate::db::{PositionMetadata, PositionStatus};
        use chrono::Utc;

        fn position_with_snapshot() -> PositionRow {
            let snap = rr_snapshot();
            PositionRow {
                id: "p1".into(),
                user_id: "u1".into(),
                symbol: "TESTUSDT".into(),
                side: Side::Buy,
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
                sl_order_id: Some("sl".into()),
                tp1_order_id: Some("tp1".into()),
                tp2_order_id: Some("tp2".into()),
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
                metadata: PositionMetadata {
                    settings_snapshot: Some(snap),
                    ..Default::default()
                },
            }
        }

        #[test]
        fn prefers_stored_targets_when_sizes_sum() {
            let pos = position_with_snapshot();
            let plan = expected_bracket(&pos, &meta()).unwrap();
            assert_eq!(plan.sl_price, 98.0);
            assert_eq!(plan.tps.len(), 2);
            assert_eq!(plan.tps[0].size, 0.6);
        }

        #[test]
        fn recomputes_when_quantity_diverged() {
            let mut pos = position_with_snapshot();
            // TP1 filled and quantity shrunk: stored unfilled sizes (0.4)
            // match the live quantity, so stored targets are kept.
            pos.tp1_filled = true;
            pos.quantity = 0.4;
            let plan = expected_bracket(&pos, &meta()).unwrap();
            assert_eq!(plan.tps.len(), 1);
            assert_eq!(plan.tps[0].level, 2);
            assert_eq!(plan.tps[0].size, 0.4);

            // But if the live quantity drifted away from the stored sizes,
            // the sizes are recomputed from snapshot parameters.
            pos.quantity = 0.35;
            let plan = expected_bracket(&pos, &meta()).unwrap();
            assert_eq!(plan.tps.len(), 1);
            assert_eq!(plan.tps[0].level, 2);
            assert!((plan.tps[0].size - 0.3).abs() < 1e-9);
        }

        #[test]
        fn no_snapshot_means_no_expectation() {
            let mut pos = position_with_snapshot();
            pos.metadata.settings_snapshot = None;
            assert!(expected_bracket(&pos, &meta()).is_none());
        }
    }
}
