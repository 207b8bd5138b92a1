//! Policy resolver
//!
//! Builds the effective per-user configuration by layering hard-coded
//! defaults, the user's own settings, the admin settings for any group the
//! user has set to `copy_admin`, and finally the per-symbol-category
//! override. Downstream components only ever see the flat [`UserPolicy`];
//! where a field came from is not their concern.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingType {
    FixedUsdt,
    Percent,
    ScalpingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculatorType {
    SimplePercent,
    RiskReward,
    AtrBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlMethod {
    PercentMargin,
    PercentEntry,
    FixedUsdt,
    AtrBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpStrategy {
    PartialClose,
    MainTpOnly,
    TrailingStop,
}

/// A wall-clock window, possibly crossing midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

impl TimeRange {
    /// Whether `minutes` (since local midnight) falls inside the window.
    /// Ranges with start > end wrap around midnight.
    pub fn contains(&self, minutes: u32) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if start <= end {
            minutes >= start && minutes < end
        } else {
            minutes >= start || minutes < end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryOverride {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_leverage: u32,
}

/// Symbol category for leverage caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    BtcEth,
    Major,
    Altcoin,
}

const MAJORS: &[&str] = &[
    "SOLUSDT", "BNBUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "AVAXUSDT", "DOTUSDT", "LINKUSDT",
    "LTCUSDT", "BCHUSDT", "MATICUSDT", "POLUSDT", "TRXUSDT", "ATOMUSDT", "NEARUSDT", "UNIUSDT",
];

impl SymbolCategory {
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "BTCUSDT" | "ETHUSDT" => SymbolCategory::BtcEth,
            s if MAJORS.contains(&s) => SymbolCategory::Major,
            _ => SymbolCategory::Altcoin,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            SymbolCategory::BtcEth => "BTC_ETH",
            SymbolCategory::Major => "MAJOR",
            SymbolCategory::Altcoin => "ALTCOIN",
        }
    }
}

/// Effective, resolved per-user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPolicy {
    pub bot_active: bool,

    // Which groups follow the admin's settings.
    pub money_mode: String,
    pub sl_tp_mode: String,
    pub tier_mode: String,

    // Money management
    pub position_sizing_type: SizingType,
    pub position_size_value: f64,
    pub max_margin_per_trade: f64,
    pub max_loss_per_trade: f64,
    pub sl_percent_min: f64,
    pub sl_percent_max: f64,
    pub max_open_positions: u32,
    pub daily_loss_limit: f64,
    pub daily_loss_percent: f64,
    pub loss_limit_type: String,
    pub default_leverage: u32,
    pub use_alert_leverage: bool,
    pub use_max_leverage_global: bool,
    pub symbol_leverage_overrides: HashMap<String, u32>,
    pub duplicate_alert_handling: String,
    pub require_profit_for_same_direction: bool,
    pub pnl_threshold_percent: f64,

    // SL / TP
    pub calculator_type: CalculatorType,
    pub sl_method: SlMethod,
    pub simple_sl_percent: f64,
    pub simple_tp_percent: f64,
    pub simple_tp2_percent: f64,
    pub simple_tp3_percent: f64,
    pub rr_ratio: f64,
    pub rr_sl_percent_margin: f64,
    pub tp1_rr_ratio: f64,
    pub tp2_rr_ratio: f64,
    pub tp3_rr_ratio: f64,
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,
    pub atr_tp2_multiplier: f64,
    pub atr_tp3_multiplier: f64,
    pub tp_strategy: TpStrategy,
    pub tp_levels: u8,
    pub tp1_close_percent: f64,
    pub tp2_close_percent: f64,
    pub tp3_close_percent: f64,
    pub sl_to_breakeven: bool,
    pub breakeven_trigger_tp: u8,
    pub trailing_stop: bool,
    pub trailing_stop_trigger_tp: u8,
    pub trailing_stop_distance: f64,
    pub taker_fee_rate: f64,
    pub include_fees_in_calculations: bool,
    pub min_profitable_tp_percent: f64,
    pub fee_aware_breakeven: bool,

    // Filters
    pub filter_by_tier: bool,
    pub allowed_tiers: Vec<String>,
    pub excluded_tiers: Vec<String>,
    pub alert_strength_threshold: f64,
    pub min_signal_strength_enabled: bool,
    pub min_signal_strength_threshold: f64,
    pub indicator_version_filter: Vec<String>,
    pub session_filtering_enabled: bool,
    pub allowed_sessions: Vec<String>,
    pub excluded_sessions: Vec<String>,
    pub time_filtering_enabled: bool,
    pub active_time_ranges: Vec<TimeRange>,
    pub user_timezone: String,

    pub category_settings: HashMap<String, CategoryOverride>,

    /// Set by the resolver from the matched category override; not persisted.
    #[serde(skip)]
    pub category_max_leverage: Option<u32>,
}

impl Default for UserPolicy {
    fn default() -> Self {
        Self {
            bot_active: true,
            money_mode: "custom".into(),
            sl_tp_mode: "custom".into(),
            tier_mode: "custom".into(),
            position_sizing_type: SizingType::FixedUsdt,
            position_size_value: 100.0,
            max_margin_per_trade: 100.0,
            max_loss_per_trade: 10.0,
            sl_percent_min: 0.5,
            sl_percent_max: 2.0,
            max_open_positions: 5,
            daily_loss_limit: 0.0,
            daily_loss_percent: 0.0,
            loss_limit_type: "usdt".into(),
            default_leverage: 10,
            use_alert_leverage: true,
            use_max_leverage_global: false,
            symbol_leverage_overrides: HashMap::new(),
            duplicate_alert_handling: "ignore".into(),
            require_profit_for_same_direction: false,
            pnl_threshold_percent: 0.0,
            calculator_type: CalculatorType::RiskReward,
            sl_method: SlMethod::PercentMargin,
            simple_sl_percent: 2.0,
            simple_tp_percent: 2.0,
            simple_tp2_percent: 4.0,
            simple_tp3_percent: 6.0,
            rr_ratio: 2.0,
            rr_sl_percent_margin: 10.0,
            tp1_rr_ratio: 1.0,
            tp2_rr_ratio: 2.0,
            tp3_rr_ratio: 3.0,
            atr_sl_multiplier: 1.5,
            atr_tp_multiplier: 1.0,
            atr_tp2_multiplier: 2.0,
            atr_tp3_multiplier: 3.0,
            tp_strategy: TpStrategy::PartialClose,
            tp_levels: 3,
            tp1_close_percent: 50.0,
            tp2_close_percent: 30.0,
            tp3_close_percent: 20.0,
            sl_to_breakeven: true,
            breakeven_trigger_tp: 1,
            trailing_stop: false,
            trailing_stop_trigger_tp: 2,
            trailing_stop_distance: 1.0,
            taker_fee_rate: 0.0006,
            include_fees_in_calculations: false,
            min_profitable_tp_percent: 0.0,
            fee_aware_breakeven: false,
            filter_by_tier: false,
            allowed_tiers: Vec::new(),
            excluded_tiers: Vec::new(),
            alert_strength_threshold: 0.0,
            min_signal_strength_enabled: false,
            min_signal_strength_threshold: 0.6,
            indicator_version_filter: Vec::new(),
            session_filtering_enabled: false,
            allowed_sessions: Vec::new(),
            excluded_sessions: Vec::new(),
            time_filtering_enabled: false,
            active_time_ranges: Vec::new(),
            user_timezone: "UTC".into(),
            category_settings: HashMap::new(),
            category_max_leverage: None,
        }
    }
}

const MONEY_FIELDS: &[&str] = &[
    "position_sizing_type",
    "position_size_value",
    "max_margin_per_trade",
    "max_loss_per_trade",
    "sl_percent_min",
    "sl_percent_max",
    "max_open_positions",
    "daily_loss_limit",
    "daily_loss_percent",
    "loss_limit_type",
    "default_leverage",
    "use_alert_leverage",
    "use_max_leverage_global",
    "symbol_leverage_overrides",
    "duplicate_alert_handling",
    "require_profit_for_same_direction",
    "pnl_threshold_percent",
];

const SL_TP_FIELDS: &[&str] = &[
    "calculator_type",
    "sl_method",
    "simple_sl_percent",
    "simple_tp_percent",
    "simple_tp2_percent",
    "simple_tp3_percent",
    "rr_ratio",
    "rr_sl_percent_margin",
    "tp1_rr_ratio",
    "tp2_rr_ratio",
    "tp3_rr_ratio",
    "atr_sl_multiplier",
    "atr_tp_multiplier",
    "atr_tp2_multiplier",
    "atr_tp3_multiplier",
    "tp_strategy",
    "tp_levels",
    "tp1_close_percent",
    "tp2_close_percent",
    "tp3_close_percent",
    "sl_to_breakeven",
    "breakeven_trigger_tp",
    "trailing_stop",
    "trailing_stop_trigger_tp",
    "trailing_stop_distance",
    "taker_fee_rate",
    "include_fees_in_calculations",
    "min_profitable_tp_percent",
    "fee_aware_breakeven",
];

const TIER_FIELDS: &[&str] = &[
    "filter_by_tier",
    "allowed_tiers",
    "excluded_tiers",
    "alert_strength_threshold",
    "min_signal_strength_enabled",
    "min_signal_strength_threshold",
    "indicator_version_filter",
    "session_filtering_enabled",
    "allowed_sessions",
    "excluded_sessions",
    "time_filtering_enabled",
    "active_time_ranges",
    "user_timezone",
];

/// Copy non-null top-level fields from `src` into `dest`, optionally
/// restricted to an allow-list. Settings are flat; structured values
/// (time ranges, category maps) replace wholesale.
fn overlay(dest: &mut Value, src: &Value, allowed: Option<&[&str]>) {
    let (Some(dest_map), Some(src_map)) = (dest.as_object_mut(), src.as_object()) else {
        return;
    };
    for (key, value) in src_map {
        if value.is_null() {
            continue;
        }
        if let Some(allowed) = allowed {
            if !allowed.contains(&key.as_str()) {
                continue;
            }
        }
        dest_map.insert(key.clone(), value.clone());
    }
}

/// Layer defaults ← user ← admin-copy groups, then apply the category cap.
pub fn resolve(
    user_json: Option<&Value>,
    admin_json: Option<&Value>,
    bot_active: bool,
    symbol: &str,
) -> UserPolicy {
    let mut merged = serde_json::to_value(UserPolicy::default()).unwrap_or(Value::Null);

    if let Some(user) = user_json {
        overlay(&mut merged, user, None);
    }

    if let Some(admin) = admin_json {
        for (mode_key, fields) in [
            ("money_mode", MONEY_FIELDS),
            ("sl_tp_mode", SL_TP_FIELDS),
            ("tier_mode", TIER_FIELDS),
        ] {
            let copies = merged
                .get(mode_key)
                .and_then(Value::as_str)
                .map(|m| m == "copy_admin")
                .unwrap_or(false);
            if copies {
                overlay(&mut merged, admin, Some(fields));
            }
        }
    }

    let mut policy: UserPolicy = serde_json::from_value(merged).unwrap_or_default();
    policy.bot_active = bot_active;

    let category = SymbolCategory::from_symbol(symbol);
    if let Some(ov) = policy.category_settings.get(category.key()) {
        if ov.enabled && ov.max_leverage > 0 {
            policy.category_max_leverage = Some(ov.max_leverage);
        }
    }

    policy
}

/// Resolve from the database for one (user, symbol).
pub fn resolve_for_user(db: &Db, user_id: &str, symbol: &str) -> Result<UserPolicy> {
    let user_row = db.get_user_settings(user_id)?;
    let admin_json = db.get_admin_settings()?;
    let (bot_active, user_json) = match &user_row {
        Some(row) => (row.bot_active, Some(&row.settings)),
        None => (false, None),
    };
    Ok(resolve(user_json, admin_json.as_ref(), bot_active, symbol))
}

impl UserPolicy {
    /// Leverage to open with: per-symbol override, else alert leverage when
    /// enabled, else default. The category override can only narrow.
    pub fn effective_leverage(&self, symbol: &str, alert_leverage: Option<u32>) -> u32 {
        let mut lev = match self.symbol_leverage_overrides.get(symbol) {
            Some(&lv) if lv > 0 => lv,
            _ => match (self.use_alert_leverage, alert_leverage) {
                (true, Some(lv)) if lv > 0 => lv,
                _ => self.default_leverage,
            },
        };
        if let Some(cap) = self.category_max_leverage {
            lev = lev.min(cap);
        }
        lev.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_no_rows() {
        let p = resolve(None, None, true, "BTCUSDT");
        assert_eq!(p.tp_levels, 3);
        assert_eq!(p.default_leverage, 10);
        assert!(p.bot_active);
    }

    #[test]
    fn user_settings_override_defaults() {
        let user = json!({"tp_levels": 2, "calculator_type": "simple_percent"});
        let p = resolve(Some(&user), None, true, "BTCUSDT");
        assert_eq!(p.tp_levels, 2);
        assert_eq!(p.calculator_type, CalculatorType::SimplePercent);
        // Untouched fields keep defaults.
        assert_eq!(p.tp1_close_percent, 50.0);
    }

    #[test]
    fn copy_admin_pulls_only_the_group() {
        let user = json!({
            "sl_tp_mode": "copy_admin",
            "tp_levels": 2,
            "position_size_value": 250.0,
        });
        let admin = json!({
            "tp_levels": 1,
            "position_size_value": 999.0,
        });
        let p = resolve(Some(&user), Some(&admin), true, "BTCUSDT");
        // sl_tp group copied from admin...
        assert_eq!(p.tp_levels, 1);
        // ...but money group stays the user's.
        assert_eq!(p.position_size_value, 250.0);
    }

    #[test]
    fn category_override_narrows_leverage() {
        let user = json!({
            "default_leverage": 25,
            "category_settings": {
                "ALTCOIN": {"enabled": true, "max_leverage": 10}
            }
        });
        let p = resolve(Some(&user), None, true, "PEPEUSDT");
        assert_eq!(p.category_max_leverage, Some(10));
        assert_eq!(p.effective_leverage("PEPEUSDT", Some(50)), 10);
        assert_eq!(p.effective_leverage("PEPEUSDT", None), 10);

        // Disabled override does not cap.
        let user = json!({
            "default_leverage": 25,
            "category_settings": {
                "ALTCOIN": {"enabled": false, "max_leverage": 10}
            }
        });
        let p = resolve(Some(&user), None, true, "PEPEUSDT");
        assert_eq!(p.effective_leverage("PEPEUSDT", None), 25);
    }

    #[test]
    fn alert_leverage_respected_when_enabled() {
        let p = resolve(None, None, true, "BTCUSDT");
        assert_eq!(p.effective_leverage("BTCUSDT", Some(20)), 20);

        let user = json!({"use_alert_leverage": false});
        let p = resolve(Some(&user), None, true, "BTCUSDT");
        assert_eq!(p.effective_leverage("BTCUSDT", Some(20)), 10);
    }

    #[test]
    fn symbol_override_wins_over_alert() {
        let user = json!({"symbol_leverage_overrides": {"BTCUSDT": 5}});
        let p = resolve(Some(&user), None, true, "BTCUSDT");
        assert_eq!(p.effective_leverage("BTCUSDT", Some(20)), 5);
    }

    #[test]
    fn symbol_categories() {
        assert_eq!(SymbolCategory::from_symbol("BTCUSDT"), SymbolCategory::BtcEth);
        assert_eq!(SymbolCategory::from_symbol("SOLUSDT"), SymbolCategory::Major);
        assert_eq!(SymbolCategory::from_symbol("PEPEUSDT"), SymbolCategory::Altcoin);
    }

    #[test]
    fn midnight_spanning_time_range() {
        let r = TimeRange {
            start: "22:00".into(),
            end: "01:00".into(),
        };
        assert!(r.contains(22 * 60 + 30));
        assert!(r.contains(30));
        assert!(!r.contains(2 * 60));

        let day = TimeRange {
            start: "09:00".into(),
            end: "17:00".into(),
        };
        assert!(day.contains(12 * 60));
        assert!(!day.contains(18 * 60));
    }
}
