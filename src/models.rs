//! Shared domain types
//!
//! The webhook payload is freeform JSON from the indicator; we validate it
//! into [`NormalizedSignal`] and keep the raw blob verbatim for audit.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signal direction as sent by the indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Side::Buy),
            "SELL" | "SHORT" => Ok(Side::Sell),
            other => bail!("unknown side: {other}"),
        }
    }

    /// Direction sign: +1 for longs, -1 for shorts. Price targets move with it.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Strip exchange decorations from an indicator symbol.
///
/// TradingView sends things like `BITGET:BTCUSDT.P`; the exchange wants
/// `BTCUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    let s = raw.trim();
    let s = match s.split_once(':') {
        Some((_, rest)) => rest,
        None => s,
    };
    let s = s.strip_suffix(".P").unwrap_or(s);
    s.to_ascii_uppercase()
}

/// A validated signal, one per webhook delivery, fanned out to every user.
#[derive(Debug, Clone)]
pub struct NormalizedSignal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub sl: Option<f64>,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
    pub main_tp: Option<f64>,
    pub atr: Option<f64>,
    pub leverage: Option<u32>,
    pub strength: Option<f64>,
    pub tier: Option<String>,
    pub mode: Option<String>,
    pub indicator_version: Option<String>,
    /// Signal creation time at the source, ms since epoch.
    pub tv_ts: Option<i64>,
    /// Session label supplied by the indicator, if any.
    pub session: Option<String>,
    pub is_test: bool,
    /// The payload exactly as received.
    pub raw: Value,
}

fn get_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(f) = s.parse::<f64>() {
                    return Some(f);
                }
            }
            _ => {}
        }
    }
    None
}

fn get_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

impl NormalizedSignal {
    pub fn from_value(raw: Value) -> Result<Self> {
        let symbol_raw = get_str(&raw, &["symbol"]).context("missing symbol")?;
        let symbol = normalize_symbol(&symbol_raw);
        if symbol.is_empty() {
            bail!("empty symbol after normalization");
        }

        let side_raw = get_str(&raw, &["side"]).context("missing side")?;
        let side = Side::parse(&side_raw)?;

        let entry_price =
            get_f64(&raw, &["entryPrice", "price"]).context("missing entryPrice/price")?;
        if !(entry_price.is_finite() && entry_price > 0.0) {
            bail!("invalid entry price: {entry_price}");
        }

        let session = raw
            .get("timing")
            .and_then(|t| t.get("session"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            symbol,
            side,
            entry_price,
            sl: get_f64(&raw, &["sl"]),
            tp1: get_f64(&raw, &["tp1"]),
            tp2: get_f64(&raw, &["tp2"]),
            tp3: get_f64(&raw, &["tp3"]),
            main_tp: get_f64(&raw, &["mainTp", "main_tp"]),
            atr: get_f64(&raw, &["atr"]),
            leverage: get_f64(&raw, &["leverage"]).map(|l| l.max(1.0) as u32),
            strength: get_f64(&raw, &["strength"]),
            tier: get_str(&raw, &["tier"]),
            mode: get_str(&raw, &["mode"]),
            indicator_version: get_str(&raw, &["version", "_indicator_version"]),
            tv_ts: get_f64(&raw, &["tv_ts"]).map(|t| t as i64),
            session,
            is_test: raw.get("is_test").and_then(Value::as_bool).unwrap_or(false),
            raw,
        })
    }
}
