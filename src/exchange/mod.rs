//! Exchange gateway
//!
//! A typed verb set over the exchange's REST surface. The trait is what the
//! engine programs against; [`bitget::BitgetClient`] is the production
//! implementation and tests script a mock. Signing and time sync are the
//! gateway's concern alone; retry policy lives in callers.

pub mod bitget;
pub mod error;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::models::Side;

pub use error::{ExchangeError, ExchangeResult};

/// Position side held on a hedge-mode account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldSide {
    Long,
    Short,
}

impl HoldSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldSide::Long => "long",
            HoldSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Some(HoldSide::Long),
            "short" => Some(HoldSide::Short),
            _ => None,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            HoldSide::Long => Side::Buy,
            HoldSide::Short => Side::Sell,
        }
    }
}

impl From<Side> for HoldSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => HoldSide::Long,
            Side::Sell => HoldSide::Short,
        }
    }
}

/// Order intent on a hedge-mode account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl TradeSide {
    pub fn open(side: Side) -> Self {
        match side {
            Side::Buy => TradeSide::OpenLong,
            Side::Sell => TradeSide::OpenShort,
        }
    }

    pub fn close(hold: HoldSide) -> Self {
        match hold {
            HoldSide::Long => TradeSide::CloseLong,
            HoldSide::Short => TradeSide::CloseShort,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, TradeSide::CloseLong | TradeSide::CloseShort)
    }

    pub fn hold_side(&self) -> HoldSide {
        match self {
            TradeSide::OpenLong | TradeSide::CloseLong => HoldSide::Long,
            TradeSide::OpenShort | TradeSide::CloseShort => HoldSide::Short,
        }
    }
}

/// Listing category for conditional orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanCategory {
    /// Position-attached SL/TP orders.
    ProfitLoss,
    /// Standalone trigger orders (our TP legs).
    NormalPlan,
}

impl PlanCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCategory::ProfitLoss => "profit_loss",
            PlanCategory::NormalPlan => "normal_plan",
        }
    }
}

/// Conditional order type as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanType {
    PosLoss,
    PosProfit,
    ProfitLoss,
    NormalPlan,
}

impl PlanType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pos_loss" | "loss_plan" | "position_stop_loss" => Some(PlanType::PosLoss),
            "pos_profit" | "profit_plan" | "position_take_profit" => Some(PlanType::PosProfit),
            "profit_loss" => Some(PlanType::ProfitLoss),
            "normal_plan" => Some(PlanType::NormalPlan),
            _ => None,
        }
    }

    pub fn category(&self) -> PlanCategory {
        match self {
            PlanType::NormalPlan => PlanCategory::NormalPlan,
            _ => PlanCategory::ProfitLoss,
        }
    }

    pub fn is_stop_loss(&self) -> bool {
        matches!(self, PlanType::PosLoss | PlanType::ProfitLoss)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccountBalance {
    pub available: f64,
    pub equity: f64,
}

/// A live position as the exchange reports it.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub hold_side: HoldSide,
    pub total_size: f64,
    pub average_entry: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
}

/// Per-contract precision and lot constraints.
#[derive(Debug, Clone)]
pub struct ContractMeta {
    pub symbol: String,
    pub price_places: u32,
    pub volume_places: u32,
    pub min_qty: f64,
}

/// A live conditional order.
#[derive(Debug, Clone)]
pub struct PlanOrder {
    pub order_id: String,
    pub symbol: String,
    pub plan_type: PlanType,
    pub trigger_price: f64,
    pub size: f64,
    pub is_close: bool,
    pub hold_side: HoldSide,
}

/// One execution from fill history.
#[derive(Debug, Clone)]
pub struct Fill {
    pub symbol: String,
    pub is_close: bool,
    pub price: f64,
    pub size: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct HistoricalPosition {
    pub symbol: String,
    pub hold_side: HoldSide,
    pub close_avg_price: f64,
    pub pnl: f64,
    pub closed_ts_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PositionHistoryPage {
    pub items: Vec<HistoricalPosition>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketKind {
    StopLoss,
    TakeProfit,
}

/// A protective order to be placed.
#[derive(Debug, Clone)]
pub struct BracketRequest {
    pub symbol: String,
    pub kind: BracketKind,
    pub hold_side: HoldSide,
    pub trigger_price: f64,
    /// None means "whole position" (only valid for SL).
    pub size: Option<f64>,
    /// 0 executes at market when triggered.
    pub execute_price: f64,
}

/// One entry in a grouped placement round.
#[derive(Debug, Clone)]
pub struct BatchOp {
    pub id: String,
    pub request: BracketRequest,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub id: String,
    pub result: ExchangeResult<PlacedOrder>,
}

/// The verb set the engine needs. One instance is bound to one user's
/// credentials.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_account(&self) -> ExchangeResult<AccountBalance>;

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    /// None when the exchange reports no position (or zero size) for the
    /// symbol.
    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>>;

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    async fn get_contract_meta(&self, symbol: &str) -> ExchangeResult<ContractMeta>;

    /// Market order; `price` switches to a limit order (used by the
    /// reduce-only close fallback). Close orders go out IOC + reduce-only.
    async fn place_market(
        &self,
        symbol: &str,
        side: TradeSide,
        size: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> ExchangeResult<PlacedOrder>;

    async fn place_bracket(&self, req: &BracketRequest) -> ExchangeResult<PlacedOrder>;

    async fn cancel_plan(
        &self,
        symbol: &str,
        order_id: &str,
        category: PlanCategory,
    ) -> ExchangeResult<()>;

    async fn modify_plan(
        &self,
        symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> ExchangeResult<()>;

    /// Returns true iff the exchange confirmed a reduction.
    async fn flash_close(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        size: Option<f64>,
    ) -> ExchangeResult<bool>;

    /// Live orders only, optionally filtered by symbol.
    async fn list_plan_orders(
        &self,
        symbol: Option<&str>,
        category: PlanCategory,
    ) -> ExchangeResult<Vec<PlanOrder>>;

    async fn get_fill_history(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        limit: u32,
    ) -> ExchangeResult<Vec<Fill>>;

    async fn get_position_history(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        cursor: Option<&str>,
    ) -> ExchangeResult<PositionHistoryPage>;

    async fn set_leverage(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        leverage: u32,
    ) -> ExchangeResult<()>;

    /// Sequential grouped placement; per-op results keyed by the caller's id.
    /// One batch is one placement round from the caller's point of view.
    async fn batch(&self, ops: Vec<BatchOp>) -> Vec<BatchOutcome> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let result = self.place_bracket(&op.request).await;
            out.push(BatchOutcome { id: op.id, result });
        }
        out
    }
}

/// Builds a per-user gateway from decrypted credentials.
pub trait ExchangeConnector: Send + Sync {
    fn connect(&self, creds: &Credentials) -> Arc<dyn Exchange>;
}
