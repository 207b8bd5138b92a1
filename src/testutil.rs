//! Test support: a scripted in-memory exchange and state fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::Config;
use crate::credentials::{CredentialVault, Credentials};
use crate::db::{BotLogger, Db};
use crate::exchange::{
    AccountBalance, BracketKind, BracketRequest, ContractMeta, Exchange, ExchangeConnector,
    ExchangeError, ExchangePosition, ExchangeResult, Fill, HoldSide, PlacedOrder, PlanCategory,
    PlanOrder, PlanType, PositionHistoryPage, Ticker, TradeSide,
};
use crate::AppState;

pub const TEST_KEY_HEX: &str =
    "abababababababababababababababababababababababababababababababab";

#[derive(Debug, Default)]
pub struct MockState {
    pub account: Option<AccountBalance>,
    pub positions: Vec<ExchangePosition>,
    pub tickers: HashMap<String, f64>,
    pub contracts: HashMap<String, ContractMeta>,
    pub plan_orders: Vec<PlanOrder>,
    pub fills: Vec<Fill>,
    /// Market close orders reduce the stored position when set.
    pub auto_reduce_on_close: bool,
    pub fail_get_positions: bool,
    pub fail_stop_loss_placement: bool,
    pub fail_take_profit_placement: bool,
    pub market_orders: Vec<(String, TradeSide, f64, bool)>,
    pub cancelled_orders: Vec<String>,
    pub leverage_calls: Vec<(String, HoldSide, u32)>,
    next_order_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_order_id += 1;
        format!("{prefix}-{}", self.next_order_id)
    }
}

#[derive(Default)]
pub struct MockExchange {
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_position(&self, symbol: &str, hold_side: HoldSide, size: f64, entry: f64) {
        let mut state = self.state.lock();
        state.positions.retain(|p| !(p.symbol == symbol && p.hold_side == hold_side));
        if size > 0.0 {
            state.positions.push(ExchangePosition {
                symbol: symbol.to_string(),
                hold_side,
                total_size: size,
                average_entry: entry,
                leverage: 10,
            });
        }
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.state.lock().tickers.insert(symbol.to_string(), price);
    }

    pub fn set_contract(&self, meta: ContractMeta) {
        self.state.lock().contracts.insert(meta.symbol.clone(), meta);
    }

    pub fn live_order_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .plan_orders
            .iter()
            .map(|o| o.order_id.clone())
            .collect()
    }
}

pub fn default_meta(symbol: &str) -> ContractMeta {
    ContractMeta {
        symbol: symbol.to_string(),
        price_places: 2,
        volume_places: 1,
        min_qty: 0.1,
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_account(&self) -> ExchangeResult<AccountBalance> {
        self.state.lock().account.ok_or_else(|| ExchangeError::Api {
            code: "mock".into(),
            message: "no account scripted".into(),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let state = self.state.lock();
        if state.fail_get_positions {
            return Err(ExchangeError::Http { status: 503 });
        }
        Ok(state.positions.clone())
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>> {
        Ok(self
            .state
            .lock()
            .positions
            .iter()
            .find(|p| p.symbol == symbol && p.total_size > 0.0)
            .cloned())
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.state
            .lock()
            .tickers
            .get(symbol)
            .map(|&last_price| Ticker {
                symbol: symbol.to_string(),
                last_price,
            })
            .ok_or_else(|| ExchangeError::Decode(format!("no ticker for {symbol}")))
    }

    async fn get_contract_meta(&self, symbol: &str) -> ExchangeResult<ContractMeta> {
        Ok(self
            .state
            .lock()
            .contracts
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| default_meta(symbol)))
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: TradeSide,
        size: f64,
        _price: Option<f64>,
        reduce_only: bool,
    ) -> ExchangeResult<PlacedOrder> {
        let mut state = self.state.lock();
        state
            .market_orders
            .push((symbol.to_string(), side, size, reduce_only));
        if side.is_close() && state.auto_reduce_on_close {
            let hold = side.hold_side();
            for p in &mut state.positions {
                if p.symbol == symbol && p.hold_side == hold {
                    p.total_size = (p.total_size - size).max(0.0);
                }
            }
            state.positions.retain(|p| p.total_size > 0.0);
        }
        let id = state.next_id("mkt");
        Ok(PlacedOrder { order_id: id })
    }

    async fn place_bracket(&self, req: &BracketRequest) -> ExchangeResult<PlacedOrder> {
        let mut state = self.state.lock();
        let failing = match req.kind {
            BracketKind::StopLoss => state.fail_stop_loss_placement,
            BracketKind::TakeProfit => state.fail_take_profit_placement,
        };
        if failing {
            return Err(ExchangeError::Api {
                code: "40034".into(),
                message: "plan order rejected".into(),
            });
        }
        let (prefix, plan_type) = match req.kind {
            BracketKind::StopLoss => ("sl", PlanType::PosLoss),
            BracketKind::TakeProfit => ("tp", PlanType::NormalPlan),
        };
        let order_id = state.next_id(prefix);
        state.plan_orders.push(PlanOrder {
            order_id: order_id.clone(),
            symbol: req.symbol.clone(),
            plan_type,
            trigger_price: req.trigger_price,
            size: req.size.unwrap_or(0.0),
            is_close: true,
            hold_side: req.hold_side,
        });
        Ok(PlacedOrder { order_id })
    }

    async fn cancel_plan(
        &self,
        _symbol: &str,
        order_id: &str,
        _category: PlanCategory,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        state.cancelled_orders.push(order_id.to_string());
        state.plan_orders.retain(|o| o.order_id != order_id);
        Ok(())
    }

    async fn modify_plan(
        &self,
        _symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        for order in &mut state.plan_orders {
            if order.order_id == order_id {
                order.trigger_price = trigger_price;
            }
        }
        Ok(())
    }

    async fn flash_close(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        size: Option<f64>,
    ) -> ExchangeResult<bool> {
        let mut state = self.state.lock();
        let mut reduced = false;
        for p in &mut state.positions {
            if p.symbol == symbol && p.hold_side == hold_side {
                let cut = size.unwrap_or(p.total_size);
                p.total_size = (p.total_size - cut).max(0.0);
                reduced = true;
            }
        }
        state.positions.retain(|p| p.total_size > 0.0);
        Ok(reduced)
    }

    async fn list_plan_orders(
        &self,
        symbol: Option<&str>,
        category: PlanCategory,
    ) -> ExchangeResult<Vec<PlanOrder>> {
        Ok(self
            .state
            .lock()
            .plan_orders
            .iter()
            .filter(|o| o.plan_type.category() == category)
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_fill_history(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        _limit: u32,
    ) -> ExchangeResult<Vec<Fill>> {
        Ok(self
            .state
            .lock()
            .fills
            .iter()
            .filter(|f| f.symbol == symbol && f.ts_ms >= from_ms && f.ts_ms <= to_ms)
            .cloned()
            .collect())
    }

    async fn get_position_history(
        &self,
        _symbol: &str,
        _from_ms: i64,
        _to_ms: i64,
        _cursor: Option<&str>,
    ) -> ExchangeResult<PositionHistoryPage> {
        Ok(PositionHistoryPage::default())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        leverage: u32,
    ) -> ExchangeResult<()> {
        self.state
            .lock()
            .leverage_calls
            .push((symbol.to_string(), hold_side, leverage));
        Ok(())
    }
}

pub struct MockConnector {
    pub exchange: Arc<MockExchange>,
}

impl ExchangeConnector for MockConnector {
    fn connect(&self, _creds: &Credentials) -> Arc<dyn Exchange> {
        self.exchange.clone()
    }
}

pub fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        port: 0,
        exchange_base_url: "http://localhost".into(),
        monitor_interval_secs: 5,
        monitor_lease_ttl_secs: 120,
        encryption_key_hex: TEST_KEY_HEX.into(),
        dispatch_concurrency: 10,
        dry_run: false,
    }
}

/// AppState wired to an in-memory database and the given mock exchange.
pub fn test_state(mock: Arc<MockExchange>) -> Arc<AppState> {
    let db = Db::open_in_memory().expect("in-memory db");
    let vault = CredentialVault::new(db.clone(), TEST_KEY_HEX).expect("vault");
    Arc::new(AppState {
        config: test_config(),
        db,
        vault,
        connector: Arc::new(MockConnector { exchange: mock }),
        bot_log: BotLogger::disabled(),
    })
}

/// Create a user with settings and active (encrypted) credentials.
pub fn seed_user(state: &AppState, user_id: &str, settings: Value) {
    state
        .db
        .upsert_user_settings(user_id, &settings)
        .expect("settings");
    state
        .vault
        .store(
            user_id,
            &Credentials {
                api_key: format!("{user_id}-key"),
                secret: format!("{user_id}-secret"),
                passphrase: format!("{user_id}-pass"),
            },
        )
        .expect("credentials");
}
