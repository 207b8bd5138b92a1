//! Bitget USDT-M futures REST client (v2 mix endpoints).
//!
//! All numeric fields come back as strings on the wire; everything is parsed
//! at the boundary so the rest of the engine only sees typed values.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::credentials::Credentials;

use super::{
    AccountBalance, BracketKind, BracketRequest, ContractMeta, Exchange, ExchangeConnector,
    ExchangeError, ExchangePosition, ExchangeResult, Fill, HistoricalPosition, HoldSide,
    PlacedOrder, PlanCategory, PlanOrder, PlanType, PositionHistoryPage, Ticker, TradeSide,
};

const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds per-user clients sharing one connection pool.
pub struct BitgetConnector {
    http: Client,
    base_url: String,
}

impl BitgetConnector {
    pub fn new(base_url: &str) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("alertbot/1.0")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl ExchangeConnector for BitgetConnector {
    fn connect(&self, creds: &Credentials) -> Arc<dyn Exchange> {
        Arc::new(BitgetClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            creds: creds.clone(),
        })
    }
}

pub struct BitgetClient {
    http: Client,
    base_url: String,
    creds: Credentials,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    msg: Option<String>,
    data: Option<T>,
}

fn num(s: &str) -> ExchangeResult<f64> {
    s.parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("bad number: {s:?}")))
}

fn opt_num(s: &Option<String>) -> f64 {
    s.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

impl BitgetClient {
    fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path_with_query: &str,
        body: &str,
    ) -> ExchangeResult<String> {
        let prehash = format!("{timestamp}{method}{path_with_query}{body}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.creds.secret.as_bytes())
            .map_err(|_| ExchangeError::Unauthorized("invalid secret key".into()))?;
        mac.update(prehash.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> ExchangeResult<T> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let path_with_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };

        let timestamp = Utc::now().timestamp_millis().to_string();
        let sign = self.sign(&timestamp, "GET", &path_with_query, "")?;

        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path_with_query))
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", sign)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.creds.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US")
            .send()
            .await?;

        Self::decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> ExchangeResult<T> {
        let body_str = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Decode(format!("encode body: {e}")))?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let sign = self.sign(&timestamp, "POST", path, &body_str)?;

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", sign)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.creds.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US")
            .body(body_str)
            .send()
            .await?;

        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> ExchangeResult<T> {
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ExchangeError::Unauthorized(format!("http {status}")));
        }
        if !status.is_success() {
            return Err(ExchangeError::Http {
                status: status.as_u16(),
            });
        }

        let envelope: Envelope<T> = resp.json().await?;
        if envelope.code != "00000" {
            return Err(ExchangeError::Api {
                code: envelope.code,
                message: envelope.msg.unwrap_or_default(),
            });
        }
        envelope
            .data
            .ok_or_else(|| ExchangeError::Decode("missing data".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAccount {
    margin_coin: String,
    available: Option<String>,
    account_equity: Option<String>,
    #[serde(rename = "usdtEquity")]
    usdt_equity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    symbol: String,
    hold_side: String,
    total: Option<String>,
    open_price_avg: Option<String>,
    leverage: Option<String>,
}

impl WirePosition {
    fn into_position(self) -> Option<ExchangePosition> {
        let size = opt_num(&self.total);
        if size <= 0.0 {
            return None;
        }
        Some(ExchangePosition {
            hold_side: HoldSide::parse(&self.hold_side)?,
            symbol: self.symbol,
            total_size: size,
            average_entry: opt_num(&self.open_price_avg),
            leverage: opt_num(&self.leverage).max(1.0) as u32,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTicker {
    symbol: String,
    last_pr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContract {
    symbol: String,
    price_place: String,
    volume_place: String,
    min_trade_num: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrderId {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePlanList {
    entrusted_list: Option<Vec<WirePlanOrder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePlanOrder {
    order_id: String,
    symbol: String,
    plan_type: String,
    trigger_price: Option<String>,
    size: Option<String>,
    side: Option<String>,
    trade_side: Option<String>,
    hold_side: Option<String>,
    plan_status: Option<String>,
    status: Option<String>,
}

impl WirePlanOrder {
    fn into_plan_order(self) -> Option<PlanOrder> {
        let status = self
            .plan_status
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or("live");
        if status != "live" && status != "not_trigger" {
            return None;
        }
        let plan_type = PlanType::parse(&self.plan_type)?;
        // Position-attached SL/TP orders are inherently close-side.
        let is_close = plan_type.category() == PlanCategory::ProfitLoss
            || self.trade_side.as_deref() == Some("close");
        let hold_side = self
            .hold_side
            .as_deref()
            .and_then(HoldSide::parse)
            .or_else(|| match self.side.as_deref() {
                Some("buy") => Some(HoldSide::Long),
                Some("sell") => Some(HoldSide::Short),
                _ => None,
            })?;
        Some(PlanOrder {
            order_id: self.order_id,
            symbol: self.symbol,
            plan_type,
            trigger_price: opt_num(&self.trigger_price),
            size: opt_num(&self.size),
            is_close,
            hold_side,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFillList {
    fill_list: Option<Vec<WireFill>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFill {
    symbol: String,
    trade_side: Option<String>,
    price: String,
    base_volume: String,
    c_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHistoryList {
    list: Option<Vec<WireHistoryPosition>>,
    end_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHistoryPosition {
    symbol: String,
    hold_side: String,
    close_avg_price: Option<String>,
    pnl: Option<String>,
    u_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFlashClose {
    success_list: Option<Vec<Value>>,
}

#[async_trait]
impl Exchange for BitgetClient {
    async fn get_account(&self) -> ExchangeResult<AccountBalance> {
        let accounts: Vec<WireAccount> = self
            .get(
                "/api/v2/mix/account/accounts",
                &[("productType", PRODUCT_TYPE)],
            )
            .await?;
        let usdt = accounts
            .into_iter()
            .find(|a| a.margin_coin.eq_ignore_ascii_case(MARGIN_COIN))
            .ok_or_else(|| ExchangeError::Decode("no USDT account".into()))?;
        Ok(AccountBalance {
            available: opt_num(&usdt.available),
            equity: opt_num(&usdt.usdt_equity.clone().or(usdt.account_equity)),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let raw: Vec<WirePosition> = self
            .get(
                "/api/v2/mix/position/all-position",
                &[("productType", PRODUCT_TYPE), ("marginCoin", MARGIN_COIN)],
            )
            .await?;
        Ok(raw.into_iter().filter_map(WirePosition::into_position).collect())
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>> {
        let raw: Vec<WirePosition> = self
            .get(
                "/api/v2/mix/position/single-position",
                &[
                    ("symbol", symbol),
                    ("productType", PRODUCT_TYPE),
                    ("marginCoin", MARGIN_COIN),
                ],
            )
            .await?;
        Ok(raw.into_iter().filter_map(WirePosition::into_position).next())
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let raw: Vec<WireTicker> = self
            .get(
                "/api/v2/mix/market/ticker",
                &[("symbol", symbol), ("productType", PRODUCT_TYPE)],
            )
            .await?;
        let t = raw
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode(format!("no ticker for {symbol}")))?;
        Ok(Ticker {
            last_price: num(&t.last_pr)?,
            symbol: t.symbol,
        })
    }

    async fn get_contract_meta(&self, symbol: &str) -> ExchangeResult<ContractMeta> {
        let raw: Vec<WireContract> = self
            .get(
                "/api/v2/mix/market/contracts",
                &[("productType", PRODUCT_TYPE), ("symbol", symbol)],
            )
            .await?;
        let c = raw
            .into_iter()
            .find(|c| c.symbol == symbol)
            .ok_or_else(|| ExchangeError::Decode(format!("unknown contract {symbol}")))?;
        Ok(ContractMeta {
            symbol: c.symbol,
            price_places: num(&c.price_place)? as u32,
            volume_places: num(&c.volume_place)? as u32,
            min_qty: num(&c.min_trade_num)?,
        })
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: TradeSide,
        size: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> ExchangeResult<PlacedOrder> {
        // Hedge mode: `side` names the position side, `tradeSide` the intent.
        let (pos_side, trade_side) = match side {
            TradeSide::OpenLong => ("buy", "open"),
            TradeSide::OpenShort => ("sell", "open"),
            TradeSide::CloseLong => ("buy", "close"),
            TradeSide::CloseShort => ("sell", "close"),
        };
        let mut body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": "crossed",
            "marginCoin": MARGIN_COIN,
            "size": format!("{size}"),
            "side": pos_side,
            "tradeSide": trade_side,
            "orderType": if price.is_some() { "limit" } else { "market" },
            "force": if side.is_close() { "ioc" } else { "gtc" },
            "clientOid": Uuid::new_v4().to_string(),
        });
        if let Some(p) = price {
            body["price"] = json!(format!("{p}"));
        }
        if reduce_only {
            body["reduceOnly"] = json!("YES");
        }
        debug!(symbol, ?side, size, "placing market order");
        let id: WireOrderId = self.post("/api/v2/mix/order/place-order", &body).await?;
        Ok(PlacedOrder {
            order_id: id.order_id,
        })
    }

    async fn place_bracket(&self, req: &BracketRequest) -> ExchangeResult<PlacedOrder> {
        let id: WireOrderId = match req.kind {
            BracketKind::StopLoss => {
                let mut body = json!({
                    "marginCoin": MARGIN_COIN,
                    "productType": PRODUCT_TYPE,
                    "symbol": req.symbol,
                    "planType": "pos_loss",
                    "triggerPrice": format!("{}", req.trigger_price),
                    "triggerType": "mark_price",
                    "executePrice": format!("{}", req.execute_price),
                    "holdSide": req.hold_side.as_str(),
                });
                if let Some(size) = req.size {
                    body["size"] = json!(format!("{size}"));
                }
                self.post("/api/v2/mix/order/place-tpsl-order", &body).await?
            }
            BracketKind::TakeProfit => {
                let size = req.size.unwrap_or(0.0);
                let body = json!({
                    "planType": "normal_plan",
                    "symbol": req.symbol,
                    "productType": PRODUCT_TYPE,
                    "marginMode": "crossed",
                    "marginCoin": MARGIN_COIN,
                    "size": format!("{size}"),
                    "triggerPrice": format!("{}", req.trigger_price),
                    "triggerType": "mark_price",
                    "side": match req.hold_side {
                        HoldSide::Long => "buy",
                        HoldSide::Short => "sell",
                    },
                    "tradeSide": "close",
                    "orderType": if req.execute_price > 0.0 { "limit" } else { "market" },
                    "clientOid": Uuid::new_v4().to_string(),
                    "reduceOnly": "YES",
                });
                self.post("/api/v2/mix/order/place-plan-order", &body).await?
            }
        };
        Ok(PlacedOrder {
            order_id: id.order_id,
        })
    }

    async fn cancel_plan(
        &self,
        symbol: &str,
        order_id: &str,
        category: PlanCategory,
    ) -> ExchangeResult<()> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": category.as_str(),
            "orderIdList": [{"orderId": order_id}],
        });
        let _: Value = self.post("/api/v2/mix/order/cancel-plan-order", &body).await?;
        Ok(())
    }

    async fn modify_plan(
        &self,
        symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> ExchangeResult<()> {
        let body = json!({
            "orderId": order_id,
            "marginCoin": MARGIN_COIN,
            "productType": PRODUCT_TYPE,
            "symbol": symbol,
            "triggerPrice": format!("{trigger_price}"),
            "triggerType": "mark_price",
        });
        let _: Value = self.post("/api/v2/mix/order/modify-tpsl-order", &body).await?;
        Ok(())
    }

    async fn flash_close(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        size: Option<f64>,
    ) -> ExchangeResult<bool> {
        let mut body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "holdSide": hold_side.as_str(),
        });
        if let Some(size) = size {
            body["size"] = json!(format!("{size}"));
        }
        let out: WireFlashClose = self.post("/api/v2/mix/order/close-positions", &body).await?;
        Ok(out.success_list.map(|l| !l.is_empty()).unwrap_or(false))
    }

    async fn list_plan_orders(
        &self,
        symbol: Option<&str>,
        category: PlanCategory,
    ) -> ExchangeResult<Vec<PlanOrder>> {
        let mut params = vec![
            ("productType", PRODUCT_TYPE),
            ("planType", category.as_str()),
        ];
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol));
        }
        let raw: WirePlanList = self
            .get("/api/v2/mix/order/orders-plan-pending", &params)
            .await?;
        let mut orders: Vec<PlanOrder> = raw
            .entrusted_list
            .unwrap_or_default()
            .into_iter()
            .filter_map(WirePlanOrder::into_plan_order)
            .collect();
        if let Some(symbol) = symbol {
            orders.retain(|o| o.symbol == symbol);
        }
        Ok(orders)
    }

    async fn get_fill_history(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        limit: u32,
    ) -> ExchangeResult<Vec<Fill>> {
        let from = from_ms.to_string();
        let to = to_ms.to_string();
        let limit = limit.to_string();
        let raw: WireFillList = self
            .get(
                "/api/v2/mix/order/fills",
                &[
                    ("symbol", symbol),
                    ("productType", PRODUCT_TYPE),
                    ("startTime", &from),
                    ("endTime", &to),
                    ("limit", &limit),
                ],
            )
            .await?;
        Ok(raw
            .fill_list
            .unwrap_or_default()
            .into_iter()
            .filter_map(|f| {
                Some(Fill {
                    is_close: f
                        .trade_side
                        .as_deref()
                        .map(|s| s.contains("close"))
                        .unwrap_or(false),
                    price: f.price.parse().ok()?,
                    size: f.base_volume.parse().ok()?,
                    ts_ms: f.c_time.parse().ok()?,
                    symbol: f.symbol,
                })
            })
            .collect())
    }

    async fn get_position_history(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        cursor: Option<&str>,
    ) -> ExchangeResult<PositionHistoryPage> {
        let from = from_ms.to_string();
        let to = to_ms.to_string();
        let mut params = vec![
            ("symbol", symbol),
            ("productType", PRODUCT_TYPE),
            ("startTime", from.as_str()),
            ("endTime", to.as_str()),
        ];
        if let Some(cursor) = cursor {
            params.push(("idLessThan", cursor));
        }
        let raw: WireHistoryList = self
            .get("/api/v2/mix/position/history-position", &params)
            .await?;
        let items = raw
            .list
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                Some(HistoricalPosition {
                    hold_side: HoldSide::parse(&p.hold_side)?,
                    close_avg_price: opt_num(&p.close_avg_price),
                    pnl: opt_num(&p.pnl),
                    closed_ts_ms: p.u_time.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0),
                    symbol: p.symbol,
                })
            })
            .collect();
        Ok(PositionHistoryPage {
            items,
            next_cursor: raw.end_id,
        })
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        hold_side: HoldSide,
        leverage: u32,
    ) -> ExchangeResult<()> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
            "holdSide": hold_side.as_str(),
        });
        let _: Value = self.post("/api/v2/mix/account/set-leverage", &body).await?;
        Ok(())
    }
}
