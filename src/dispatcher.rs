//! Signal dispatcher
//!
//! One webhook signal fans out to every user with a settings row: persist an
//! alert, run the filter ladder, and hand survivors to the opener. Users run
//! in parallel under a hard concurrency cap; within a user the steps are
//! sequential.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialStatus;
use crate::db::{AlertRow, AlertStatus};
use crate::models::NormalizedSignal;
use crate::monitor::finalize;
use crate::opener;
use crate::policy::{self, UserPolicy};
use crate::AppState;

/// Trading session derived from the UTC hour. Overlaps resolve
/// London > New York > Asia > Sydney.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    London,
    NewYork,
    Asia,
    Sydney,
    OffHours,
}

impl Session {
    pub fn label(&self) -> &'static str {
        match self {
            Session::London => "London",
            Session::NewYork => "New York",
            Session::Asia => "Asia",
            Session::Sydney => "Sydney",
            Session::OffHours => "Off-Hours",
        }
    }
}

/// Session windows (UTC): Sydney 21–06, Asia 00–09, London 07–16, NY 12–21.
pub fn session_for_utc_hour(hour: u32) -> Session {
    if (7..16).contains(&hour) {
        Session::London
    } else if (12..21).contains(&hour) {
        Session::NewYork
    } else if hour < 9 {
        Session::Asia
    } else if hour >= 21 {
        Session::Sydney
    } else {
        Session::OffHours
    }
}

fn parse_session_label(s: &str) -> Session {
    let norm: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match norm.as_str() {
        "london" => Session::London,
        "newyork" | "ny" => Session::NewYork,
        "asia" | "tokyo" => Session::Asia,
        "sydney" => Session::Sydney,
        _ => Session::OffHours,
    }
}

fn session_matches(list: &[String], session: Session) -> bool {
    list.iter().any(|s| parse_session_label(s) == session)
}

/// First filter that rejects the signal, in the documented order.
pub fn filter_reason(
    policy: &UserPolicy,
    signal: &NormalizedSignal,
    now: DateTime<Utc>,
) -> Option<String> {
    if !policy.indicator_version_filter.is_empty() {
        let ok = signal
            .indicator_version
            .as_ref()
            .map(|v| policy.indicator_version_filter.iter().any(|a| a == v))
            .unwrap_or(false);
        if !ok {
            return Some(format!(
                "indicator version {} not in allow-list",
                signal.indicator_version.as_deref().unwrap_or("<none>")
            ));
        }
    }

    if let Some(tier) = &signal.tier {
        if policy
            .excluded_tiers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tier))
        {
            return Some(format!("tier {tier} excluded"));
        }
        if policy.filter_by_tier
            && !policy.allowed_tiers.is_empty()
            && !policy
                .allowed_tiers
                .iter()
                .any(|t| t.eq_ignore_ascii_case(tier))
        {
            return Some(format!("tier {tier} not allowed"));
        }
    }

    if policy.min_signal_strength_enabled {
        let strength = signal.strength.unwrap_or(0.0);
        let threshold = policy
            .min_signal_strength_threshold
            .max(policy.alert_strength_threshold);
        if strength < threshold {
            return Some(format!("strength {strength:.2} below threshold {threshold:.2}"));
        }
    }

    if policy.session_filtering_enabled {
        let session = signal
            .session
            .as_deref()
            .map(parse_session_label)
            .unwrap_or_else(|| session_for_utc_hour(now.hour()));
        if !policy.allowed_sessions.is_empty() && !session_matches(&policy.allowed_sessions, session)
        {
            return Some(format!("session {} not allowed", session.label()));
        }
        if session_matches(&policy.excluded_sessions, session) {
            return Some(format!("session {} excluded", session.label()));
        }
    }

    if policy.time_filtering_enabled && !policy.active_time_ranges.is_empty() {
        let tz: chrono_tz::Tz = policy.user_timezone.parse().unwrap_or(chrono_tz::Tz::UTC);
        let local = now.with_timezone(&tz);
        let minutes = local.hour() * 60 + local.minute();
        if !policy.active_time_ranges.iter().any(|r| r.contains(minutes)) {
            return Some("outside active time ranges".into());
        }
    }

    None
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchSummary {
    pub users: usize,
    pub executed: usize,
    pub ignored: usize,
    pub errors: usize,
}

enum UserOutcome {
    Executed,
    Ignored,
    Error,
}

/// Fan a signal out to all users. Never fails as a whole; per-user problems
/// land on the user's alert row.
pub async fn dispatch_signal(state: Arc<AppState>, signal: NormalizedSignal) -> DispatchSummary {
    let started = Instant::now();
    let users = match state.db.list_user_ids() {
        Ok(users) => users,
        Err(e) => {
            error!("dispatch: listing users failed: {e:#}");
            return DispatchSummary::default();
        }
    };

    let mut summary = DispatchSummary {
        users: users.len(),
        ..Default::default()
    };

    let semaphore = Arc::new(Semaphore::new(state.config.dispatch_concurrency.max(1)));
    let mut set = JoinSet::new();
    for user_id in users {
        let state = state.clone();
        let signal = signal.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            process_user(&state, &user_id, &signal).await
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(UserOutcome::Executed) => summary.executed += 1,
            Ok(UserOutcome::Ignored) => summary.ignored += 1,
            Ok(UserOutcome::Error) | Err(_) => summary.errors += 1,
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as i64;
    if let Err(e) = state.db.insert_performance_metric(
        &signal.symbol,
        summary.users,
        summary.executed,
        summary.ignored,
        summary.errors,
        elapsed_ms,
    ) {
        warn!("dispatch: metric write failed: {e:#}");
    }

    info!(
        symbol = %signal.symbol,
        users = summary.users,
        executed = summary.executed,
        ignored = summary.ignored,
        errors = summary.errors,
        elapsed_ms,
        "signal dispatched"
    );
    summary
}

async fn process_user(state: &AppState, user_id: &str, signal: &NormalizedSignal) -> UserOutcome {
    let received_at = Utc::now();
    let alert_id = Uuid::new_v4().to_string();
    let alert = AlertRow {
        id: alert_id.clone(),
        user_id: user_id.to_string(),
        symbol: signal.symbol.clone(),
        side: signal.side,
        entry_price: signal.entry_price,
        sl: signal.sl,
        tp1: signal.tp1,
        tp2: signal.tp2,
        tp3: signal.tp3,
        main_tp: signal.main_tp,
        atr: signal.atr,
        leverage: signal.leverage,
        strength: signal.strength,
        tier: signal.tier.clone(),
        mode: signal.mode.clone(),
        raw_payload: signal.raw.to_string(),
        tv_ts: signal.tv_ts,
        webhook_received_at: received_at,
        exchange_executed_at: None,
        webhook_latency_ms: signal
            .tv_ts
            .map(|tv| (received_at.timestamp_millis() - tv).max(0)),
        execution_latency_ms: None,
        total_latency_ms: None,
        status: AlertStatus::Pending,
        error_message: None,
        is_test: signal.is_test,
    };
    if let Err(e) = state.db.insert_alert(&alert) {
        error!(user_id, "alert insert failed: {e:#}");
        return UserOutcome::Error;
    }

    let ignore = |reason: String| {
        let _ = state.db.mark_alert_ignored(&alert_id, &reason);
        UserOutcome::Ignored
    };
    let fail = |message: String| {
        let _ = state.db.mark_alert_error(&alert_id, &message);
        state.bot_log.error("dispatcher", Some(user_id), message.clone());
        UserOutcome::Error
    };

    let policy = match policy::resolve_for_user(&state.db, user_id, &signal.symbol) {
        Ok(policy) => policy,
        Err(e) => return fail(format!("policy resolution failed: {e:#}")),
    };

    if !policy.bot_active {
        return ignore("bot disabled".into());
    }

    if let Some(reason) = filter_reason(&policy, signal, received_at) {
        return ignore(reason);
    }

    match state.db.is_symbol_banned(user_id, &signal.symbol) {
        Ok(true) => return ignore(format!("symbol {} is banned", signal.symbol)),
        Ok(false) => {}
        Err(e) => return fail(format!("ban lookup failed: {e:#}")),
    }

    match state.db.count_open_positions(user_id) {
        Ok(n) if n >= policy.max_open_positions => {
            return ignore(format!("max open positions reached ({n})"));
        }
        Ok(_) => {}
        Err(e) => return fail(format!("open position count failed: {e:#}")),
    }

    // Daily loss limit in USDT; the percent variant is checked against
    // account equity once we have an exchange client below.
    if policy.daily_loss_limit > 0.0 && policy.loss_limit_type != "percent" {
        let day_start = received_at
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(received_at);
        match state.db.realized_pnl_since(user_id, day_start) {
            Ok(pnl) if -pnl >= policy.daily_loss_limit => {
                return ignore(format!("daily loss limit reached ({:.2} USDT)", -pnl));
            }
            Ok(_) => {}
            Err(e) => return fail(format!("daily pnl lookup failed: {e:#}")),
        }
    }

    let creds = match state.vault.get(user_id) {
        Ok(CredentialStatus::Ready(creds)) => creds,
        Ok(CredentialStatus::NotConfigured) => return ignore("api keys not configured".into()),
        Ok(CredentialStatus::Inactive) => return ignore("api keys inactive".into()),
        Err(e) => return fail(format!("credential decryption failed: {e:#}")),
    };
    let exchange = state.connector.connect(&creds);

    if policy.loss_limit_type == "percent" && policy.daily_loss_percent > 0.0 {
        if let Ok(account) = exchange.get_account().await {
            let day_start = received_at
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .unwrap_or(received_at);
            let pnl = state.db.realized_pnl_since(user_id, day_start).unwrap_or(0.0);
            let budget = account.equity * policy.daily_loss_percent / 100.0;
            if budget > 0.0 && -pnl >= budget {
                return ignore(format!(
                    "daily loss limit reached ({:.2}%)",
                    policy.daily_loss_percent
                ));
            }
        }
    }

    // A same-side open position decides the duplicate policy: replace closes
    // and re-enters; otherwise only a sufficiently profitable position may
    // be rolled, per require_profit_for_same_direction.
    match state
        .db
        .open_position_by_key(user_id, &signal.symbol, signal.side)
    {
        Ok(Some(mut existing)) => {
            let replace = policy.duplicate_alert_handling == "replace";
            let profitable_roll = policy.require_profit_for_same_direction && {
                let upnl_pct = (signal.entry_price - existing.entry_price)
                    * signal.side.sign()
                    / existing.entry_price
                    * 100.0;
                upnl_pct >= policy.pnl_threshold_percent
            };
            if replace || profitable_roll {
                match finalize::close_and_finalize(state, &exchange, &mut existing, "replaced").await
                {
                    Ok(()) => {}
                    Err(e) => return fail(format!("closing prior position failed: {e:#}")),
                }
            } else {
                return ignore("duplicate signal: position already open".into());
            }
        }
        Ok(None) => {}
        Err(e) => return fail(format!("duplicate lookup failed: {e:#}")),
    }

    match opener::open_position(state, &exchange, user_id, signal, &policy, Some(&alert_id)).await {
        Ok(opened) => {
            if let Err(e) = state.db.mark_alert_executed(&alert_id, opened.executed_at) {
                warn!(user_id, "alert executed update failed: {e:#}");
            }
            state.bot_log.info(
                "dispatcher",
                Some(user_id),
                format!("opened {} {} @ {}", signal.symbol, signal.side.as_str(), signal.entry_price),
            );
            UserOutcome::Executed
        }
        Err(e) => fail(format!("open failed: {e:#}")),
    }
}
