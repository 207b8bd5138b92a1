//! Alertbot: signal-driven futures execution engine.
//!
//! Boots the HTTP ingress, the bot-log consumer and the leased monitor
//! schedule, then serves until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alertbot_backend::config::{Args, Config};
use alertbot_backend::credentials::CredentialVault;
use alertbot_backend::db::{BotLogger, Db};
use alertbot_backend::exchange::bitget::BitgetConnector;
use alertbot_backend::{api, monitor, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,alertbot_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?.apply_args(&args);
    info!(
        port = config.port,
        database = %config.database_path,
        monitor_interval = config.monitor_interval_secs,
        dry_run = config.dry_run,
        "starting alertbot"
    );

    let db = Db::open(&config.database_path)?;
    let vault =
        CredentialVault::new(db.clone(), &config.encryption_key_hex).context("credential vault")?;
    let connector = Arc::new(BitgetConnector::new(&config.exchange_base_url));
    let bot_log = BotLogger::spawn(db.clone());

    let state = Arc::new(AppState {
        config,
        db,
        vault,
        connector,
        bot_log,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The reconciler fires on a fixed schedule; the DB lease keeps
    // overlapping deployments from double-driving it.
    let monitor_state = state.clone();
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            monitor_state.config.monitor_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if *monitor_shutdown.borrow() {
                break;
            }
            let summary = monitor::run_cycle(&monitor_state, &monitor_shutdown).await;
            if summary.skipped {
                debug!(reason = ?summary.reason, "monitor cycle skipped");
            }
        }
    });

    let app = api::router(state.clone());
    let listener = TcpListener::bind(("0.0.0.0", state.config.port))
        .await
        .with_context(|| format!("bind port {}", state.config.port))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = monitor_task.await;
    info!("alertbot stopped");
    Ok(())
}
