//! Alertbot backend library
//!
//! Signal-to-position execution and reconciliation engine: a webhook signal
//! fans out to per-user leveraged futures positions with protective
//! brackets, and a leased monitor keeps the database consistent with the
//! exchange until every position is closed.

pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod emergency;
pub mod exchange;
pub mod models;
pub mod monitor;
pub mod opener;
pub mod policy;
pub mod pricing;

#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use credentials::CredentialVault;
use db::{BotLogger, Db};
use exchange::ExchangeConnector;

/// Shared application state handed to every component.
pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub vault: CredentialVault,
    pub connector: Arc<dyn ExchangeConnector>,
    pub bot_log: BotLogger,
}
