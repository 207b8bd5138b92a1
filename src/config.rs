//! Application configuration
//!
//! Everything comes from the environment (with `.env` support); the CLI can
//! override the handful of flags operators change most often.

use clap::Parser;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub exchange_base_url: String,
    pub monitor_interval_secs: u64,
    pub monitor_lease_ttl_secs: i64,
    pub encryption_key_hex: String,
    pub dispatch_concurrency: usize,
    pub dry_run: bool,
}

#[derive(Debug, Parser)]
#[command(name = "alertbot", about = "Signal-driven futures execution engine")]
pub struct Args {
    /// Listen port (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    pub database: Option<String>,
    /// Log intended orders instead of placing them
    #[arg(long)]
    pub dry_run: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./alertbot.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let exchange_base_url = std::env::var("EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.bitget.com".to_string());

        let monitor_interval_secs = std::env::var("MONITOR_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let monitor_lease_ttl_secs = std::env::var("MONITOR_LEASE_TTL_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .unwrap_or(120);

        let encryption_key_hex = std::env::var("ENCRYPTION_KEY").unwrap_or_default();

        let dispatch_concurrency = std::env::var("DISPATCH_CONCURRENCY")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let dry_run = std::env::var("DRY_RUN")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on"))
            .unwrap_or(false);

        Ok(Self {
            database_path,
            port,
            exchange_base_url,
            monitor_interval_secs,
            monitor_lease_ttl_secs,
            encryption_key_hex,
            dispatch_concurrency,
            dry_run,
        })
    }

    pub fn apply_args(mut self, args: &Args) -> Self {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(ref db) = args.database {
            self.database_path = db.clone();
        }
        if args.dry_run {
            self.dry_run = true;
        }
        self
    }
}
