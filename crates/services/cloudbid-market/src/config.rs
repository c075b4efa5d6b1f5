use cloudbid_auction::AuctionTimings;
use cloudbid_ledger::SettlementPolicy;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

pub const CONFIG_PATH_VAR: &str = "CLOUDBID_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "cloudbid.toml";
pub const ENV_PREFIX: &str = "CLOUDBID";

/// Runtime settings: built-in defaults, then `cloudbid.toml`, then
/// `CLOUDBID_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub listen_addr: SocketAddr,
    /// Prometheus exporter address; no exporter when unset.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
    /// Postgres URL; empty runs on the in-memory store.
    #[serde(default)]
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub auction_window_secs: u64,
    pub compute_minute_secs: u64,
    pub settlement_policy: SettlementPolicy,
}

impl MarketConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_sources(&path, Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    fn from_sources(path: &str, env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("listen_addr", "0.0.0.0:8080")?
            .set_default("database_url", "")?
            .set_default("db_max_connections", 20_i64)?
            .set_default("jwt_secret", "change_this_to_a_secure_secret_key_in_production")?
            .set_default("token_ttl_secs", 3600_i64)?
            .set_default("auction_window_secs", 60_i64)?
            .set_default("compute_minute_secs", 60_i64)?
            .set_default("settlement_policy", "full_quote")?
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    pub fn timings(&self) -> AuctionTimings {
        AuctionTimings {
            window: Duration::from_secs(self.auction_window_secs),
            compute_minute: Duration::from_secs(self.compute_minute_secs),
        }
    }

    pub fn uses_database(&self) -> bool {
        !self.database_url.trim().is_empty()
    }
}
