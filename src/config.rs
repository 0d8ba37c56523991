//! Runtime configuration
//!
//! Everything comes from environment variables (twelve-factor style).
//! JSON-literal variables (`VENUE_URLS`, `FEE_TABLE`) are parsed once at
//! startup; a malformed or missing required variable is a startup failure
//! with exit code 1.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::env;
use thiserror::Error;

use crate::core_types::Network;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

/// Per-venue base URLs, keyed by network then venue name.
///
/// Wire shape of `VENUE_URLS`:
/// `{"ton": {"ston.fi": "https://api.ston.fi/v1", "dedust": "https://api.dedust.io/v2"}}`
pub type VenueUrlMap = FxHashMap<String, FxHashMap<String, String>>;

/// Platform fee table, a JSON literal in `FEE_TABLE`.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeTable {
    /// Fee taken from swap output, basis points.
    #[serde(default)]
    pub swap_fee_bps: u32,
    /// Fee taken from the crypto leg of a completed P2P deal, basis points.
    #[serde(default)]
    pub p2p_fee_bps: u32,
    /// Flat withdrawal fee per asset symbol.
    #[serde(default)]
    pub withdrawal_fees: FxHashMap<String, Decimal>,
}

impl Default for FeeTable {
    fn default() -> Self {
        Self {
            swap_fee_bps: 0,
            p2p_fee_bps: 0,
            withdrawal_fees: FxHashMap::default(),
        }
    }
}

/// Logging configuration subset consumed by [`crate::logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly" | "daily" | anything else = never rotate
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Per-network venue base URLs.
    pub venue_urls: VenueUrlMap,
    /// Platform fee table.
    pub fees: FeeTable,
    /// Quote symbol the trigger watcher prices against, per network.
    /// Networks not listed fall back to "USDT".
    pub price_reference: FxHashMap<String, String>,
    /// Postgres DSN. Absent = run on the in-memory store.
    pub database_url: Option<String>,
    /// Bind address for the Prometheus scrape endpoint.
    pub metrics_addr: String,
    /// Local directory for database snapshots.
    pub backup_dir: String,
    /// Off-site backup destination token (opaque, handed to the uploader).
    pub backup_token: Option<String>,
    /// Bot credentials and data-at-rest key, opaque to the core.
    pub bot_token: Option<String>,
    pub encryption_key: Option<String>,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let venue_urls: VenueUrlMap = parse_json_var("VENUE_URLS", required("VENUE_URLS")?)?;
        if venue_urls.is_empty() {
            return Err(ConfigError::InvalidVar {
                var: "VENUE_URLS",
                reason: "at least one network with one venue is required".into(),
            });
        }

        let fees = match env::var("FEE_TABLE") {
            Ok(raw) => parse_json_var("FEE_TABLE", raw)?,
            Err(_) => FeeTable::default(),
        };

        let price_reference = match env::var("PRICE_REFERENCE") {
            Ok(raw) => parse_json_var("PRICE_REFERENCE", raw)?,
            Err(_) => FxHashMap::default(),
        };

        Ok(Self {
            venue_urls,
            fees,
            price_reference,
            database_url: env::var("DATABASE_URL").ok(),
            metrics_addr: env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9100".into()),
            backup_dir: env::var("BACKUP_DIR").unwrap_or_else(|_| "./backups".into()),
            backup_token: env::var("BACKUP_TOKEN").ok(),
            bot_token: env::var("BOT_TOKEN").ok(),
            encryption_key: env::var("ENCRYPTION_KEY").ok(),
            log: LogConfig {
                log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "./logs".into()),
                log_file: env::var("LOG_FILE").unwrap_or_else(|_| "crossflow.log".into()),
                rotation: env::var("LOG_ROTATION").unwrap_or_else(|_| "daily".into()),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
                use_json: env::var("LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false),
            },
        })
    }

    /// Venues configured for `network`, as (venue_name, base_url) pairs.
    pub fn venues_for(&self, network: &Network) -> Vec<(String, String)> {
        self.venue_urls
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(network.as_str()))
            .map(|(_, venues)| {
                venues
                    .iter()
                    .map(|(name, url)| (name.clone(), url.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Quote symbol the watcher prices `network` against.
    pub fn price_reference_for(&self, network: &Network) -> String {
        self.price_reference
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(network.as_str()))
            .map(|(_, sym)| sym.clone())
            .unwrap_or_else(|| "USDT".into())
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

fn parse_json_var<T: serde::de::DeserializeOwned>(
    var: &'static str,
    raw: String,
) -> Result<T, ConfigError> {
    serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidVar {
        var,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        let mut venues = FxHashMap::default();
        let mut ton = FxHashMap::default();
        ton.insert("ston.fi".to_string(), "https://api.ston.fi/v1".to_string());
        ton.insert("dedust".to_string(), "https://api.dedust.io/v2".to_string());
        venues.insert("ton".to_string(), ton);
        AppConfig {
            venue_urls: venues,
            fees: FeeTable::default(),
            price_reference: FxHashMap::default(),
            database_url: None,
            metrics_addr: "127.0.0.1:0".into(),
            backup_dir: "/tmp".into(),
            backup_token: None,
            bot_token: None,
            encryption_key: None,
            log: LogConfig {
                log_dir: "/tmp".into(),
                log_file: "test.log".into(),
                rotation: "never".into(),
                log_level: "info".into(),
                use_json: false,
            },
        }
    }

    #[test]
    fn test_venues_for_is_case_insensitive() {
        let cfg = sample();
        let mut venues = cfg.venues_for(&Network::new("TON"));
        venues.sort();
        assert_eq!(venues.len(), 2);
        assert_eq!(venues[0].0, "dedust");
    }

    #[test]
    fn test_price_reference_defaults_to_usdt() {
        let cfg = sample();
        assert_eq!(cfg.price_reference_for(&Network::new("ton")), "USDT");
    }

    #[test]
    fn test_fee_table_parses_from_json() {
        let fees: FeeTable = serde_json::from_str(
            r#"{"swap_fee_bps": 30, "p2p_fee_bps": 50, "withdrawal_fees": {"TON": "0.05"}}"#,
        )
        .unwrap();
        assert_eq!(fees.swap_fee_bps, 30);
        assert_eq!(fees.p2p_fee_bps, 50);
        assert_eq!(
            fees.withdrawal_fees.get("TON").copied(),
            Some("0.05".parse().unwrap())
        );
    }
}
