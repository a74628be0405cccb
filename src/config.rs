//! Application configuration loaded from environment variables.
//!
//! Everything has a sensible default, so an unconfigured process tracks
//! `BTCUSD` on all exchanges and serves subscribers on localhost:
//! - `TWAPD_SYMBOLS` — comma-separated canonical symbols (default `BTCUSD`)
//! - `TWAPD_EXCHANGES` — comma-separated exchange names (default all)
//! - `TWAPD_LISTEN_ADDR` — subscriber WebSocket bind address
//! - `TWAPD_STALENESS_SECS` — silence window before an exchange is excluded
//! - `TWAPD_TICK_INTERVAL_MS` — merged-view broadcast interval
//! - `TWAPD_SLICE_INTERVAL_SECS` — TWAP slice interval
//! - `TWAPD_CHANNEL_CAPACITY` — bounded update channel size

use std::time::Duration;

use crate::exchange::ExchangeId;

/// Default subscriber bind address.
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_SYMBOLS: &str = "BTCUSD";
const DEFAULT_STALENESS_SECS: u64 = 10;
const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
const DEFAULT_SLICE_INTERVAL_SECS: u64 = 1;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Top-level application configuration.
#[derive(Debug)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub exchanges: Vec<ExchangeId>,
    pub listen_addr: String,
    pub staleness_window: Duration,
    pub tick_interval: Duration,
    pub slice_interval: Duration,
    pub channel_capacity: usize,
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`TwapdError::Config`](crate::TwapdError::Config) if a variable
/// is present but unparseable, or names an unsupported exchange.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let symbols = non_empty_var("TWAPD_SYMBOLS")
        .unwrap_or_else(|| DEFAULT_SYMBOLS.to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if symbols.is_empty() {
        return Err(crate::TwapdError::Config(
            "TWAPD_SYMBOLS must name at least one symbol".to_string(),
        ));
    }

    let exchanges = match non_empty_var("TWAPD_EXCHANGES") {
        Some(raw) => {
            let mut exchanges = Vec::new();
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                exchanges.push(name.parse::<ExchangeId>().map_err(|_| {
                    crate::TwapdError::Config(format!("unsupported exchange: {name}"))
                })?);
            }
            exchanges.sort_unstable();
            exchanges.dedup();
            exchanges
        }
        None => ExchangeId::ALL.to_vec(),
    };
    if exchanges.is_empty() {
        return Err(crate::TwapdError::Config(
            "TWAPD_EXCHANGES must name at least one exchange".to_string(),
        ));
    }

    Ok(AppConfig {
        symbols,
        exchanges,
        listen_addr: non_empty_var("TWAPD_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        staleness_window: Duration::from_secs(parsed_var(
            "TWAPD_STALENESS_SECS",
            DEFAULT_STALENESS_SECS,
        )?),
        tick_interval: Duration::from_millis(parsed_var(
            "TWAPD_TICK_INTERVAL_MS",
            DEFAULT_TICK_INTERVAL_MS,
        )?),
        slice_interval: Duration::from_secs(parsed_var(
            "TWAPD_SLICE_INTERVAL_SECS",
            DEFAULT_SLICE_INTERVAL_SECS,
        )?),
        channel_capacity: parsed_var("TWAPD_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
    })
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses a numeric environment variable, falling back to `default` when unset.
fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> crate::Result<T> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| crate::TwapdError::Config(format!("{name} is not a valid number: {raw}"))),
        None => Ok(default),
    }
}
