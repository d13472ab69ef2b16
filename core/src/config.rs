//! Protocol configuration
//!
//! Env-driven with sane defaults, loaded once at startup. Durations are in
//! the unit named by the variable.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Tunables for the trade and dispute protocols.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Default full trade period when the offer does not carry one.
    pub max_trade_period_secs: u64,
    /// Delay before mirroring a freshly opened dispute to the peer, giving a
    /// concurrently arriving open-request from that peer precedence.
    pub dispute_mirror_delay_ms: u64,
    /// Price-info advisory retries while the price feed is empty.
    pub price_info_max_retries: u32,
    /// Backoff between price-info retries.
    pub price_info_retry_delay_secs: u64,
    /// Upper bound on parallel multisig wallet initializations at startup.
    pub init_pool_cap: usize,
    /// Bounded wait for startup trade initialization to finish.
    pub init_wait_secs: u64,
    /// Interval of the trade-period clock watcher.
    pub period_tick_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_trade_period_secs: 24 * 60 * 60,
            dispute_mirror_delay_ms: 100,
            price_info_max_retries: 3,
            price_info_retry_delay_secs: 10,
            init_pool_cap: 10,
            init_wait_secs: 60,
            period_tick_secs: 60,
        }
    }
}

impl ProtocolConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Reads `.env` if present (ignored when missing) and then the
    /// `TRADE_*` variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let config = Self {
            max_trade_period_secs: env_u64("TRADE_MAX_PERIOD_SECS", defaults.max_trade_period_secs)?,
            dispute_mirror_delay_ms: env_u64(
                "TRADE_DISPUTE_MIRROR_DELAY_MS",
                defaults.dispute_mirror_delay_ms,
            )?,
            price_info_max_retries: env_u64(
                "TRADE_PRICE_INFO_MAX_RETRIES",
                defaults.price_info_max_retries as u64,
            )? as u32,
            price_info_retry_delay_secs: env_u64(
                "TRADE_PRICE_INFO_RETRY_DELAY_SECS",
                defaults.price_info_retry_delay_secs,
            )?,
            init_pool_cap: env_u64("TRADE_INIT_POOL_CAP", defaults.init_pool_cap as u64)? as usize,
            init_wait_secs: env_u64("TRADE_INIT_WAIT_SECS", defaults.init_wait_secs)?,
            period_tick_secs: env_u64("TRADE_PERIOD_TICK_SECS", defaults.period_tick_secs)?,
        };

        info!(
            max_trade_period_secs = config.max_trade_period_secs,
            dispute_mirror_delay_ms = config.dispute_mirror_delay_ms,
            "protocol config loaded"
        );
        Ok(config)
    }

    pub fn dispute_mirror_delay(&self) -> Duration {
        Duration::from_millis(self.dispute_mirror_delay_ms)
    }

    pub fn price_info_retry_delay(&self) -> Duration {
        Duration::from_secs(self.price_info_retry_delay_secs)
    }

    pub fn init_wait(&self) -> Duration {
        Duration::from_secs(self.init_wait_secs)
    }

    pub fn period_tick(&self) -> Duration {
        Duration::from_secs(self.period_tick_secs)
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{} must be an integer, got '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
