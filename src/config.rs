//! # config — typed configuration from environment variables
//!
//! `.env` is loaded by `main` through `dotenvy`; everything here reads
//! `std::env` with a default and validates once at startup. A bad value is a
//! [`EngineError::Configuration`] and stops the process before any order is
//! sent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::ladder::ExitLadderConfig;
use crate::engine::regime::RegimeClassifier;
use crate::error::EngineError;
use crate::risk::RiskConfig;
use crate::strategy::ma_cross::MaCrossConfig;

/// Reads `key` and parses it, falling back to `default` when unset.
/// An unparsable value is logged and replaced by the default.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "⚠️ unparsable env value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ─── InstrumentSpec ───────────────────────────────────────────────────────────

/// Contract properties of the traded symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentSpec {
    /// Smallest price increment.
    pub tick_size:   f64,
    /// Total lots per group, split across the rungs.
    pub lot_size:    f64,
    /// Broker volume granularity.
    pub volume_step: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self { tick_size: 0.01, lot_size: 0.10, volume_step: 0.01 }
    }
}

impl InstrumentSpec {
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = |v: f64| v > 0.0 && v.is_finite();
        if !(positive(self.tick_size) && positive(self.lot_size) && positive(self.volume_step)) {
            return Err(EngineError::Configuration(
                "TICK_SIZE, LOT_SIZE and VOLUME_STEP must be positive".into(),
            ));
        }
        if self.lot_size < self.volume_step * 3.0 - 1e-12 {
            return Err(EngineError::Configuration(format!(
                "LOT_SIZE {} cannot be split into three rungs of step {}",
                self.lot_size, self.volume_step
            )));
        }
        Ok(())
    }

    /// Rounds `price` to the nearest tick.
    #[inline]
    pub fn round_price(&self, price: f64) -> f64 {
        (price / self.tick_size).round() * self.tick_size
    }

    /// Rounds `volume` down to the volume step.
    #[inline]
    pub fn floor_volume(&self, volume: f64) -> f64 {
        ((volume / self.volume_step) + 1e-6).floor() * self.volume_step
    }
}

// ─── BrokerConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MT5 bridge base URL, or `mock` for the in-process paper broker.
    pub base_url:       String,
    /// Upper bound on every broker call.
    pub timeout:        Duration,
    pub max_attempts:   u32,
    pub retry_delay:    Duration,
    pub base_magic:     u64,
}

impl BrokerConfig {
    pub fn is_mock(&self) -> bool {
        self.base_url == "mock"
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url:     "mock".into(),
            timeout:      Duration::from_secs(5),
            max_attempts: 3,
            retry_delay:  Duration::from_millis(500),
            base_magic:   420_000,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_id:        u32,
    pub symbol:        String,
    pub bar_period:    chrono::Duration,
    pub instrument:    InstrumentSpec,
    pub poll_interval: Duration,
    pub broker:        BrokerConfig,
    pub state_dir:     PathBuf,
    /// `None` disables the HTTP monitor.
    pub monitor_addr:  Option<SocketAddr>,
    pub api_key:       Option<String>,
    pub ladder:        ExitLadderConfig,
    pub regime:        RegimeClassifier,
    pub risk:          RiskConfig,
    pub strategy:      MaCrossConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let instrument = InstrumentSpec {
            tick_size:   env_or("TICK_SIZE", 0.01),
            lot_size:    env_or("LOT_SIZE", 0.10),
            volume_step: env_or("VOLUME_STEP", 0.01),
        };

        let d = BrokerConfig::default();
        let broker = BrokerConfig {
            base_url:     env_string("MT5_BASE_URL", &d.base_url),
            timeout:      Duration::from_secs(env_or("BROKER_TIMEOUT_SECS", 5)),
            max_attempts: env_or("ORDER_MAX_ATTEMPTS", d.max_attempts),
            retry_delay:  Duration::from_millis(env_or("ORDER_RETRY_DELAY_MS", 500)),
            base_magic:   env_or("BASE_MAGIC", d.base_magic),
        };

        let ladder = match std::env::var("LADDER_CONFIG") {
            Ok(path) if !path.is_empty() => ExitLadderConfig::load(std::path::Path::new(&path))?,
            _ => ExitLadderConfig::default(),
        };

        let monitor_addr = match std::env::var("MONITOR_ADDR") {
            Ok(raw) if raw.is_empty() || raw == "off" => None,
            Ok(raw) => Some(raw.parse().map_err(|e| {
                EngineError::Configuration(format!("MONITOR_ADDR '{raw}': {e}"))
            })?),
            Err(_) => Some(SocketAddr::from(([0, 0, 0, 0], 3000))),
        };

        let config = Self {
            bot_id:        env_or("BOT_ID", 1),
            symbol:        env_string("SYMBOL", "XAUUSD"),
            bar_period:    chrono::Duration::minutes(env_or("BAR_PERIOD_MINUTES", 60)),
            instrument,
            poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 10)),
            broker,
            state_dir:     PathBuf::from(env_string("STATE_DIR", "./state")),
            monitor_addr,
            api_key:       std::env::var("API_KEY").ok().filter(|k| !k.is_empty()),
            ladder,
            regime:        RegimeClassifier::from_env()?,
            risk:          RiskConfig::from_env(),
            strategy:      MaCrossConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.instrument.validate()?;
        self.ladder.validate()?;
        self.ladder.validate_sizing(&self.instrument)?;
        self.regime.validate()?;
        self.strategy.validate()?;

        if self.bot_id == 0 || self.bot_id > 999 {
            return Err(EngineError::Configuration(format!(
                "BOT_ID {} must be in 1..=999",
                self.bot_id
            )));
        }
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Configuration("SYMBOL must not be empty".into()));
        }
        if self.bar_period <= chrono::Duration::zero() {
            return Err(EngineError::Configuration("BAR_PERIOD_MINUTES must be positive".into()));
        }
        if self.poll_interval.is_zero() || self.broker.timeout.is_zero() {
            return Err(EngineError::Configuration(
                "POLL_INTERVAL_SECS and BROKER_TIMEOUT_SECS must be positive".into(),
            ));
        }
        if self.broker.max_attempts == 0 {
            return Err(EngineError::Configuration("ORDER_MAX_ATTEMPTS must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bot_id:        1,
            symbol:        "XAUUSD".into(),
            bar_period:    chrono::Duration::minutes(60),
            instrument:    InstrumentSpec::default(),
            poll_interval: Duration::from_secs(10),
            broker:        BrokerConfig::default(),
            state_dir:     PathBuf::from("./state"),
            monitor_addr:  None,
            api_key:       None,
            ladder:        ExitLadderConfig::default(),
            regime:        RegimeClassifier::default(),
            risk:          RiskConfig::default(),
            strategy:      MaCrossConfig::default(),
        }
    }
}
