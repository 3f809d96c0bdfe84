//! Configuration for the execution layer

use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Execution mode decides where the market data and the orders go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Synthetic feed, paper fills
    Simulation,
    /// Live feed, paper fills
    Paper,
    /// Live feed, orders sent to the broker
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Simulation
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "Simulation"),
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Configuration for bracket orders, the PnL sweep and square-off
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Execution mode (simulation, paper, or live)
    pub mode: ExecutionMode,

    /// Exchange code sent with every order (e.g. "NSE")
    pub exchange: String,

    /// Segment code ("E" for equity)
    pub segment: String,

    /// Product code ("I" for intraday)
    pub product: String,

    /// Order validity ("DAY")
    pub validity: String,

    /// Order source tag
    pub source: String,

    /// Shares per entry
    pub quantity: i64,

    /// Target distance from the reference price, as a fraction (0.005 = 0.5%)
    pub target_pct: f64,

    /// Stop distance from the reference price, as a fraction
    pub stop_pct: f64,

    /// Exchange price tick
    pub tick_size: f64,

    /// Order-book poll cadence while a bracket is live
    #[serde(with = "nonzero_millis")]
    pub poll_interval: Duration,

    /// Upper bound on any single gateway call
    #[serde(with = "nonzero_millis")]
    pub gateway_timeout: Duration,

    /// Entry orders still pending after this are cancelled
    #[serde(with = "nonzero_millis")]
    pub entry_fill_timeout: Duration,

    /// Extra attempts for a failed exit leg
    pub leg_retry_attempts: u32,

    /// PnL sweep cadence
    #[serde(with = "nonzero_millis")]
    pub sweep_interval: Duration,

    /// A symbol swept out is left alone for this long
    #[serde(with = "millis")]
    pub sweep_cooldown: Duration,

    /// Position / order-book refresh cadence
    #[serde(with = "nonzero_millis")]
    pub snapshot_interval: Duration,

    /// Square-off check cadence
    #[serde(with = "nonzero_millis")]
    pub square_off_interval: Duration,

    /// When false, entries are always allowed and square-off never runs
    pub enforce_trading_window: bool,

    /// Timezone for the trading and square-off windows
    pub timezone: Tz,

    /// New entries allowed from this time
    pub entry_start: NaiveTime,

    /// New entries allowed until this time (exclusive)
    pub entry_end: NaiveTime,

    /// Square-off window start
    pub square_off_start: NaiveTime,

    /// Square-off window end (exclusive)
    pub square_off_end: NaiveTime,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulation,
            exchange: "NSE".to_string(),
            segment: "E".to_string(),
            product: "I".to_string(),
            validity: "DAY".to_string(),
            source: "N".to_string(),
            quantity: 1,
            target_pct: 0.005,
            stop_pct: 0.005,
            tick_size: 0.05,
            poll_interval: Duration::from_secs(1),
            gateway_timeout: Duration::from_secs(10),
            entry_fill_timeout: Duration::from_secs(30),
            leg_retry_attempts: 3,
            sweep_interval: Duration::from_secs(5),
            sweep_cooldown: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(2),
            square_off_interval: Duration::from_secs(30),
            enforce_trading_window: true,
            timezone: chrono_tz::Asia::Kolkata,
            entry_start: hm(9, 20),
            entry_end: hm(15, 10),
            square_off_start: hm(15, 10),
            square_off_end: hm(15, 25),
        }
    }
}

fn at_least_1ms(value: f64) -> Duration {
    Duration::from_millis(value.max(1.0) as u64)
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl ExecutionConfig {
    /// Fast timers for exercising brackets against an in-memory gateway
    pub fn simulation() -> Self {
        Self {
            enforce_trading_window: false,
            poll_interval: Duration::from_millis(250),
            entry_fill_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Apply one numeric override; returns false for unknown keys
    pub fn set(&mut self, key: &str, value: f64) -> bool {
        match key {
            "target_pct" => self.target_pct = value.abs(),
            "stop_pct" => self.stop_pct = value.abs(),
            "tick_size" if value > 0.0 => self.tick_size = value,
            "quantity" if value >= 1.0 => self.quantity = value as i64,
            "leg_retry_attempts" => self.leg_retry_attempts = value.max(0.0) as u32,
            "poll_interval_ms" => self.poll_interval = at_least_1ms(value),
            "gateway_timeout_ms" => self.gateway_timeout = at_least_1ms(value),
            "entry_fill_timeout_ms" => self.entry_fill_timeout = at_least_1ms(value),
            "sweep_interval_ms" => self.sweep_interval = at_least_1ms(value),
            "snapshot_interval_ms" => self.snapshot_interval = at_least_1ms(value),
            "square_off_interval_ms" => self.square_off_interval = at_least_1ms(value),
            "sweep_cooldown_ms" => self.sweep_cooldown = Duration::from_millis(value.max(0.0) as u64),
            _ => return false,
        }
        true
    }

    fn local_time<T: TimeZone>(&self, now: DateTime<T>) -> NaiveTime {
        now.with_timezone(&self.timezone).time()
    }

    /// Check if new entries are allowed at `now`
    pub fn is_entry_allowed<T: TimeZone>(&self, now: DateTime<T>) -> bool {
        if !self.enforce_trading_window {
            return true;
        }
        let t = self.local_time(now);
        t >= self.entry_start && t < self.entry_end
    }

    /// Check if `now` falls in the end-of-session square-off window
    pub fn is_square_off_time<T: TimeZone>(&self, now: DateTime<T>) -> bool {
        if !self.enforce_trading_window {
            return false;
        }
        let t = self.local_time(now);
        t >= self.square_off_start && t < self.square_off_end
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Timer periods: zero would panic `tokio::time::interval` or spin the poll loops
mod nonzero_millis {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        super::millis::serialize(d, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match u64::deserialize(d)? {
            0 => Err(D::Error::custom("interval must be at least 1 ms")),
            ms => Ok(Duration::from_millis(ms)),
        }
    }
}
