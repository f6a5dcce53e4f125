//! Connection parameters and transport options.
//!
//! [`QueueConfig`] is what callers construct (or deserialize). At
//! `Queue::init` its `options` map is applied, option by option, onto a
//! [`Config`], which rejects names and values the transport does not
//! understand.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Default multiplier applied to consumer concurrency to get max-in-flight.
pub const DEFAULT_IN_FLIGHT_MULTIPLIER: usize = 10;

/// Connection parameters for a [`Queue`](crate::Queue).
///
/// ```
/// use nsqueue::QueueConfig;
///
/// let config = QueueConfig::new("127.0.0.1:4150")
///     .lookupd("127.0.0.1:4161")
///     .option("max_attempts", 5)
///     .in_flight_multiplier(20);
/// assert_eq!(config.options.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Direct broker address. Also used by the producer.
    pub nsqd: String,
    /// Discovery service address, used by consumers when `nsqd` is empty.
    pub lookupd: String,
    /// Transport options applied verbatim at init.
    pub options: Map<String, Value>,
    /// max-in-flight = concurrency * in_flight_multiplier.
    pub in_flight_multiplier: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nsqd: String::new(),
            lookupd: String::new(),
            options: Map::new(),
            in_flight_multiplier: DEFAULT_IN_FLIGHT_MULTIPLIER,
        }
    }
}

impl QueueConfig {
    pub fn new(nsqd: impl Into<String>) -> Self {
        Self {
            nsqd: nsqd.into(),
            ..Self::default()
        }
    }

    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn lookupd(mut self, addr: impl Into<String>) -> Self {
        self.lookupd = addr.into();
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn in_flight_multiplier(mut self, multiplier: usize) -> Self {
        self.in_flight_multiplier = multiplier;
        self
    }
}

/// Validated transport configuration shared by the producer and consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub lookupd_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub msg_timeout: Duration,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub max_backoff_duration: Duration,
    pub backoff_multiplier: Duration,
    /// 0 means unlimited.
    pub max_attempts: u16,
    pub max_in_flight: usize,
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            msg_timeout: Duration::ZERO,
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            max_backoff_duration: Duration::from_secs(2 * 60),
            backoff_multiplier: Duration::from_secs(1),
            max_attempts: 5,
            max_in_flight: 1,
            client_id: String::new(),
            hostname: String::new(),
            user_agent: concat!("nsqueue/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config by applying every option in `options`.
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for (name, value) in options {
            config.set(name, value)?;
        }
        Ok(config)
    }

    /// Set one option by name.
    pub fn set(&mut self, name: &str, value: &Value) -> Result<(), ConfigError> {
        match name {
            "dial_timeout" => self.dial_timeout = duration(name, value, Duration::from_secs(5 * 60))?,
            "read_timeout" => self.read_timeout = duration(name, value, Duration::from_secs(5 * 60))?,
            "write_timeout" => self.write_timeout = duration(name, value, Duration::from_secs(5 * 60))?,
            "lookupd_poll_interval" => {
                self.lookupd_poll_interval = duration(name, value, Duration::from_secs(5 * 60))?
            }
            "heartbeat_interval" => self.heartbeat_interval = duration(name, value, Duration::from_secs(5 * 60))?,
            "msg_timeout" => self.msg_timeout = duration(name, value, Duration::from_secs(15 * 60))?,
            "default_requeue_delay" => {
                self.default_requeue_delay = duration(name, value, Duration::from_secs(60 * 60))?
            }
            "max_requeue_delay" => self.max_requeue_delay = duration(name, value, Duration::from_secs(60 * 60))?,
            "max_backoff_duration" => {
                self.max_backoff_duration = duration(name, value, Duration::from_secs(60 * 60))?
            }
            "backoff_multiplier" => self.backoff_multiplier = duration(name, value, Duration::from_secs(60 * 60))?,
            "max_attempts" => {
                let n = integer(name, value)?;
                self.max_attempts =
                    u16::try_from(n).map_err(|_| ConfigError::invalid(name, "must be at most 65535"))?;
            }
            "max_in_flight" => {
                self.max_in_flight =
                    usize::try_from(integer(name, value)?).map_err(|_| ConfigError::invalid(name, "out of range"))?;
            }
            "client_id" => self.client_id = string(name, value)?,
            "hostname" => self.hostname = string(name, value)?,
            "user_agent" => self.user_agent = string(name, value)?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

fn integer(name: &str, value: &Value) -> Result<u64, ConfigError> {
    value
        .as_u64()
        .ok_or_else(|| ConfigError::invalid(name, format!("expected a non-negative integer, got {}", value)))
}

fn string(name: &str, value: &Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::invalid(name, format!("expected a string, got {}", value)))
}

/// Integers are milliseconds; strings carry a `ms`/`s`/`m`/`h` suffix.
fn duration(name: &str, value: &Value, max: Duration) -> Result<Duration, ConfigError> {
    let parsed = match value {
        Value::Number(_) => Duration::from_millis(integer(name, value)?),
        Value::String(s) => parse_duration(s).ok_or_else(|| {
            ConfigError::invalid(name, format!("cannot parse duration {:?}", s))
        })?,
        other => {
            return Err(ConfigError::invalid(
                name,
                format!("expected milliseconds or a duration string, got {}", other),
            ))
        }
    };
    if parsed > max {
        return Err(ConfigError::invalid(name, format!("must be at most {:?}", max)));
    }
    Ok(parsed)
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 60 * 60)),
        _ => None,
    }
}
