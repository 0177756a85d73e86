//! Configuration management for subproc.
use serde::{Deserialize, Deserializer};
use std::{fs, path::Path, time::Duration};

use crate::error::SubprocError;

/// Ceiling used when no explicit backoff cap is configured.
const UNBOUNDED_DELAY: Duration = Duration::from_nanos(u64::MAX);

/// Restart backoff for crashed workers.
///
/// The delay after the `n`th consecutive failure (0-indexed) is
/// `first × factor^n`, clamped to `max` when one is set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    #[serde(deserialize_with = "deserialize_duration")]
    pub first: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Optional cap on a single delay.
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub max: Option<Duration>,
    /// Consecutive failures after which a worker gives up for good.
    pub max_restarts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            factor: 2.0,
            max: None,
            max_restarts: i32::MAX as u32,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay following failure number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.max.unwrap_or(UNBOUNDED_DELAY);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let nanos = self.first.as_nanos() as f64 * self.factor.powi(exponent);

        if !nanos.is_finite() || nanos < 0.0 || nanos >= ceiling.as_nanos() as f64 {
            ceiling
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Settings applied to every worker a manager creates.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Restart backoff for crashed workers.
    pub backoff: BackoffPolicy,
    /// Time to wait after an interrupt before force-killing a stopping child.
    ///
    /// `None` waits for the child indefinitely.
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub kill_timeout: Option<Duration>,
}

impl ManagerConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, SubprocError> {
        let config: ManagerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SubprocError> {
        if !self.backoff.factor.is_finite() || self.backoff.factor < 1.0 {
            return Err(SubprocError::InvalidConfig(format!(
                "backoff factor must be a finite number >= 1, got {}",
                self.backoff.factor
            )));
        }
        Ok(())
    }
}

/// Loads a manager configuration from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ManagerConfig, SubprocError> {
    let content = fs::read_to_string(path)?;
    ManagerConfig::from_yaml_str(&content)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, SubprocError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SubprocError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let (amount_str, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| SubprocError::InvalidConfig(format!("Invalid duration value: '{raw}'")))?;

    Ok(Duration::from_millis(amount.saturating_mul(unit_ms)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_duration(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
