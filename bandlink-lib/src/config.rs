use crate::error::BandError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timeouts and measurement tuning for one [`BandClient`](crate::BandClient).
///
/// Every field has a default, so a config file only needs the values it
/// overrides. Durations are written as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandConfig {
    /// Bound on opening the radio link
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Bound on the whole challenge-response handshake
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,
    /// Bound on one request/response exchange
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    /// Ceiling for a single heart-rate measurement
    #[serde(with = "duration_ms")]
    pub measurement_timeout: Duration,
    /// Keep-alive period while continuous heart rate runs
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Consecutive agreeing readings that make a measurement final
    pub stable_readings: usize,
    /// Largest spread, in bpm, between readings counted as agreeing
    pub stable_tolerance_bpm: u8,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            measurement_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(12),
            stable_readings: 3,
            stable_tolerance_bpm: 3,
        }
    }
}

impl BandConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BandError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BandError> {
        if self.stable_readings == 0 {
            return Err(BandError::InvalidArgument("stable_readings must be at least 1".to_string()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(BandError::InvalidArgument("keepalive_interval must be positive".to_string()));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
