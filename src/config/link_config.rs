use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_BASE_BACKOFF_MS, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_DIAGNOSTIC_LOG_CAPACITY,
    DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_MAX_BACKOFF_MS, MAX_CONNECT_RETRIES,
    UUID_BLOOD_PRESSURE_SERVICE, UUID_GLUCOSE_SERVICE, UUID_HEALTH_THERMOMETER_SERVICE,
    UUID_HEART_RATE_SERVICE, UUID_WEIGHT_SCALE_SERVICE,
};
use crate::error::LinkError;
use crate::utils::ensure_directory_exists;

/// Options consumed by the link core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service identifiers that mark a peripheral as compatible.
    pub compatible_service_ids: HashSet<Uuid>,

    /// Manufacturer payload prefixes (vendor id first) that mark a peripheral
    /// as compatible.
    pub compatible_vendor_prefixes: HashSet<Vec<u8>>,

    /// Delay before the first reconnection attempt.
    #[serde(with = "millis", rename = "base_backoff_ms")]
    pub base_backoff: Duration,

    /// Upper bound of any reconnection delay.
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,

    /// Reconnection attempts per episode before the session gives up.
    pub max_retry_attempts: u32,

    /// How long a command waits for its reply.
    #[serde(with = "millis", rename = "command_timeout_ms")]
    pub command_timeout: Duration,

    /// Events a subscriber may lag behind before the oldest are dropped.
    pub event_queue_capacity: usize,

    /// Bound of the rejection and ignored-completion logs.
    pub diagnostic_log_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            compatible_service_ids: HashSet::from([
                UUID_HEART_RATE_SERVICE,
                UUID_HEALTH_THERMOMETER_SERVICE,
                UUID_GLUCOSE_SERVICE,
                UUID_BLOOD_PRESSURE_SERVICE,
                UUID_WEIGHT_SCALE_SERVICE,
            ]),
            compatible_vendor_prefixes: HashSet::new(),
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            max_retry_attempts: MAX_CONNECT_RETRIES,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            diagnostic_log_capacity: DEFAULT_DIAGNOSTIC_LOG_CAPACITY,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.base_backoff.is_zero() {
            return Err(LinkError::InvalidConfig("base_backoff must be non-zero".into()));
        }
        if self.base_backoff > self.max_backoff {
            return Err(LinkError::InvalidConfig(format!(
                "base_backoff ({:?}) exceeds max_backoff ({:?})",
                self.base_backoff, self.max_backoff
            )));
        }
        if self.command_timeout.is_zero() {
            return Err(LinkError::InvalidConfig("command_timeout must be non-zero".into()));
        }
        if self.event_queue_capacity == 0 || self.diagnostic_log_capacity == 0 {
            return Err(LinkError::InvalidConfig("capacities must be non-zero".into()));
        }
        if self.compatible_vendor_prefixes.iter().any(Vec::is_empty) {
            return Err(LinkError::InvalidConfig("empty vendor prefix".into()));
        }
        Ok(())
    }

    /// Loads the config from `path`, using defaults if the file is missing.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref()).await?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the config to `path` as pretty JSON, creating parent directories.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path.as_ref()).await
    }
}

pub(crate) async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        warn!("Config file not found at {:?}, using default.", path);
        return Ok(T::default());
    }

    let config_json = fs::read_to_string(path).await?;
    let config = serde_json::from_str(&config_json)?;

    info!("Config loaded from {:?}", path);
    Ok(config)
}

pub(crate) async fn save_json<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        ensure_directory_exists(dir).await?;
    }

    let config_json = match serde_json::to_string_pretty(config) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize config to JSON: {}", e);
            return Err(e.into());
        }
    };

    fs::write(path, config_json).await?;

    info!("Config saved to {:?}.", path);
    Ok(())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
