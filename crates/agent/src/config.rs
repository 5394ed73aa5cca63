use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use geotrack_core::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::processor::DEFAULT_PERIOD;
use crate::provider::WatchOptions;
use crate::queue::DEFAULT_CAPACITY;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub api: ApiConfig,
    pub sampling: SamplingConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub lifecycle: LifecycleConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub location_path: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            location_path: "/api/ubicaciones".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_secs: u64,
    pub min_distance_m: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            min_distance_m: 10.0,
        }
    }
}

impl SamplingConfig {
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            min_distance_m: self.min_distance_m.max(0.0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub process_interval_secs: u64,
    pub capacity: usize,
    pub max_retries: u32,
    pub max_age_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_interval_secs: DEFAULT_PERIOD.as_secs(),
            capacity: DEFAULT_CAPACITY,
            max_retries: 3,
            max_age_hours: 24,
        }
    }
}

impl QueueConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs.max(1))
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_age_ms: (self.max_age_hours as i64) * 60 * 60 * 1000,
        }
    }
}

/// Settings for `send_with_retry`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub send_max_retries: u32,
    pub send_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            send_max_retries: 3,
            send_base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.send_base_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub state_poll_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { state_poll_secs: 5 }
    }
}

impl LifecycleConfig {
    pub fn state_poll(&self) -> Duration {
        Duration::from_secs(self.state_poll_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".geotrack").join("state.db"),
        }
    }
}

impl TrackerConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: TrackerConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".geotrack").join("geotrack.toml")
    }
}
