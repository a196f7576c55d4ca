//! Pipeline tuning knobs.
//!
//! Every component takes its own config struct so an embedding application
//! can deserialize the whole tree from its configuration layer or construct
//! pieces programmatically. All defaults mirror the production constants.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Discovery controller scheduling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Delay before the first scan pass after startup (seconds). Gives the
    /// embedding application time to finish wiring subscribers.
    pub initial_delay_secs: u64,
    /// Fixed period between scan passes (seconds).
    pub period_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 15,
            period_secs: 300,
        }
    }
}

impl DiscoveryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Background refresher scheduling and retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Delay before the first refresher tick (seconds).
    pub initial_delay_secs: u64,
    /// Interval between refresher ticks (seconds).
    pub tick_secs: u64,
    /// Cooldown before retrying a transient identification failure (seconds).
    pub retry_cooldown_secs: u64,
    /// Natural re-identification window (seconds). Items are refreshed
    /// roughly this often.
    pub refresh_window_secs: u64,
    /// Lower bound between two refreshes of the same location (seconds), so
    /// a freshly created item is not immediately re-identified.
    pub min_refresh_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 300,
            tick_secs: 60,
            retry_cooldown_secs: 2 * 60 * 60,
            refresh_window_secs: 14 * 24 * 60 * 60,
            min_refresh_secs: 300,
        }
    }
}

impl RefreshConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn retry_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_cooldown_secs as i64)
    }

    pub fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_window_secs as i64)
    }

    pub fn min_refresh(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_refresh_secs as i64)
    }
}

/// Technical-metadata probe concurrency classes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Concurrent fast-path (cache lookup) probes.
    pub fast_limit: usize,
    /// Concurrent slow-path (full media probe) probes. Keep at 1 unless the
    /// prober is known to tolerate parallel container opens.
    pub slow_limit: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            fast_limit: 5,
            slow_limit: 1,
        }
    }
}

/// Descriptor lookup cache sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DescriptorCacheConfig {
    /// Maximum cached descriptor responses.
    pub capacity: usize,
}

impl Default for DescriptorCacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// In-process event fan-out sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Capacity of the live discover/resource broadcast channels. Slow
    /// subscribers past this lag lose events; the persistent logs do not.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub discovery: DiscoveryConfig,
    pub refresh: RefreshConfig,
    pub probe: ProbeConfig,
    pub descriptors: DescriptorCacheConfig,
    pub events: EventBusConfig,
}

impl PipelineConfig {
    /// Load configuration from the file named by `VIDRA_CONFIG`, falling
    /// back to defaults when the variable is unset.
    pub fn load_from_env() -> Result<Self> {
        match env::var_os("VIDRA_CONFIG") {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a JSON file.
    pub fn load(path: PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
