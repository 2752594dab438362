//! Startup configuration, read from the environment.
//!
//! Every option has a default; a value that is present but unparseable
//! is an error, never a silent fallback.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use snafu::Snafu;

use aide_core::state::Visibility;
use aide_core::TierLevel;

pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECORDER_CAPACITY: usize = 10_000;
pub const DEFAULT_RECORDER_BATCH: usize = 100;
pub const DEFAULT_RECORDER_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("`{key}` has unparseable value `{value}`"))]
    InvalidValue { key: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderConfig {
    pub capacity: usize,
    pub batch: usize,
    pub flush_interval: Duration,
    /// Append-only JSONL destination; `None` keeps records in memory.
    pub path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RECORDER_CAPACITY,
            batch: DEFAULT_RECORDER_BATCH,
            flush_interval: DEFAULT_RECORDER_FLUSH_INTERVAL,
            path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    pub workspace_dir: PathBuf,
    pub public_dir: PathBuf,
    /// Provider model identifiers per tier.
    pub models: BTreeMap<TierLevel, String>,
    /// Optional shadow model identifiers per tier.
    pub shadow_models: BTreeMap<TierLevel, String>,
    pub tier_timeout: Duration,
    /// Per-tier overrides of the default timeout.
    pub tier_timeouts: BTreeMap<TierLevel, Duration>,
    pub recorder: RecorderConfig,
    pub default_visibility: Visibility,
    /// Path to a JSON blueprint used for new pages.
    pub default_blueprint: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("data/workspace"),
            public_dir: PathBuf::from("data/public"),
            models: BTreeMap::new(),
            shadow_models: BTreeMap::new(),
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            tier_timeouts: BTreeMap::new(),
            recorder: RecorderConfig::default(),
            default_visibility: Visibility::Private,
            default_blueprint: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = std::env::var_os("AIDE_WORKSPACE_DIR") {
            config.workspace_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("AIDE_PUBLIC_DIR") {
            config.public_dir = PathBuf::from(dir);
        }
        for (level, key) in [
            (TierLevel::L2, "AIDE_MODEL_L2"),
            (TierLevel::L3, "AIDE_MODEL_L3"),
            (TierLevel::L4, "AIDE_MODEL_L4"),
        ] {
            if let Some(model) = env_string(key) {
                config.models.insert(level, model);
            }
        }
        for (level, key) in [
            (TierLevel::L3, "AIDE_SHADOW_MODEL_L3"),
            (TierLevel::L4, "AIDE_SHADOW_MODEL_L4"),
        ] {
            if let Some(model) = env_string(key) {
                config.shadow_models.insert(level, model);
            }
        }

        if let Some(secs) = env_parse::<u64>("AIDE_TIER_TIMEOUT_SECS")? {
            config.tier_timeout = Duration::from_secs(secs);
        }
        for (level, key) in [
            (TierLevel::L2, "AIDE_TIER_TIMEOUT_SECS_L2"),
            (TierLevel::L3, "AIDE_TIER_TIMEOUT_SECS_L3"),
            (TierLevel::L4, "AIDE_TIER_TIMEOUT_SECS_L4"),
        ] {
            if let Some(secs) = env_parse::<u64>(key)? {
                config
                    .tier_timeouts
                    .insert(level, Duration::from_secs(secs));
            }
        }

        if let Some(capacity) = env_parse::<usize>("AIDE_RECORDER_CAPACITY")? {
            config.recorder.capacity = capacity;
        }
        if let Some(batch) = env_parse::<usize>("AIDE_RECORDER_BATCH")? {
            config.recorder.batch = batch;
        }
        if let Some(secs) = env_parse::<u64>("AIDE_RECORDER_FLUSH_SECS")? {
            config.recorder.flush_interval = Duration::from_secs(secs);
        }
        if let Some(path) = std::env::var_os("AIDE_RECORDER_PATH") {
            config.recorder.path = Some(PathBuf::from(path));
        }

        if let Some(visibility) = env_string("AIDE_DEFAULT_VISIBILITY") {
            config.default_visibility = match visibility.as_str() {
                "private" => Visibility::Private,
                "public" => Visibility::Public,
                _ => {
                    return InvalidValueSnafu {
                        key: "AIDE_DEFAULT_VISIBILITY",
                        value: visibility,
                    }
                    .fail()
                }
            };
        }
        if let Some(path) = std::env::var_os("AIDE_DEFAULT_BLUEPRINT") {
            config.default_blueprint = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    pub fn timeout_for(&self, level: TierLevel) -> Duration {
        self.tier_timeouts
            .get(&level)
            .copied()
            .unwrap_or(self.tier_timeout)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> ConfigResult<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            InvalidValueSnafu { key, value }.build()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ServiceConfig::default();
        assert_eq!(config.tier_timeout, DEFAULT_TIER_TIMEOUT);
        assert_eq!(config.timeout_for(TierLevel::L3), DEFAULT_TIER_TIMEOUT);
        assert_eq!(config.recorder.capacity, DEFAULT_RECORDER_CAPACITY);
        assert_eq!(config.default_visibility, Visibility::Private);
    }

    #[test]
    fn per_tier_timeout_overrides() {
        let mut config = ServiceConfig::default();
        config
            .tier_timeouts
            .insert(TierLevel::L4, Duration::from_secs(120));
        assert_eq!(config.timeout_for(TierLevel::L4), Duration::from_secs(120));
        assert_eq!(config.timeout_for(TierLevel::L2), DEFAULT_TIER_TIMEOUT);
    }
}
