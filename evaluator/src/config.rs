use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::validation::ValidationConfig;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 59;

/// Where the evaluation cache loads flags from.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum EvalCacheSource {
    /// A SQLite database URL, e.g. `sqlite://flagr.db`.
    Db { url: String },
    JsonFile { path: PathBuf },
    JsonHttp { url: Url },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct EvalCacheConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    pub source: EvalCacheSource,
    pub enabled_flag_validation: Option<ValidationConfig>,
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_refresh_timeout_secs() -> u64 {
    DEFAULT_REFRESH_TIMEOUT_SECS
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum InvalidConfig {
    #[error("eval_cache.refresh_interval_secs must be greater than 0")]
    ZeroRefreshInterval,
    #[error("eval_cache.refresh_timeout_secs must be greater than 0")]
    ZeroRefreshTimeout,
}

impl EvalCacheConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.refresh_interval_secs == 0 {
            return Err(InvalidConfig::ZeroRefreshInterval);
        }
        if self.refresh_timeout_secs == 0 {
            return Err(InvalidConfig::ZeroRefreshTimeout);
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
