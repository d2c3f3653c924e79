use evaluator::EvalCacheConfig;
use serde::Deserialize;
use std::fs::File;

const DEFAULT_STATSD_PORT: u16 = 8125;

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    pub statsd_host: String,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
}

fn default_statsd_port() -> u16 {
    DEFAULT_STATSD_PORT
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 18001,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("admin_listener.host is empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("admin_listener.port must not be 0".into()));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub admin_listener: Listener,
    pub eval_cache: EvalCacheConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data: Config = serde_yaml::from_reader(file)?;
        data.validate()?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admin_listener.validate()?;
        self.eval_cache
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        self.logging
            .as_ref()
            .and_then(|l| l.sentry_dsn.as_deref())
            .filter(|dsn| !dsn.is_empty())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
