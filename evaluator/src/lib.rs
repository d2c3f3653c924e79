//! Flag evaluation engine: compiles flag definitions into an in-memory
//! cache and deterministically assigns entities to variants.

pub mod config;
pub mod constraint;
pub mod distribution;
pub mod eval_cache;
pub mod evaluator;
pub mod fetcher;
pub mod metrics_defs;
pub mod segment;
pub mod types;
pub mod validation;

#[cfg(test)]
mod testutils;

pub use config::{EvalCacheConfig, EvalCacheSource};
pub use eval_cache::{
    BatchEntity, BatchEvalRequest, CacheError, EvalCache, RefreshHandle, RefreshSettings,
    TagOperator,
};
pub use evaluator::{EvalError, FlagRef, PreparedFlag};
pub use fetcher::{FetchError, Fetcher, get_fetcher};
pub use types::{EvalCacheJson, EvalContext, EvalResult, Flag};

use validation::{EnabledFlagValidator, ValidationError};

/// Anything that prevents the cache from being built at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid eval_cache config: {0}")]
    InvalidConfig(#[from] config::InvalidConfig),
    #[error("invalid enabled flag validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not create flag source: {0}")]
    Source(#[from] FetchError),
    #[error("initial evaluation cache load failed: {0}")]
    InitialLoad(#[from] CacheError),
}

/// Builds the configured fetcher and performs the blocking initial load.
pub async fn build_cache(config: &EvalCacheConfig) -> Result<EvalCache, ConfigurationError> {
    config.validate()?;
    let validator = config
        .enabled_flag_validation
        .as_ref()
        .map(EnabledFlagValidator::new)
        .transpose()?;
    let fetcher = get_fetcher(&config.source, config.refresh_timeout()).await?;
    Ok(EvalCache::load(fetcher, RefreshSettings::from(config), validator).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_build_cache_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(testutils::fixture_export().as_bytes()).unwrap();

        let config = EvalCacheConfig {
            refresh_interval_secs: 3,
            refresh_timeout_secs: 5,
            source: EvalCacheSource::JsonFile {
                path: file.path().to_path_buf(),
            },
            enabled_flag_validation: None,
        };
        let cache = build_cache(&config).await.unwrap();
        assert!(cache.is_ready());
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_build_cache_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EvalCacheConfig {
            refresh_interval_secs: 3,
            refresh_timeout_secs: 5,
            source: EvalCacheSource::JsonFile {
                path: dir.path().join("missing.json"),
            },
            enabled_flag_validation: None,
        };
        assert!(matches!(
            build_cache(&config).await,
            Err(ConfigurationError::InitialLoad(CacheError::Fetch(_)))
        ));

        config.refresh_interval_secs = 0;
        assert!(matches!(
            build_cache(&config).await,
            Err(ConfigurationError::InvalidConfig(_))
        ));

        config.refresh_interval_secs = 3;
        config.source = EvalCacheSource::Db {
            url: "mysql://localhost/flagr".into(),
        };
        assert!(matches!(
            build_cache(&config).await,
            Err(ConfigurationError::Source(FetchError::InvalidSource(_)))
        ));
    }
}
