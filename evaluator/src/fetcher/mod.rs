//! Flag sources for the evaluation cache.

mod db;
mod json;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EvalCacheSource;
use crate::types::Flag;

pub use db::DbFetcher;
pub use json::{JsonFileFetcher, JsonHttpFetcher};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid flag JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid flag source: {0}")]
    InvalidSource(String),
}

/// Loads the complete set of flags. Called once per refresh cycle.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short source name used in logs.
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> Result<Vec<Flag>, FetchError>;
}

pub async fn get_fetcher(
    source: &EvalCacheSource,
    request_timeout: Duration,
) -> Result<Arc<dyn Fetcher>, FetchError> {
    match source {
        EvalCacheSource::Db { url } => Ok(Arc::new(DbFetcher::connect(url).await?)),
        EvalCacheSource::JsonFile { path } => Ok(Arc::new(JsonFileFetcher::new(path.clone()))),
        EvalCacheSource::JsonHttp { url } => {
            Ok(Arc::new(JsonHttpFetcher::new(url.clone(), request_timeout)?))
        }
    }
}
