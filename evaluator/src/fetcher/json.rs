use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{FetchError, Fetcher};
use crate::types::{EvalCacheJson, Flag};

/// Reads an exported evaluation cache from disk.
pub struct JsonFileFetcher {
    path: PathBuf,
}

impl JsonFileFetcher {
    pub fn new(path: PathBuf) -> Self {
        JsonFileFetcher { path }
    }
}

#[async_trait]
impl Fetcher for JsonFileFetcher {
    fn name(&self) -> &'static str {
        "json_file"
    }

    async fn fetch(&self) -> Result<Vec<Flag>, FetchError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let cache: EvalCacheJson = serde_json::from_slice(&bytes)?;
        Ok(cache.flags)
    }
}

/// Downloads an exported evaluation cache, typically from another
/// instance's `/export/eval_cache/json` endpoint. A failed download is
/// retried on the next refresh tick.
pub struct JsonHttpFetcher {
    client: reqwest::Client,
    url: Url,
}

impl JsonHttpFetcher {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(JsonHttpFetcher { client, url })
    }
}

#[async_trait]
impl Fetcher for JsonHttpFetcher {
    fn name(&self) -> &'static str {
        "json_http"
    }

    async fn fetch(&self) -> Result<Vec<Flag>, FetchError> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.to_string(),
                status,
            });
        }

        let bytes = response.bytes().await?;
        let cache: EvalCacheJson = serde_json::from_slice(&bytes)?;
        Ok(cache.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{TestFlagServer, fixture_export};
    use reqwest::StatusCode;
    use std::io::Write;

    #[tokio::test]
    async fn test_json_file_fetcher() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(fixture_export().as_bytes()).unwrap();

        let fetcher = JsonFileFetcher::new(file.path().to_path_buf());
        let flags = fetcher.fetch().await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].key, "flag_key_100");
        assert_eq!(flags[0].segments[0].constraints[0].property, "dl_state");
    }

    #[tokio::test]
    async fn test_json_file_fetcher_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = JsonFileFetcher::new(dir.path().join("missing.json"));
        assert!(matches!(fetcher.fetch().await, Err(FetchError::Io(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"flags\": [").unwrap();
        let fetcher = JsonFileFetcher::new(file.path().to_path_buf());
        assert!(matches!(fetcher.fetch().await, Err(FetchError::Json(_))));
    }

    #[tokio::test]
    async fn test_json_http_fetcher() {
        let server = TestFlagServer::spawn(vec![(200, fixture_export())]).await;
        let fetcher = JsonHttpFetcher::new(server.url(), Duration::from_secs(5)).unwrap();

        let flags = fetcher.fetch().await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].id, 100);
    }

    #[tokio::test]
    async fn test_json_http_fetcher_does_not_retry() {
        let server = TestFlagServer::spawn(vec![
            (503, String::new()),
            (200, fixture_export()),
        ])
        .await;
        let fetcher = JsonHttpFetcher::new(server.url(), Duration::from_secs(5)).unwrap();

        match fetcher.fetch().await {
            Err(FetchError::Status { status, .. }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(server.requests(), 1);

        // The next refresh gets the next response.
        assert_eq!(fetcher.fetch().await.unwrap().len(), 1);
        assert_eq!(server.requests(), 2);
    }

    #[tokio::test]
    async fn test_json_http_fetcher_status_error() {
        let server = TestFlagServer::spawn(vec![(404, String::new())]).await;
        let fetcher = JsonHttpFetcher::new(server.url(), Duration::from_secs(5)).unwrap();

        match fetcher.fetch().await {
            Err(FetchError::Status { status, .. }) => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
