use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use crate::fetcher::{FetchError, Fetcher};
use crate::types::{
    Constraint, Distribution, EvalCacheJson, Flag, FlagId, Segment, SegmentId, Tag, Variant,
};

/// Segment of flag 100: `dl_state == "CA"`, split 50/50 between variants
/// 300 (`control`) and 301 (`treatment`).
pub fn segment(id: SegmentId, rank: u32, rollout_percent: u32) -> Segment {
    Segment {
        id,
        flag_id: 100,
        description: format!("segment {id}"),
        rank,
        rollout_percent,
        constraints: vec![Constraint {
            id: 500,
            segment_id: id,
            property: "dl_state".into(),
            operator: "EQ".into(),
            value: r#""CA""#.into(),
        }],
        distributions: vec![
            Distribution {
                id: 400,
                segment_id: id,
                variant_id: 300,
                variant_key: "control".into(),
                percent: 50,
            },
            Distribution {
                id: 401,
                segment_id: id,
                variant_id: 301,
                variant_key: "treatment".into(),
                percent: 50,
            },
        ],
    }
}

pub fn fixture_flag() -> Flag {
    let mut attachment = serde_json::Map::new();
    attachment.insert("value".into(), "321".into());

    Flag {
        id: 100,
        key: "flag_key_100".into(),
        description: "fixture flag".into(),
        enabled: true,
        entity_type: None,
        segments: vec![segment(200, 0, 100)],
        variants: vec![
            Variant {
                id: 300,
                flag_id: 100,
                key: "control".into(),
                attachment: None,
            },
            Variant {
                id: 301,
                flag_id: 100,
                key: "treatment".into(),
                attachment: Some(attachment),
            },
        ],
        tags: Vec::new(),
    }
}

/// An enabled flag with no segments and the given tags.
pub fn tagged_flag(id: FlagId, key: &str, tags: &[&str]) -> Flag {
    Flag {
        id,
        key: key.into(),
        enabled: true,
        tags: tags
            .iter()
            .enumerate()
            .map(|(i, value)| Tag {
                id: i as u64 + 1,
                value: value.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

pub fn fixture_export() -> String {
    serde_json::to_string(&EvalCacheJson {
        timestamp: None,
        flags: vec![fixture_flag()],
    })
    .unwrap()
}

/// In-memory fetcher whose result can be changed between refreshes.
#[derive(Default)]
pub struct TestFetcher {
    flags: Mutex<Vec<Flag>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl TestFetcher {
    pub fn new(flags: Vec<Flag>) -> Arc<Self> {
        Arc::new(TestFetcher {
            flags: Mutex::new(flags),
            ..Default::default()
        })
    }

    pub fn set_flags(&self, flags: Vec<Flag>) {
        *self.flags.lock() = flags;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl Fetcher for TestFetcher {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn fetch(&self) -> Result<Vec<Flag>, FetchError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(FetchError::Io(std::io::Error::other("source unavailable")));
        }
        Ok(self.flags.lock().clone())
    }
}

/// Serves canned HTTP responses in order, repeating the last one.
pub struct TestFlagServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestFlagServer {
    pub async fn spawn(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses
                    .get(n)
                    .or(responses.last())
                    .cloned()
                    .unwrap_or((404, String::new()));

                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(len) => head.extend_from_slice(&buf[..len]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        TestFlagServer {
            addr,
            requests,
            handle,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/export/eval_cache/json", self.addr)).unwrap()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestFlagServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
