//! The evaluation cache: an immutable [`Snapshot`] of prepared flags,
//! indexed by id, key and tag, replaced wholesale on every refresh.
//!
//! Readers clone the current `Arc<Snapshot>` under a short read lock and
//! never observe a partially built index. Refreshes fetch and prepare the
//! next snapshot off to the side, then swap it in; any failure keeps the
//! previous snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{counter, gauge, histogram};
use tokio::sync::{Semaphore, SemaphorePermit, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EvalCacheConfig;
use crate::evaluator::{EvalError, FlagRef, PreparedFlag};
use crate::fetcher::{FetchError, Fetcher};
use crate::metrics_defs::{
    ENABLED_FLAG_VALIDATION_FAILED, EVAL_CACHE_FLAGS, EVAL_CACHE_REFRESH_DURATION,
    EVAL_CACHE_REFRESH_FAILURE, EVAL_CACHE_REFRESH_SUCCESS, EVALUATION_COUNT, EVALUATION_ERROR,
};
use crate::segment::PrepareError;
use crate::types::{EvalCacheJson, EvalContext, EvalResult, Flag, FlagId, is_safe_key};
use crate::validation::EnabledFlagValidator;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("failed to fetch flags: {0}")]
    Fetch(#[from] FetchError),
    #[error("fetching flags timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to prepare flag {flag_id} ({flag_key}): {source}")]
    Compile {
        flag_id: FlagId,
        flag_key: String,
        #[source]
        source: PrepareError,
    },
    #[error("another refresh is in progress")]
    ConcurrentRefresh,
    #[error("the refresh loop has shut down")]
    ShutDown,
}

/// How flags are matched against several tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagOperator {
    /// Flags carrying at least one of the tags.
    #[default]
    Any,
    /// Flags carrying every tag.
    All,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEntity {
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_context: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEvalRequest {
    pub entities: Vec<BatchEntity>,
    #[serde(default)]
    pub flag_ids: Vec<FlagId>,
    #[serde(default)]
    pub flag_keys: Vec<String>,
    #[serde(default)]
    pub flag_tags: Vec<String>,
    #[serde(default)]
    pub flag_tags_operator: TagOperator,
    #[serde(default)]
    pub enable_debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshStats {
    pub flags: usize,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshSettings {
    pub interval: Duration,
    /// Upper bound on a single fetch.
    pub timeout: Duration,
}

impl From<&EvalCacheConfig> for RefreshSettings {
    fn from(config: &EvalCacheConfig) -> Self {
        RefreshSettings {
            interval: config.refresh_interval(),
            timeout: config.refresh_timeout(),
        }
    }
}

/// One consistent generation of the cache. The three indexes are built
/// together and never modified afterwards.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
    id_cache: HashMap<FlagId, Arc<PreparedFlag>>,
    key_cache: HashMap<String, Arc<PreparedFlag>>,
    tag_cache: HashMap<String, HashMap<FlagId, Arc<PreparedFlag>>>,
}

impl Snapshot {
    /// Prepares every flag. Fails on the first flag that does not compile.
    pub fn build(flags: Vec<Flag>, generation: u64) -> Result<Self, CacheError> {
        let mut snapshot = Snapshot {
            generation,
            loaded_at: Some(Utc::now()),
            ..Default::default()
        };

        for flag in flags {
            let (flag_id, flag_key) = (flag.id, flag.key.clone());
            let prepared =
                Arc::new(PreparedFlag::prepare(flag).map_err(|source| CacheError::Compile {
                    flag_id,
                    flag_key: flag_key.clone(),
                    source,
                })?);

            if !flag_key.is_empty()
                && let Some(previous) =
                    snapshot.key_cache.insert(flag_key.clone(), prepared.clone())
            {
                tracing::warn!(
                    %flag_key,
                    flag_id,
                    previous_flag_id = previous.id(),
                    "duplicate flag key, the later flag wins"
                );
            }
            for tag in &prepared.flag().tags {
                snapshot
                    .tag_cache
                    .entry(tag.value.clone())
                    .or_default()
                    .insert(flag_id, prepared.clone());
            }
            snapshot.id_cache.insert(flag_id, prepared);
        }

        Ok(snapshot)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.id_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_cache.is_empty()
    }

    pub fn get(&self, flag: &FlagRef) -> Option<&Arc<PreparedFlag>> {
        match flag {
            FlagRef::Id(id) => self.id_cache.get(id),
            FlagRef::Key(key) => self.key_cache.get(key),
        }
    }

    /// Flags matching `tags`, ordered by id. No tags matches nothing.
    pub fn get_by_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
        operator: TagOperator,
    ) -> Vec<Arc<PreparedFlag>> {
        let mut matched: HashMap<FlagId, Arc<PreparedFlag>> = HashMap::new();
        match operator {
            TagOperator::Any => {
                for tag in tags {
                    if let Some(flags) = self.tag_cache.get(tag.as_ref()) {
                        matched.extend(flags.iter().map(|(id, f)| (*id, f.clone())));
                    }
                }
            }
            TagOperator::All => {
                for (i, tag) in tags.iter().enumerate() {
                    let Some(flags) = self.tag_cache.get(tag.as_ref()) else {
                        return Vec::new();
                    };
                    if i == 0 {
                        matched = flags.clone();
                    } else {
                        matched.retain(|id, _| flags.contains_key(id));
                    }
                    if matched.is_empty() {
                        return Vec::new();
                    }
                }
            }
        }

        let mut flags: Vec<_> = matched.into_values().collect();
        flags.sort_by_key(|f| f.id());
        flags
    }

    /// Raw flag definitions ordered by id.
    pub fn flags(&self) -> Vec<&Flag> {
        let mut flags: Vec<&Flag> = self.id_cache.values().map(|f| f.flag()).collect();
        flags.sort_by_key(|f| f.id);
        flags
    }

    pub fn export(&self) -> EvalCacheJson {
        EvalCacheJson {
            timestamp: Some(Utc::now()),
            flags: self.flags().into_iter().cloned().collect(),
        }
    }

    /// Evaluates the flag named by the context's `flag_id`, or its
    /// `flag_key` when no id is given.
    pub fn evaluate(&self, context: &EvalContext) -> Result<EvalResult, EvalError> {
        let result = self.resolve(context).and_then(|flag| flag.evaluate(context));
        match &result {
            Ok(r) => {
                counter!(
                    EVALUATION_COUNT,
                    "flag_id" => r.flag_id.to_string(),
                    "variant_id" => r.variant_id.map(|v| v.to_string()).unwrap_or_default()
                )
                .increment(1);
            }
            Err(err) => {
                tracing::debug!(error = %err, "evaluation failed");
                counter!(EVALUATION_ERROR).increment(1);
            }
        }
        result
    }

    fn resolve(&self, context: &EvalContext) -> Result<&Arc<PreparedFlag>, EvalError> {
        let flag = match (context.flag_id, context.flag_key.as_deref()) {
            (Some(id), _) => FlagRef::Id(id),
            (None, Some(key)) if !key.is_empty() => FlagRef::Key(key.to_string()),
            _ => return Err(EvalError::EmptyContext("flag id or flag key")),
        };
        self.get(&flag).ok_or(EvalError::FlagNotFound(flag))
    }

    /// Evaluates every entity against the requested flags: ids first, then
    /// keys, then flags matched by tags.
    pub fn evaluate_batch(&self, request: &BatchEvalRequest) -> Vec<Result<EvalResult, EvalError>> {
        let mut flags: Vec<FlagRef> = request.flag_ids.iter().map(|id| FlagRef::Id(*id)).collect();
        flags.extend(request.flag_keys.iter().cloned().map(FlagRef::Key));
        if !request.flag_tags.is_empty() {
            flags.extend(
                self.get_by_tags(request.flag_tags.as_slice(), request.flag_tags_operator)
                    .iter()
                    .map(|f| FlagRef::Id(f.id())),
            );
        }

        let mut results = Vec::with_capacity(request.entities.len() * flags.len());
        for entity in &request.entities {
            for flag in &flags {
                let mut context = EvalContext {
                    entity_id: entity.entity_id.clone(),
                    entity_type: entity.entity_type.clone(),
                    entity_context: entity.entity_context.clone(),
                    enable_debug: request.enable_debug,
                    ..Default::default()
                };
                match flag {
                    FlagRef::Id(id) => context.flag_id = Some(*id),
                    FlagRef::Key(key) => context.flag_key = Some(key.clone()),
                }
                results.push(self.evaluate(&context));
            }
        }
        results
    }
}

struct EvalCacheInner {
    snapshot: RwLock<Arc<Snapshot>>,
    fetcher: Arc<dyn Fetcher>,
    settings: RefreshSettings,
    validator: Option<EnabledFlagValidator>,
    // Only one refresh runs at a time.
    update_lock: Semaphore,
    // True once the initial load succeeded, false again after shutdown.
    ready: AtomicBool,
    generation: AtomicU64,
}

/// Cheap to clone; all clones share the same snapshot.
#[derive(Clone)]
pub struct EvalCache {
    inner: Arc<EvalCacheInner>,
}

impl EvalCache {
    /// Creates the cache and performs the initial load. An error here means
    /// there is nothing to serve.
    pub async fn load(
        fetcher: Arc<dyn Fetcher>,
        settings: RefreshSettings,
        validator: Option<EnabledFlagValidator>,
    ) -> Result<Self, CacheError> {
        let cache = EvalCache {
            inner: Arc::new(EvalCacheInner {
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                fetcher,
                settings,
                validator,
                update_lock: Semaphore::new(1),
                ready: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        };

        let stats = cache.refresh().await?;
        cache.inner.ready.store(true, Ordering::Relaxed);
        tracing::info!(
            flags = stats.flags,
            source = cache.inner.fetcher.name(),
            "evaluation cache loaded"
        );
        Ok(cache)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn get_flag(&self, flag: impl Into<FlagRef>) -> Option<Arc<PreparedFlag>> {
        self.snapshot().get(&flag.into()).cloned()
    }

    pub fn get_flags_by_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
        operator: TagOperator,
    ) -> Vec<Arc<PreparedFlag>> {
        self.snapshot().get_by_tags(tags, operator)
    }

    pub fn evaluate(&self, context: &EvalContext) -> Result<EvalResult, EvalError> {
        self.snapshot().evaluate(context)
    }

    /// All results of a batch come from the same snapshot.
    pub fn evaluate_batch(&self, request: &BatchEvalRequest) -> Vec<Result<EvalResult, EvalError>> {
        self.snapshot().evaluate_batch(request)
    }

    pub fn export(&self) -> EvalCacheJson {
        self.snapshot().export()
    }

    /// Fetches and prepares a new snapshot and swaps it in. On error the
    /// current snapshot is kept.
    pub async fn refresh(&self) -> Result<RefreshStats, CacheError> {
        let _permit = self.get_permit()?;
        let start = Instant::now();

        let result = self.reload().await;
        histogram!(EVAL_CACHE_REFRESH_DURATION).record(start.elapsed().as_secs_f64());
        match &result {
            Ok(stats) => {
                counter!(EVAL_CACHE_REFRESH_SUCCESS).increment(1);
                gauge!(EVAL_CACHE_FLAGS).set(stats.flags as f64);
                tracing::debug!(
                    flags = stats.flags,
                    generation = stats.generation,
                    "evaluation cache refreshed"
                );
            }
            Err(_) => counter!(EVAL_CACHE_REFRESH_FAILURE).increment(1),
        }
        result
    }

    async fn reload(&self) -> Result<RefreshStats, CacheError> {
        let timeout = self.inner.settings.timeout;
        let flags = tokio::time::timeout(timeout, self.inner.fetcher.fetch())
            .await
            .map_err(|_| CacheError::Timeout(timeout))??;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Snapshot::build(flags, generation)?;
        self.check_flags(&snapshot);

        let stats = RefreshStats {
            flags: snapshot.len(),
            generation,
        };
        *self.inner.snapshot.write() = Arc::new(snapshot);
        Ok(stats)
    }

    /// Reports enabled flags that break the configured rules or use unsafe
    /// keys. They are still served.
    fn check_flags(&self, snapshot: &Snapshot) {
        for flag in snapshot.flags() {
            if let Some(validator) = &self.inner.validator
                && let Err(err) = validator.validate(flag)
            {
                counter!(ENABLED_FLAG_VALIDATION_FAILED).increment(1);
                tracing::warn!(flag_id = flag.id, error = %err, "enabled flag validation failed");
            }
            if !is_safe_key(&flag.key) {
                tracing::warn!(flag_id = flag.id, flag_key = %flag.key, "unsafe flag key");
            }
            for variant in flag.variants.iter().filter(|v| !is_safe_key(&v.key)) {
                tracing::warn!(
                    flag_id = flag.id,
                    variant_id = variant.id,
                    variant_key = %variant.key,
                    "unsafe variant key"
                );
            }
        }
    }

    fn get_permit(&self) -> Result<SemaphorePermit<'_>, CacheError> {
        self.inner
            .update_lock
            .try_acquire()
            .map_err(|_| CacheError::ConcurrentRefresh)
    }

    /// Starts the background loop that refreshes on every interval tick and
    /// on demand through the returned handle. A slow refresh delays the next
    /// tick instead of overlapping with it.
    pub fn spawn_refresh_loop(&self) -> RefreshHandle {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let cache = self.clone();
        let handle = tokio::spawn(async move { cache.run_refresh_loop(rx).await });
        RefreshHandle { tx, handle }
    }

    async fn run_refresh_loop(self, mut rx: mpsc::Receiver<Command>) {
        let interval = self.inner.settings.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        tracing::error!(
                            error = %err,
                            "evaluation cache refresh failed, keeping previous snapshot"
                        );
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let result = self.refresh().await;
                        if let Err(err) = &result {
                            tracing::error!(
                                error = %err,
                                "requested evaluation cache refresh failed"
                            );
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        self.inner.ready.store(false, Ordering::Relaxed);
        tracing::info!("evaluation cache refresh loop stopped");
    }
}

#[derive(Debug)]
pub enum Command {
    // Refresh now instead of waiting for the next tick.
    Refresh(oneshot::Sender<Result<RefreshStats, CacheError>>),
    Shutdown,
}

pub struct RefreshHandle {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    pub async fn refresh(&self) -> Result<RefreshStats, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh(tx))
            .await
            .map_err(|_| CacheError::ShutDown)?;
        rx.await.map_err(|_| CacheError::ShutDown)?
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "evaluation cache refresh loop panicked");
        }
    }
}
