//! Local staging tier over a durable [`RemoteStore`].
//!
//! Blobs only touch local disk while they are in transit: a GET restores the
//! entry from the remote store into `{root}/{kind}/{sha256}/data`, the HTTP
//! layer serves it once and deletes it; a PUT moves the uploaded file into the
//! same location, saves it to the remote store and deletes it again.
//!
//! Restores and saves are coalesced per key (see [`InFlight`]) and every call
//! into the remote store goes through a FIFO semaphore and the retry policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::inflight::{InFlight, Role};
use super::key::{sanitize_namespace, CacheKey, CacheKind, Digest};
use crate::config::Config;
use crate::health::CheckResult;
use crate::metrics::{MetricsRegistry, RemoteOp, RemoteOpLabels, RemoteResult};
use crate::retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper};
use crate::storage::{RemoteStore, StoreError};

const BLOB_FILE: &str = "data";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a backend operation.  Cloneable so that every caller coalesced
/// onto one operation receives the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("remote store failed after {attempts} attempt(s): {message}")]
    Remote { attempts: u32, message: String },
    #[error("{context}: {source}")]
    Local {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("cache operation aborted: {0}")]
    Aborted(String),
}

impl BackendError {
    fn local(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Local {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    fn aborted(message: String) -> Self {
        Self::Aborted(message)
    }
}

impl From<RetryError> for BackendError {
    fn from(err: RetryError) -> Self {
        Self::Remote {
            attempts: err.attempts,
            message: err.last.to_string(),
        }
    }
}

type RestoreOutcome = Result<Option<PathBuf>, BackendError>;
type SaveOutcome = Result<(), BackendError>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Prefix of every remote key; sanitised on construction.
    pub namespace: String,
    /// Root of the local staging tier.
    pub root_dir: PathBuf,
    /// Maximum simultaneous remote-store calls across all keys.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Environment variables the remote store needs; reported by `healthz`.
    pub required_env: Vec<String>,
}

impl BackendOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.cache.namespace.clone(),
            root_dir: config.cache.store_dir.clone(),
            concurrency: config.cache.concurrency,
            retry: config.cache.retry.policy(),
            required_env: config.remote.required_env.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones share the coalescing maps and the limiter.
#[derive(Clone)]
pub struct CacheBackend {
    inner: Arc<Inner>,
}

struct Inner {
    namespace: String,
    root: PathBuf,
    store: Arc<dyn RemoteStore>,
    limiter: Semaphore,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    required_env: Vec<String>,
    restores: InFlight<CacheKey, RestoreOutcome>,
    saves: InFlight<CacheKey, SaveOutcome>,
    metrics: MetricsRegistry,
}

impl CacheBackend {
    pub fn new(
        opts: BackendOptions,
        store: Arc<dyn RemoteStore>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self::with_sleeper(opts, store, metrics, Arc::new(TokioSleeper))
    }

    /// Like [`CacheBackend::new`] with a custom sleeper for retry backoff.
    pub fn with_sleeper(
        opts: BackendOptions,
        store: Arc<dyn RemoteStore>,
        metrics: MetricsRegistry,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace: sanitize_namespace(&opts.namespace),
                root: opts.root_dir,
                store,
                limiter: Semaphore::new(opts.concurrency.max(1)),
                retry: opts.retry,
                sleeper,
                required_env: opts.required_env,
                restores: InFlight::new(),
                saves: InFlight::new(),
                metrics,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn key(&self, kind: CacheKind, digest: &Digest) -> CacheKey {
        CacheKey::new(&self.inner.namespace, kind, digest.clone())
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.inner
            .root
            .join(key.kind.as_str())
            .join(key.digest.as_str())
    }

    /// Local staging path of a blob.  Only populated while in transit.
    pub fn blob_path(&self, kind: CacheKind, digest: &Digest) -> PathBuf {
        self.entry_dir(&self.key(kind, digest)).join(BLOB_FILE)
    }

    // -----------------------------------------------------------------------
    // get
    // -----------------------------------------------------------------------

    /// Restore a blob from the remote store into the staging tier.
    ///
    /// Returns the local path on a hit and `None` on a miss.  Concurrent
    /// calls for the same key share one restore.
    pub async fn get_file(
        &self,
        kind: CacheKind,
        digest: &Digest,
    ) -> Result<Option<PathBuf>, BackendError> {
        let key = self.key(kind, digest);
        let this = self.clone();
        let op_key = key.clone();
        let (role, pending) = self.inner.restores.join_or_start(
            key,
            move || async move { this.restore_entry(&op_key).await },
            |msg| Err(BackendError::aborted(msg)),
        );
        if role == Role::Follower {
            self.count_coalesced(RemoteOp::Restore);
        }
        pending.await
    }

    #[instrument(skip(self, key), fields(key = %key.remote_key()))]
    async fn restore_entry(&self, key: &CacheKey) -> RestoreOutcome {
        let entry_dir = self.entry_dir(key);
        let blob_path = entry_dir.join(BLOB_FILE);

        tokio::fs::create_dir_all(&entry_dir).await.map_err(|e| {
            BackendError::local(
                format!("failed to create staging dir {}", entry_dir.display()),
                e,
            )
        })?;

        let paths = vec![entry_dir.clone()];
        let paths = &paths;
        let store = &*self.inner.store;
        let started = Instant::now();
        let result = self
            .with_remote(RemoteOp::Restore, move || async move {
                store.restore(paths, key.remote_key()).await
            })
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        let found = match result {
            Ok(found) => found,
            Err(err) => {
                self.record_remote(RemoteOp::Restore, RemoteResult::Error, elapsed);
                self.discard_restore(key, &entry_dir).await;
                return Err(err.into());
            }
        };

        if found && is_file(&blob_path).await {
            self.record_remote(RemoteOp::Restore, RemoteResult::Found, elapsed);
            debug!(path = %blob_path.display(), "restored from remote store");
            return Ok(Some(blob_path));
        }

        self.record_remote(RemoteOp::Restore, RemoteResult::NotFound, elapsed);
        if found {
            warn!("remote store reported a hit but no blob was restored");
        }
        self.discard_restore(key, &entry_dir).await;
        Ok(None)
    }

    /// Drop whatever a failed or empty restore left in the staging entry.
    /// While a save of the same key is staging into the directory, only an
    /// empty directory is removed.
    async fn discard_restore(&self, key: &CacheKey, entry_dir: &Path) {
        let result = if self.inner.saves.contains(key) {
            tokio::fs::remove_dir(entry_dir).await
        } else {
            tokio::fs::remove_dir_all(entry_dir).await
        };
        if let Err(e) = result {
            debug!(error = %e, path = %entry_dir.display(), "staging entry kept after restore");
        }
    }

    // -----------------------------------------------------------------------
    // put
    // -----------------------------------------------------------------------

    /// Move `source` into the staging tier and save it to the remote store.
    ///
    /// If a save of the same key is already running, `source` is deleted and
    /// the caller waits for that save instead.  A key that already exists
    /// remotely counts as success.
    pub async fn put_file(
        &self,
        kind: CacheKind,
        digest: &Digest,
        source: PathBuf,
    ) -> Result<(), BackendError> {
        let key = self.key(kind, digest);
        let this = self.clone();
        let op_key = key.clone();
        let op_source = source.clone();
        let (role, pending) = self.inner.saves.join_or_start(
            key,
            move || async move { this.save_entry(&op_key, op_source).await },
            |msg| Err(BackendError::aborted(msg)),
        );
        if role == Role::Follower {
            self.count_coalesced(RemoteOp::Save);
            remove_file_quietly(&source).await;
        }
        pending.await
    }

    #[instrument(skip(self, key, source), fields(key = %key.remote_key()))]
    async fn save_entry(&self, key: &CacheKey, source: PathBuf) -> SaveOutcome {
        let entry_dir = self.entry_dir(key);
        let blob_path = entry_dir.join(BLOB_FILE);

        let result = self.stage_and_save(key, &source, &entry_dir, &blob_path).await;

        if let Err(e) = tokio::fs::remove_dir_all(&entry_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %entry_dir.display(), "failed to remove staged upload");
            }
        }
        result
    }

    async fn stage_and_save(
        &self,
        key: &CacheKey,
        source: &Path,
        entry_dir: &Path,
        blob_path: &Path,
    ) -> SaveOutcome {
        if let Err(e) = tokio::fs::create_dir_all(entry_dir).await {
            remove_file_quietly(source).await;
            return Err(BackendError::local(
                format!("failed to create staging dir {}", entry_dir.display()),
                e,
            ));
        }
        if let Err(e) = move_file(source, blob_path).await {
            remove_file_quietly(source).await;
            return Err(BackendError::local(
                format!("failed to stage upload at {}", blob_path.display()),
                e,
            ));
        }

        let paths = vec![entry_dir.to_path_buf()];
        let paths = &paths;
        let store = &*self.inner.store;
        let started = Instant::now();
        let result = self
            .with_remote(RemoteOp::Save, move || async move {
                store.save(paths, key.remote_key()).await
            })
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.record_remote(RemoteOp::Save, RemoteResult::Saved, elapsed);
                debug!("saved to remote store");
                Ok(())
            }
            Err(RetryError {
                last: StoreError::AlreadyExists { .. },
                ..
            }) => {
                self.record_remote(RemoteOp::Save, RemoteResult::Conflict, elapsed);
                debug!("entry already present in remote store");
                Ok(())
            }
            Err(err) => {
                self.record_remote(RemoteOp::Save, RemoteResult::Error, elapsed);
                Err(err.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // local cleanup / health
    // -----------------------------------------------------------------------

    /// Best-effort removal of a staged entry.  Never fails.
    pub async fn delete_local(&self, kind: CacheKind, digest: &Digest) {
        let entry_dir = self.entry_dir(&self.key(kind, digest));
        match tokio::fs::remove_dir_all(&entry_dir).await {
            Ok(()) => debug!(path = %entry_dir.display(), "local entry deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(error = %e, path = %entry_dir.display(), "failed to delete local entry")
            }
        }
    }

    /// Check that the staging root is usable and the remote store's
    /// prerequisites are present.  Never fails; problems are reported in the
    /// returned [`CheckResult`].
    pub async fn healthz(&self) -> CheckResult {
        let root = &self.inner.root;
        if let Err(e) = tokio::fs::create_dir_all(root).await {
            return CheckResult::unhealthy(format!("local dir unusable: {e}"));
        }

        let probe = root.join(format!(
            ".healthz-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = tokio::fs::write(&probe, b"ok").await {
            return CheckResult::unhealthy(format!("local dir not writable: {e}"));
        }
        remove_file_quietly(&probe).await;

        let missing: Vec<&str> = self
            .inner
            .required_env
            .iter()
            .filter(|name| std::env::var_os(name.as_str()).map_or(true, |v| v.is_empty()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return CheckResult::unhealthy(format!("missing {}", missing.join(" or ")));
        }

        CheckResult::healthy()
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    /// Run one remote-store operation under the limiter and retry policy.
    /// A limiter permit is held per attempt, not across backoff sleeps.
    async fn with_remote<T, F, Fut>(&self, op: RemoteOp, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let inner = &*self.inner;
        let what = match op {
            RemoteOp::Restore => "restore",
            RemoteOp::Save => "save",
        };
        inner
            .retry
            .run(&*inner.sleeper, what, |attempt| {
                if attempt > 0 {
                    inner
                        .metrics
                        .metrics
                        .remote_retries
                        .get_or_create(&RemoteOpLabels { op: op.clone() })
                        .inc();
                }
                let call_fut = call();
                async move {
                    let _permit = inner.limiter.acquire().await.map_err(|e| {
                        StoreError::Unavailable(anyhow::anyhow!("remote limiter closed: {e}"))
                    })?;
                    call_fut.await
                }
            })
            .await
    }

    fn record_remote(&self, op: RemoteOp, result: RemoteResult, seconds: f64) {
        self.inner.metrics.metrics.record_remote(op, result, seconds);
    }

    fn count_coalesced(&self, op: RemoteOp) {
        self.inner
            .metrics
            .metrics
            .coalesced_waiters
            .get_or_create(&RemoteOpLabels { op })
            .inc();
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Rename, falling back to copy-then-delete when crossing filesystems.
async fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest).await?;
    remove_file_quietly(src).await;
    Ok(())
}

pub(crate) async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(error = %e, path = %path.display(), "failed to remove file");
        }
    }
}

/// Log the effective staging configuration once at startup.
pub fn log_startup(backend: &CacheBackend, opts: &BackendOptions) {
    info!(
        namespace = %backend.namespace(),
        store_dir = %opts.root_dir.display(),
        concurrency = opts.concurrency,
        max_attempts = opts.retry.max_attempts,
        "cache backend ready"
    );
}
