//! Axum router and request handlers for the Bazel HTTP remote-cache protocol.
//!
//! Routes:
//! - `GET  /healthz`          - Health check
//! - `GET  /metrics`          - Prometheus metrics
//! - `GET  /{kind}/{sha256}`  - Download a blob (`kind` is `ac` or `cas`)
//! - `HEAD /{kind}/{sha256}`  - Existence and size of a blob
//! - `PUT  /{kind}/{sha256}`  - Upload a blob

use std::any::Any;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, instrument, warn};

use crate::cache::backend::remove_file_quietly;
use crate::cache::{CacheBackend, CacheKind, Digest};
use crate::metrics::{Method as MetricMethod, Outcome};
use crate::AppState;

const OCTET_STREAM: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .route("/{kind}/{sha}", any(handle_blob))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Dispatch a blob request by method after validating the path.
#[instrument(skip_all, fields(%kind, %sha, %method))]
async fn handle_blob(
    State(state): State<Arc<AppState>>,
    Path((kind, sha)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let Ok(kind) = kind.parse::<CacheKind>() else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    if !matches!(method, Method::GET | Method::HEAD | Method::PUT) {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }
    let digest = Digest::parse(&sha).ok_or(AppError::InvalidSha)?;

    match method {
        Method::GET => handle_get(&state, kind, digest).await,
        Method::HEAD => handle_head(&state, kind, digest).await,
        _ => handle_put(&state, kind, digest, &headers, body).await,
    }
}

/// `GET /{kind}/{sha256}`
///
/// Restores the blob, streams it, and deletes the staged copy once the body
/// has been sent or dropped.
async fn handle_get(
    state: &AppState,
    kind: CacheKind,
    digest: Digest,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;
    let Some((file, len)) = open_blob(&state.backend, kind, &digest).await? else {
        metrics.record_blob(kind, MetricMethod::Get, Outcome::Miss);
        debug!("cache miss");
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    metrics.record_blob(kind, MetricMethod::Get, Outcome::Hit);
    debug!(bytes = len, "cache hit");

    let guard = DeleteOnDrop::new(state.backend.clone(), kind, digest);
    let served = state.metrics.metrics.clone();
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &guard;
        if let Ok(bytes) = &chunk {
            served.bytes_served.inc_by(bytes.len() as u64);
        }
        chunk
    });

    Ok((StatusCode::OK, blob_headers(len), Body::from_stream(stream)).into_response())
}

/// `HEAD /{kind}/{sha256}`
///
/// Same lookup as GET.  The staged copy is removed before responding, so a
/// following GET restores the blob again.
async fn handle_head(
    state: &AppState,
    kind: CacheKind,
    digest: Digest,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;
    let Some((file, len)) = open_blob(&state.backend, kind, &digest).await? else {
        metrics.record_blob(kind, MetricMethod::Head, Outcome::Miss);
        debug!("cache miss");
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    drop(file);
    state.backend.delete_local(kind, &digest).await;
    metrics.record_blob(kind, MetricMethod::Head, Outcome::Hit);

    Ok((StatusCode::OK, blob_headers(len), Body::empty()).into_response())
}

/// `PUT /{kind}/{sha256}`
///
/// Streams the body into a private temp file and hands it to the backend.
async fn handle_put(
    state: &AppState,
    kind: CacheKind,
    digest: Digest,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;
    if let Some(encoding) = headers.get(header::CONTENT_ENCODING) {
        if !encoding.as_bytes().eq_ignore_ascii_case(b"identity") {
            warn!(encoding = ?encoding, "unsupported content encoding");
            metrics.record_blob(kind, MetricMethod::Put, Outcome::Error);
            return Err(AppError::InvalidBody);
        }
    }

    if let Err(e) = tokio::fs::create_dir_all(&state.tmp_dir).await {
        metrics.record_blob(kind, MetricMethod::Put, Outcome::Error);
        return Err(AppError::PutFailed(format!(
            "failed to create temp dir {}: {e}",
            state.tmp_dir.display()
        )));
    }
    let tmp_path = temp_upload_path(&state.tmp_dir, kind, &digest);

    let written = match write_body(body, &tmp_path).await {
        Ok(n) => n,
        Err(e) => {
            remove_file_quietly(&tmp_path).await;
            metrics.record_blob(kind, MetricMethod::Put, Outcome::Error);
            return Err(match e {
                AppError::Internal(err) => AppError::PutFailed(format!("{err:#}")),
                other => other,
            });
        }
    };
    metrics.bytes_received.inc_by(written);

    if let Err(e) = state.backend.put_file(kind, &digest, tmp_path.clone()).await {
        remove_file_quietly(&tmp_path).await;
        metrics.record_blob(kind, MetricMethod::Put, Outcome::Error);
        return Err(AppError::PutFailed(e.to_string()));
    }

    metrics.record_blob(kind, MetricMethod::Put, Outcome::Stored);
    debug!(bytes = written, "blob stored");
    Ok(StatusCode::OK.into_response())
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Restore and open a blob.  If the staged file disappears between restore
/// and open (a concurrent HEAD or finished GET deleted it), restore once more.
async fn open_blob(
    backend: &CacheBackend,
    kind: CacheKind,
    digest: &Digest,
) -> Result<Option<(tokio::fs::File, u64)>, AppError> {
    for _ in 0..2 {
        let Some(path) = backend
            .get_file(kind, digest)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
        else {
            return Ok(None);
        };

        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let len = file
                    .metadata()
                    .await
                    .with_context(|| format!("failed to stat {}", path.display()))?
                    .len();
                return Ok(Some((file, len)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "staged blob vanished before open");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to open {}", path.display()))
                    .into())
            }
        }
    }
    Ok(None)
}

fn blob_headers(len: u64) -> [(HeaderName, HeaderValue); 2] {
    [
        (header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM)),
        (header::CONTENT_LENGTH, HeaderValue::from(len)),
    ]
}

/// `{kind}-{sha}-{pid}-{millis}-{random}` under `dir`.
fn temp_upload_path(dir: &FsPath, kind: CacheKind, digest: &Digest) -> PathBuf {
    let random: u32 = rand::rng().random();
    dir.join(format!(
        "{kind}-{digest}-{}-{}-{random:08x}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
    ))
}

/// Copy the request body into `dest`, returning the number of bytes written.
async fn write_body(body: Body, dest: &FsPath) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            warn!(error = %e, "request body failed mid-read");
            AppError::InvalidBody
        })?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", dest.display()))?;
    Ok(written)
}

/// Deletes the staged entry when the response body is finished or dropped.
struct DeleteOnDrop {
    backend: CacheBackend,
    kind: CacheKind,
    digest: Option<Digest>,
}

impl DeleteOnDrop {
    fn new(backend: CacheBackend, kind: CacheKind, digest: Digest) -> Self {
        Self {
            backend,
            kind,
            digest: Some(digest),
        }
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        let Some(digest) = self.digest.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%digest, "no runtime to delete staged blob");
            return;
        };
        let backend = self.backend.clone();
        let kind = self.kind;
        handle.spawn(async move {
            backend.delete_local(kind, &digest).await;
        });
    }
}

/// Turn a handler panic into the standard 500 JSON error.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked".to_string()
    };
    AppError::Internal(anyhow::anyhow!("handler panicked: {message}")).into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The digest segment is not 64 hex characters.
    InvalidSha,
    /// The request body cannot be accepted.
    InvalidBody,
    /// The backend could not store an upload.
    PutFailed(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::InvalidSha => (StatusCode::BAD_REQUEST, "invalid_sha256", None),
            AppError::InvalidBody => (StatusCode::BAD_REQUEST, "invalid_body", None),
            AppError::PutFailed(msg) => {
                error!(error = %msg, "upload failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "put_failed", Some(msg))
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some(format!("{err:#}")),
                )
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::http::Request;
    use sha2::{Digest as _, Sha256};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::backend::tests::{backend_with, CountingStore};
    use crate::cache::{BackendOptions, CacheBackend};
    use crate::metrics::MetricsRegistry;
    use crate::storage::directory::DirectoryStore;
    use crate::storage::RemoteStore;

    fn hello_sha() -> String {
        hex::encode(Sha256::digest(b"hello"))
    }

    fn state_with(root: &FsPath, store: Arc<dyn RemoteStore>) -> Arc<AppState> {
        let (backend, _) = backend_with(&root.join("stage"), store);
        Arc::new(AppState {
            backend,
            metrics: MetricsRegistry::new(),
            tmp_dir: root.join("tmp"),
        })
    }

    fn test_state(root: &FsPath) -> Arc<AppState> {
        state_with(root, Arc::new(DirectoryStore::new(root.join("remote"))))
    }

    fn request(method: &str, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response {
        create_router(Arc::clone(state)).oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn temp_files(state: &AppState) -> usize {
        std::fs::read_dir(&state.tmp_dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn put_then_get_hello() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let uri = format!("/cas/{}", hello_sha());

        let resp = send(&state, request("PUT", &uri, "hello")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(temp_files(&state), 0);

        let resp = send(&state, request("GET", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], OCTET_STREAM);
        assert_eq!(body_bytes(resp).await, b"hello");
    }

    async fn wait_until_gone(path: &FsPath) -> bool {
        for _ in 0..100 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn get_deletes_staged_copy_after_body_is_sent() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let sha = hello_sha();
        let uri = format!("/cas/{sha}");
        let staged = state
            .backend
            .blob_path(CacheKind::Cas, &Digest::parse(&sha).unwrap());

        send(&state, request("PUT", &uri, "hello")).await;
        let resp = send(&state, request("GET", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(staged.exists());

        assert_eq!(body_bytes(resp).await, b"hello");
        assert!(wait_until_gone(&staged).await);
    }

    #[tokio::test]
    async fn get_deletes_staged_copy_when_body_is_dropped_unread() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let sha = hello_sha();
        let uri = format!("/ac/{sha}");
        let staged = state
            .backend
            .blob_path(CacheKind::Ac, &Digest::parse(&sha).unwrap());

        send(&state, request("PUT", &uri, "hello")).await;
        let resp = send(&state, request("GET", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        drop(resp);

        assert!(wait_until_gone(&staged).await);
    }

    #[tokio::test]
    async fn head_reports_length_without_body_and_drops_staged_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let sha = hello_sha();
        let uri = format!("/ac/{sha}");

        send(&state, request("PUT", &uri, "hello")).await;
        let resp = send(&state, request("HEAD", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "5");
        assert!(body_bytes(resp).await.is_empty());

        let digest = Digest::parse(&sha).unwrap();
        assert!(!state.backend.blob_path(CacheKind::Ac, &digest).exists());
    }

    #[tokio::test]
    async fn get_of_unknown_blob_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        let uri = format!("/cas/{}", hello_sha());
        let resp = send(&state, request("GET", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_bytes(resp).await.is_empty());

        let uri = format!("/ac/{}", hello_sha());
        let resp = send(&state, request("HEAD", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_sha_is_rejected_for_every_method() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        for method in ["GET", "HEAD", "PUT"] {
            let resp = send(&state, request(method, "/cas/bad-sha", "x")).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{method}");
            if method != "HEAD" {
                assert_eq!(body_json(resp).await["error"], "invalid_sha256");
            }
        }
        assert_eq!(temp_files(&state), 0);
    }

    #[tokio::test]
    async fn unknown_kind_and_path_are_404() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        let uri = format!("/blobs/{}", hello_sha());
        let resp = send(&state, request("GET", &uri, Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&state, request("GET", "/cas/a/b", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_methods_are_405() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        for method in ["POST", "DELETE"] {
            let uri = format!("/cas/{}", hello_sha());
            let resp = send(&state, request(method, &uri, Body::empty())).await;
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
        }
    }

    #[tokio::test]
    async fn compressed_upload_is_invalid_body() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        let req = Request::builder()
            .method("PUT")
            .uri(format!("/cas/{}", hello_sha()))
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from("hello"))
            .unwrap();
        let resp = send(&state, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid_body");
        assert_eq!(temp_files(&state), 0);
    }

    #[tokio::test]
    async fn local_spool_failure_is_put_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let base = test_state(tmp.path());
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let state = Arc::new(AppState {
            backend: base.backend.clone(),
            metrics: base.metrics.clone(),
            tmp_dir: blocker.join("tmp"),
        });

        let resp = send(&state, request("PUT", &format!("/cas/{}", hello_sha()), "hello")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "put_failed");
        assert!(json["message"].as_str().unwrap().contains("temp dir"));
    }

    #[tokio::test]
    async fn failed_put_is_500_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(&tmp.path().join("remote")));
        store.transient_failures.store(u32::MAX, Ordering::SeqCst);
        let state = state_with(tmp.path(), store.clone());

        let resp = send(&state, request("PUT", &format!("/cas/{}", hello_sha()), "hello")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "put_failed");
        assert!(json["message"].as_str().unwrap().contains("5 attempt"));
        assert_eq!(store.saves.load(Ordering::SeqCst), 5);
        assert_eq!(temp_files(&state), 0);
    }

    #[tokio::test]
    async fn healthz_is_ok_when_backend_is_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        let resp = send(&state, request("GET", "/healthz", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backend"]["ok"], true);
        assert_eq!(json["pid"], std::process::id());
        assert!(json["now"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn healthz_is_503_when_prerequisites_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = BackendOptions {
            namespace: "ci".to_string(),
            root_dir: tmp.path().join("stage"),
            concurrency: 4,
            retry: Default::default(),
            required_env: vec!["BAZEL_CACHE_PROXY_TEST_MISSING_TOKEN".to_string()],
        };
        let backend = CacheBackend::new(
            opts,
            Arc::new(DirectoryStore::new(tmp.path().join("remote"))),
            MetricsRegistry::new(),
        );
        let state = Arc::new(AppState {
            backend,
            metrics: MetricsRegistry::new(),
            tmp_dir: tmp.path().join("tmp"),
        });

        let resp = send(&state, request("GET", "/healthz", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["backend"]["ok"], false);
        assert!(json["backend"]["message"]
            .as_str()
            .unwrap()
            .contains("BAZEL_CACHE_PROXY_TEST_MISSING_TOKEN"));
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_blob_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        send(&state, request("GET", &format!("/cas/{}", hello_sha()), Body::empty())).await;

        let resp = send(&state, request("GET", "/metrics", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(text.contains("bazel_cache_blob_requests_total"));
        assert!(text.contains("outcome=\"Miss\""));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let app: Router = Router::new()
            .route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("kaboom");
                    }
                    "unreachable"
                }),
            )
            .layer(CatchPanicLayer::custom(handle_panic));

        let resp = app.oneshot(request("GET", "/boom", Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "internal_error");
        assert!(json["message"].as_str().unwrap().contains("kaboom"));
    }
}
