//! Shared fixtures: an in-process registry and layer builders.

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use mocker::{Config, LinkControl, LinkError};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const TOKEN: &str = "t0k3n";

// =============================================================================
// Mock Registry
// =============================================================================

/// Request counters and knobs shared with the handlers.
#[derive(Default)]
pub struct RegistryState {
    /// Manifest body per `library/image:tag`.
    pub manifests: Mutex<HashMap<String, String>>,
    /// Blob body per digest.
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,

    pub token_requests: AtomicUsize,
    pub last_scope: Mutex<Option<String>>,
    pub manifest_requests: AtomicUsize,
    /// Digests in request order.
    pub blob_requests: Mutex<Vec<String>>,

    /// Status returned by the token endpoint instead of a token (0 = issue).
    pub token_status: AtomicU16,
    /// Number of upcoming blob requests answered with 503.
    pub blob_failures: AtomicUsize,
    /// Cut blob bodies in half while declaring the full length.
    pub truncate_blobs: AtomicBool,
    /// Send blob bodies in four chunks with this pause before each (0 = at once).
    pub blob_chunk_delay_ms: AtomicU64,
}

impl RegistryState {
    pub fn add_manifest(&self, repository: &str, tag: &str, body: String) {
        self.manifests
            .lock()
            .unwrap()
            .insert(format!("{}:{}", repository, tag), body);
    }

    pub fn add_blob(&self, digest: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(digest.to_string(), data);
    }

    pub fn blob_requests(&self) -> Vec<String> {
        self.blob_requests.lock().unwrap().clone()
    }
}

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Arc<RegistryState>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state = Arc::new(RegistryState::default());
        let app = Router::new()
            .route("/token", get(issue_token))
            .route("/v2/:library/:image/manifests/:tag", get(serve_manifest))
            .route("/v2/:library/:image/blobs/:digest", get(serve_blob))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    /// Configuration pointing at this registry with a store under `temp`.
    pub fn config(&self, temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.base_dir = temp.path().join("store");
        config.state_dir = temp.path().join("state");
        config.registry.registry_url = format!("http://{}/v2", self.addr);
        config.registry.auth_url = format!("http://{}/token", self.addr);
        config.registry.timeout_secs = 10;
        config.registry.retry_base_delay_ms = 1;
        config.registry.max_retries = 0;
        config
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN))
}

async fn issue_token(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    *state.last_scope.lock().unwrap() = query.get("scope").cloned();

    let status = state.token_status.load(Ordering::SeqCst);
    if status != 0 {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    Json(serde_json::json!({ "token": TOKEN })).into_response()
}

async fn serve_manifest(
    State(state): State<Arc<RegistryState>>,
    Path((library, image, tag)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    state.manifest_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = format!("{}/{}:{}", library, image, tag);
    match state.manifests.lock().unwrap().get(&key) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_blob(
    State(state): State<Arc<RegistryState>>,
    Path((_library, _image, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    state.blob_requests.lock().unwrap().push(digest.clone());
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state
        .blob_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(data) = state.blobs.lock().unwrap().get(&digest).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if state.truncate_blobs.load(Ordering::SeqCst) {
        let half = Bytes::copy_from_slice(&data[..data.len() / 2]);
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(half), Err(std::io::Error::other("connection reset"))];
        return axum::http::Response::builder()
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
    }

    let delay = state.blob_chunk_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        let size = data.len().div_ceil(4).max(1);
        let chunks: Vec<Bytes> = data.chunks(size).map(Bytes::copy_from_slice).collect();
        let body = futures::stream::iter(chunks).then(move |chunk| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, std::io::Error>(chunk)
        });
        return axum::http::Response::builder()
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .body(Body::from_stream(body))
            .unwrap();
    }
    data.into_response()
}

// =============================================================================
// Image Fixtures
// =============================================================================

/// Builds an uncompressed layer from `(path, content)` pairs.
pub fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Schema 1 manifest body; `fs_layers` is in wire order (top layer first).
pub fn manifest_body(repository: &str, tag: &str, fs_layers: &[&str], config: serde_json::Value) -> String {
    let layers: Vec<_> = fs_layers
        .iter()
        .map(|d| serde_json::json!({ "blobSum": d }))
        .collect();
    let compat = serde_json::json!({ "config": config }).to_string();
    serde_json::json!({
        "schemaVersion": 1,
        "name": repository,
        "tag": tag,
        "architecture": "amd64",
        "fsLayers": layers,
        "history": [{ "v1Compatibility": compat }],
    })
    .to_string()
}

// =============================================================================
// Fake Link Control
// =============================================================================

/// Records every link operation; each `fail_on` entry fails the first call
/// whose op name matches it.
#[derive(Default)]
pub struct FakeLinks {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<(String, fn(String) -> LinkError)>>,
    pub existing: Mutex<Vec<String>>,
    /// Blocks the calling thread for this long on every matching op.
    pub stall_on: Mutex<Option<(String, Duration)>>,
}

impl FakeLinks {
    pub fn failing(op: &str, error: fn(String) -> LinkError) -> Self {
        Self::default().and_failing(op, error)
    }

    pub fn and_failing(self, op: &str, error: fn(String) -> LinkError) -> Self {
        self.fail_on.lock().unwrap().push((op.to_string(), error));
        self
    }

    pub fn stalling(op: &str, pause: Duration) -> Self {
        let links = Self::default();
        *links.stall_on.lock().unwrap() = Some((op.to_string(), pause));
        links
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, op: &str, detail: String) -> Result<(), LinkError> {
        self.calls.lock().unwrap().push(format!("{} {}", op, detail));
        let stall = self.stall_on.lock().unwrap().clone();
        if let Some((target, pause)) = stall
            && target == op
        {
            std::thread::sleep(pause);
        }
        let mut fail_on = self.fail_on.lock().unwrap();
        if let Some(i) = fail_on.iter().position(|(target, _)| target == op) {
            let (_, make) = fail_on.remove(i);
            return Err(make(detail));
        }
        Ok(())
    }
}

impl LinkControl for FakeLinks {
    fn link_exists(&self, name: &str) -> Result<bool, LinkError> {
        self.record("link_exists", name.to_string())?;
        Ok(self.existing.lock().unwrap().iter().any(|l| l == name))
    }
    fn create_veth(&self, host: &str, peer: &str) -> Result<(), LinkError> {
        self.record("create_veth", format!("{} {}", host, peer))
    }
    fn create_bridge(&self, name: &str) -> Result<(), LinkError> {
        self.record("create_bridge", name.to_string())?;
        self.existing.lock().unwrap().push(name.to_string());
        Ok(())
    }
    fn set_master(&self, link: &str, bridge: &str) -> Result<(), LinkError> {
        self.record("set_master", format!("{} {}", link, bridge))
    }
    fn set_up(&self, netns: Option<&str>, link: &str) -> Result<(), LinkError> {
        self.record("set_up", format!("{} {}", netns.unwrap_or("-"), link))
    }
    fn set_mac(&self, netns: &str, link: &str, mac: &str) -> Result<(), LinkError> {
        self.record("set_mac", format!("{} {} {}", netns, link, mac))
    }
    fn add_address(&self, netns: Option<&str>, link: &str, cidr: &str) -> Result<(), LinkError> {
        self.record("add_address", format!("{} {} {}", netns.unwrap_or("-"), link, cidr))
    }
    fn add_default_route(&self, netns: &str, gateway: Ipv4Addr) -> Result<(), LinkError> {
        self.record("add_default_route", format!("{} {}", netns, gateway))
    }
    fn create_netns(&self, name: &str) -> Result<(), LinkError> {
        self.record("create_netns", name.to_string())
    }
    fn move_to_netns(&self, link: &str, netns: &str) -> Result<(), LinkError> {
        self.record("move_to_netns", format!("{} {}", link, netns))
    }
    fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        self.record("delete_link", name.to_string())
    }
    fn delete_netns(&self, name: &str) -> Result<(), LinkError> {
        self.record("delete_netns", name.to_string())
    }
}
