//! An in-memory registry speaking enough of the Distribution API to exercise
//! the client end to end: token auth, manifests, blobs with chunked uploads
//! and cross-repository mounts, tag listing, and a toggleable referrers API.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    body::Body,
    extract::{Request, State},
    response::Response,
    Router,
};
use ocireg::{Config, Host, TlsMode};
use sha2::{Digest as _, Sha256};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct RepoState {
    pub blobs: HashMap<String, Vec<u8>>,
    /// digest -> (bytes, media type)
    pub manifests: HashMap<String, (Vec<u8>, String)>,
    pub tags: HashMap<String, String>,
    /// subject digest -> referrer descriptors (native API storage)
    pub referrers: HashMap<String, Vec<serde_json::Value>>,
}

#[derive(Default)]
pub struct Counters {
    pub token_fetches: AtomicUsize,
    pub blob_gets: AtomicUsize,
    pub mounts: AtomicUsize,
    pub upload_posts: AtomicUsize,
    pub patches: AtomicUsize,
    pub blob_put_finalize: AtomicUsize,
    pub manifest_puts: AtomicUsize,
}

pub struct MockState {
    pub repos: Mutex<HashMap<String, RepoState>>,
    pub uploads: Mutex<HashMap<String, Vec<u8>>>,
    pub tokens: Mutex<HashMap<String, HashSet<String>>>,
    pub last_token_scopes: Mutex<Vec<String>>,
    pub auth_enabled: bool,
    pub referrers_api: bool,
    /// When set, the next PATCH keeps only half its bytes and answers 416.
    pub fail_next_patch: AtomicBool,
    pub counters: Counters,
}

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockRegistry {
    /// Starts a mock registry on an ephemeral port.
    pub async fn start(auth_enabled: bool, referrers_api: bool) -> Self {
        let state = Arc::new(MockState {
            repos: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            last_token_scopes: Mutex::new(Vec::new()),
            auth_enabled,
            referrers_api,
            fail_next_patch: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let app = Router::new()
            .fallback(handler)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    /// The registry name references use, e.g. `127.0.0.1:39231`.
    pub fn host_name(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// A client config with this registry set up for plain HTTP and fast
    /// retries.
    pub fn client_config(&self) -> Config {
        let mut config = Config::new();
        config.set_host(self.host(None));
        config
    }

    /// The host entry, optionally with a custom blob chunk size.
    pub fn host(&self, blob_chunk: Option<u64>) -> Host {
        let mut host = Host::new(self.host_name());
        host.tls = TlsMode::Disabled;
        host.delay_min_ms = 10;
        host.delay_max_ms = 50;
        host.retry_limit = 2;
        if let Some(chunk) = blob_chunk {
            host.blob_chunk = chunk;
        }
        host
    }

    pub fn blob(&self, repo: &str, digest: &str) -> Option<Vec<u8>> {
        self.state
            .repos
            .lock()
            .unwrap()
            .get(repo)
            .and_then(|r| r.blobs.get(digest))
            .cloned()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn sha256_hex(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hexpair = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hexpair.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn response(status: u16) -> axum::http::response::Builder {
    Response::builder().status(status)
}

fn json_response(status: u16, value: &serde_json::Value) -> Response {
    response(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(value).unwrap()))
        .unwrap()
}

async fn handler(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let path = uri.path().to_string();
    let query = parse_query(uri.query());
    let body = axum::body::to_bytes(req.into_body(), 1 << 30)
        .await
        .unwrap_or_default();

    // ---- token endpoint ----
    if path == "/token" {
        let scopes: Vec<String> = query
            .iter()
            .filter(|(k, _)| k == "scope")
            .map(|(_, v)| v.clone())
            .collect();
        let n = state.counters.token_fetches.fetch_add(1, Ordering::SeqCst);
        let token = format!("tok-{}", n);
        // Scope values are space-separated lists of individual scopes.
        state.tokens.lock().unwrap().insert(
            token.clone(),
            scopes
                .iter()
                .flat_map(|s| s.split(' '))
                .map(String::from)
                .collect(),
        );
        *state.last_token_scopes.lock().unwrap() = scopes;
        return json_response(
            200,
            &serde_json::json!({"token": token, "expires_in": 300}),
        );
    }

    if !path.starts_with("/v2") {
        return response(404).body(Body::empty()).unwrap();
    }

    // ---- route extraction ----
    let (repo, action) = split_api_path(&path);

    // ---- auth ----
    if state.auth_enabled {
        let needed = needed_scope(&repo, &method, &action, &query);
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| {
                let tokens = state.tokens.lock().unwrap();
                match tokens.get(token) {
                    Some(granted) => needed.iter().all(|s| granted.contains(s)),
                    None => false,
                }
            })
            .unwrap_or(false);
        if !authorized {
            let challenge = format!(
                "Bearer realm=\"http://{}/token\",service=\"mock-registry\",scope=\"{}\"",
                headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("127.0.0.1"),
                needed.join(" ")
            );
            return response(401)
                .header("WWW-Authenticate", challenge)
                .body(Body::empty())
                .unwrap();
        }
    }

    if path == "/v2/" || path == "/v2" {
        return response(200).body(Body::empty()).unwrap();
    }

    match action {
        Action::Manifests(reference) => {
            handle_manifest(&state, &repo, &reference, &method, &headers, &body)
        }
        Action::Blobs(digest) => handle_blob(&state, &repo, &digest, &method),
        Action::UploadStart => handle_upload_start(&state, &repo, &query),
        Action::Upload(uuid) => handle_upload(&state, &repo, &uuid, &method, &headers, &query, &body),
        Action::TagsList => {
            let repos = state.repos.lock().unwrap();
            let mut tags: Vec<String> = repos
                .get(&repo)
                .map(|r| r.tags.keys().cloned().collect())
                .unwrap_or_default();
            tags.sort();
            json_response(200, &serde_json::json!({"name": repo, "tags": tags}))
        }
        Action::Referrers(digest) => {
            if !state.referrers_api {
                return response(404).body(Body::empty()).unwrap();
            }
            let repos = state.repos.lock().unwrap();
            let manifests: Vec<serde_json::Value> = repos
                .get(&repo)
                .and_then(|r| r.referrers.get(&digest))
                .cloned()
                .unwrap_or_default();
            let index = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": manifests,
            });
            response(200)
                .header("Content-Type", "application/vnd.oci.image.index.v1+json")
                .body(Body::from(serde_json::to_vec(&index).unwrap()))
                .unwrap()
        }
        Action::Unknown => response(404).body(Body::empty()).unwrap(),
    }
}

enum Action {
    Manifests(String),
    Blobs(String),
    UploadStart,
    Upload(String),
    TagsList,
    Referrers(String),
    Unknown,
}

fn split_api_path(path: &str) -> (String, Action) {
    let rest = path.trim_start_matches("/v2/");
    if let Some(idx) = rest.find("/manifests/") {
        return (
            rest[..idx].to_string(),
            Action::Manifests(rest[idx + 11..].to_string()),
        );
    }
    if let Some(idx) = rest.find("/blobs/uploads/") {
        let repo = rest[..idx].to_string();
        let uuid = &rest[idx + 15..];
        if uuid.is_empty() {
            return (repo, Action::UploadStart);
        }
        return (repo, Action::Upload(uuid.to_string()));
    }
    if let Some(idx) = rest.find("/blobs/") {
        return (
            rest[..idx].to_string(),
            Action::Blobs(rest[idx + 7..].to_string()),
        );
    }
    if let Some(idx) = rest.find("/tags/list") {
        return (rest[..idx].to_string(), Action::TagsList);
    }
    if let Some(idx) = rest.find("/referrers/") {
        return (
            rest[..idx].to_string(),
            Action::Referrers(rest[idx + 11..].to_string()),
        );
    }
    (rest.to_string(), Action::Unknown)
}

fn needed_scope(
    repo: &str,
    method: &axum::http::Method,
    action: &Action,
    query: &[(String, String)],
) -> Vec<String> {
    if repo.is_empty() || matches!(action, Action::Unknown) {
        return Vec::new();
    }
    let mut scopes = Vec::new();
    let write = *method != axum::http::Method::GET && *method != axum::http::Method::HEAD;
    if write {
        scopes.push(format!("repository:{}:pull,push", repo));
        if let Some((_, from)) = query.iter().find(|(k, _)| k == "from") {
            scopes.push(format!("repository:{}:pull", from));
        }
    } else {
        scopes.push(format!("repository:{}:pull", repo));
    }
    scopes
}

fn handle_manifest(
    state: &MockState,
    repo: &str,
    reference: &str,
    method: &axum::http::Method,
    headers: &axum::http::HeaderMap,
    body: &[u8],
) -> Response {
    let mut repos = state.repos.lock().unwrap();
    match method.as_str() {
        "GET" | "HEAD" => {
            let repo_state = match repos.get(repo) {
                Some(r) => r,
                None => return response(404).body(Body::empty()).unwrap(),
            };
            let digest = if reference.starts_with("sha256:") {
                reference.to_string()
            } else {
                match repo_state.tags.get(reference) {
                    Some(d) => d.clone(),
                    None => return response(404).body(Body::empty()).unwrap(),
                }
            };
            let (bytes, media_type) = match repo_state.manifests.get(&digest) {
                Some(m) => m.clone(),
                None => return response(404).body(Body::empty()).unwrap(),
            };
            let builder = response(200)
                .header("Content-Type", media_type)
                .header("Docker-Content-Digest", digest)
                .header("Content-Length", bytes.len().to_string());
            if *method == axum::http::Method::HEAD {
                builder.body(Body::empty()).unwrap()
            } else {
                builder.body(Body::from(bytes)).unwrap()
            }
        }
        "PUT" => {
            state.counters.manifest_puts.fetch_add(1, Ordering::SeqCst);
            let digest = sha256_hex(body);
            let media_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/vnd.oci.image.manifest.v1+json")
                .to_string();
            let parsed: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
            let repo_state = repos.entry(repo.to_string()).or_default();
            repo_state
                .manifests
                .insert(digest.clone(), (body.to_vec(), media_type.clone()));
            if !reference.starts_with("sha256:") {
                repo_state
                    .tags
                    .insert(reference.to_string(), digest.clone());
            }

            let mut builder = response(201).header("Docker-Content-Digest", digest.clone());
            if state.referrers_api {
                if let Some(subject) = parsed.get("subject") {
                    let subject_digest = subject
                        .get("digest")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let descriptor = serde_json::json!({
                        "mediaType": media_type,
                        "digest": digest,
                        "size": body.len(),
                        "artifactType": parsed.get("artifactType").cloned()
                            .unwrap_or(serde_json::Value::Null),
                        "annotations": parsed.get("annotations").cloned()
                            .unwrap_or(serde_json::Value::Null),
                    });
                    let entries = repo_state
                        .referrers
                        .entry(subject_digest.clone())
                        .or_default();
                    if !entries.iter().any(|e| e.get("digest") == descriptor.get("digest")) {
                        entries.push(descriptor);
                    }
                    builder = builder.header("OCI-Subject", subject_digest);
                }
            }
            builder.body(Body::empty()).unwrap()
        }
        "DELETE" => {
            let repo_state = match repos.get_mut(repo) {
                Some(r) => r,
                None => return response(404).body(Body::empty()).unwrap(),
            };
            if repo_state.manifests.remove(reference).is_none() {
                return response(404).body(Body::empty()).unwrap();
            }
            repo_state.tags.retain(|_, d| d != reference);
            for entries in repo_state.referrers.values_mut() {
                entries.retain(|e| e.get("digest").and_then(|d| d.as_str()) != Some(reference));
            }
            response(202).body(Body::empty()).unwrap()
        }
        _ => response(405).body(Body::empty()).unwrap(),
    }
}

//--------------------------------------------------------------------------------------------------
// Blob and upload handlers
//--------------------------------------------------------------------------------------------------

fn handle_blob(state: &MockState, repo: &str, digest: &str, method: &axum::http::Method) -> Response {
    let repos = state.repos.lock().unwrap();
    let blob = repos.get(repo).and_then(|r| r.blobs.get(digest)).cloned();
    match (method.as_str(), blob) {
        ("HEAD", Some(bytes)) => response(200)
            .header("Content-Length", bytes.len().to_string())
            .header("Docker-Content-Digest", digest)
            .body(Body::empty())
            .unwrap(),
        ("GET", Some(bytes)) => {
            state.counters.blob_gets.fetch_add(1, Ordering::SeqCst);
            response(200)
                .header("Content-Length", bytes.len().to_string())
                .header("Docker-Content-Digest", digest)
                .body(Body::from(bytes))
                .unwrap()
        }
        _ => response(404).body(Body::empty()).unwrap(),
    }
}

fn handle_upload_start(state: &MockState, repo: &str, query: &[(String, String)]) -> Response {
    state.counters.upload_posts.fetch_add(1, Ordering::SeqCst);

    // Cross-repository mount
    if let Some((_, digest)) = query.iter().find(|(k, _)| k == "mount") {
        let from = query
            .iter()
            .find(|(k, _)| k == "from")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let mut repos = state.repos.lock().unwrap();
        let blob = repos.get(&from).and_then(|r| r.blobs.get(digest)).cloned();
        if let Some(bytes) = blob {
            state.counters.mounts.fetch_add(1, Ordering::SeqCst);
            repos
                .entry(repo.to_string())
                .or_default()
                .blobs
                .insert(digest.clone(), bytes);
            return response(201)
                .header("Docker-Content-Digest", digest.clone())
                .body(Body::empty())
                .unwrap();
        }
    }

    let uuid = format!("upload-{}", state.counters.upload_posts.load(Ordering::SeqCst));
    state
        .uploads
        .lock()
        .unwrap()
        .insert(uuid.clone(), Vec::new());
    response(202)
        .header("Location", format!("/v2/{}/blobs/uploads/{}", repo, uuid))
        .body(Body::empty())
        .unwrap()
}

fn handle_upload(
    state: &MockState,
    repo: &str,
    uuid: &str,
    method: &axum::http::Method,
    headers: &axum::http::HeaderMap,
    query: &[(String, String)],
    body: &[u8],
) -> Response {
    let location = format!("/v2/{}/blobs/uploads/{}", repo, uuid);
    match method.as_str() {
        "PATCH" => {
            state.counters.patches.fetch_add(1, Ordering::SeqCst);
            let mut uploads = state.uploads.lock().unwrap();
            let buffer = match uploads.get_mut(uuid) {
                Some(b) => b,
                None => return response(404).body(Body::empty()).unwrap(),
            };
            let start: u64 = headers
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split('-').next())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if start != buffer.len() as u64 {
                return response(416)
                    .header("Location", location)
                    .header("Range", format!("0-{}", buffer.len().saturating_sub(1)))
                    .body(Body::empty())
                    .unwrap();
            }
            if state.fail_next_patch.swap(false, Ordering::SeqCst) {
                // Keep half the chunk and report a range mismatch, forcing the
                // client to resume from the last accepted byte.
                buffer.extend_from_slice(&body[..body.len() / 2]);
                return response(416)
                    .header("Location", location)
                    .header("Range", format!("0-{}", buffer.len().saturating_sub(1)))
                    .body(Body::empty())
                    .unwrap();
            }
            buffer.extend_from_slice(body);
            response(202)
                .header("Location", location)
                .header("Range", format!("0-{}", buffer.len().saturating_sub(1)))
                .body(Body::empty())
                .unwrap()
        }
        "PUT" => {
            state.counters.blob_put_finalize.fetch_add(1, Ordering::SeqCst);
            let mut uploads = state.uploads.lock().unwrap();
            let mut buffer = uploads.remove(uuid).unwrap_or_default();
            buffer.extend_from_slice(body);
            let expected = match query.iter().find(|(k, _)| k == "digest") {
                Some((_, d)) => d.clone(),
                None => return response(400).body(Body::empty()).unwrap(),
            };
            if sha256_hex(&buffer) != expected {
                return response(400).body(Body::empty()).unwrap();
            }
            state
                .repos
                .lock()
                .unwrap()
                .entry(repo.to_string())
                .or_default()
                .blobs
                .insert(expected.clone(), buffer);
            response(201)
                .header("Docker-Content-Digest", expected)
                .body(Body::empty())
                .unwrap()
        }
        _ => response(405).body(Body::empty()).unwrap(),
    }
}
