//! HTTP request dispatch for the registry scheme: per-host clients with
//! transient retries, mirror ordering, challenge-driven authentication,
//! warning deduplication, and rate limit parsing.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Certificate, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::sync::Mutex;

use crate::{
    config::{Config, Host, TlsMode, DEFAULT_USER_AGENT},
    opctx::parse_warning_header,
    Auth, CredentialProvider, OciregError, OciregResult, OpCtx, RateLimit,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum attempts per host within one logical request: the initial try plus
/// one retry after a processed auth challenge.
const AUTH_ATTEMPTS: usize = 2;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request to a registry, addressed by registry name rather than URL so the
/// transport can fan out across mirrors.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,

    /// Path under the host's API root, e.g. `/v2/library/alpine/manifests/latest`.
    pub path: String,

    /// Query parameters.
    pub query: Vec<(String, String)>,

    /// Extra headers (`Accept`, `Content-Type`, `Content-Range`, ...).
    pub headers: Vec<(String, String)>,

    /// Request body. `Bytes` so transient retries can replay it.
    pub body: Option<Bytes>,

    /// Auth scopes required for the request, e.g. `repository:app:pull`.
    /// Cross-repository mounts need one per repository.
    pub scopes: Vec<String>,
}

/// A dispatched response plus the transport metadata callers care about.
pub struct TransportResponse {
    /// The underlying response, still streamable.
    pub response: reqwest::Response,

    /// The registry name the response came from (a mirror or the upstream).
    pub host_name: String,

    /// Rate limit headers parsed from the response.
    pub rate_limit: RateLimit,
}

/// The transport: per-host HTTP clients wrapped in retry middleware, plus the
/// auth state machine.
pub struct Transport {
    auth: Auth,
    user_agent: String,
    clients: Mutex<HashMap<String, ClientWithMiddleware>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TransportRequest {
    /// A GET request for a path.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A request with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            scopes: Vec::new(),
        }
    }

    /// Adds a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds an auth scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// True when the request only reads and may be served by a mirror.
    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

impl TransportResponse {
    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// A single header value as a string.
    pub fn header_str(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Reads the full response body.
    pub async fn bytes(self) -> OciregResult<Bytes> {
        Ok(self.response.bytes().await?)
    }
}

impl Transport {
    /// Creates a transport using `provider` for credentials.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            auth: Auth::new(provider, reqwest::Client::new()),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatches a request to `host`, trying mirrors first for reads.
    ///
    /// Transient failures (network errors, 5xx, 429) retry with exponential
    /// backoff inside the per-host middleware; a host that still fails is
    /// skipped in favor of the next candidate. A 401 is handed to the auth
    /// state machine and the request retried once per processed challenge.
    pub async fn request(
        &self,
        ctx: &OpCtx,
        config: &Config,
        host_name: &str,
        req: TransportRequest,
    ) -> OciregResult<TransportResponse> {
        let upstream = config.host(host_name);
        let candidates = order_candidates(config, &upstream, req.is_read());

        let mut last_err: Option<OciregError> = None;
        for host in &candidates {
            match self.request_host(ctx, host, &req).await {
                Ok(resp) => return Ok(resp),
                Err(err @ OciregError::Canceled) => return Err(err),
                Err(err) if host_advance(&err) => {
                    tracing::debug!(
                        "host {} failed ({}), trying next candidate",
                        host.name,
                        err
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(self.with_tls_hint(&upstream, err)),
            }
        }
        Err(self.with_tls_hint(
            &upstream,
            last_err.unwrap_or_else(|| OciregError::NetworkFatal("no hosts to try".into())),
        ))
    }

    /// One host: auth header injection, send with cancellation and deadline,
    /// challenge processing on 401.
    async fn request_host(
        &self,
        ctx: &OpCtx,
        host: &Host,
        req: &TransportRequest,
    ) -> OciregResult<TransportResponse> {
        for scope in &req.scopes {
            self.auth.add_scope(&host.name, scope).await?;
        }

        let client = self.client_for(host).await?;
        let url = format!("{}{}", host.api_root(), req.path);

        for attempt in 0..AUTH_ATTEMPTS {
            if ctx.is_canceled() {
                return Err(OciregError::Canceled);
            }

            let mut builder = client.request(req.method.clone(), &url);
            if !req.query.is_empty() {
                builder = builder.query(&req.query);
            }
            for (key, value) in &req.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(auth_header) = self.auth.update_request(&host.name).await? {
                builder = builder.header("Authorization", auth_header);
            }
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }

            let response = self.send(ctx, host, builder).await?;
            forward_warnings(ctx, response.headers());

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                let challenges: Vec<String> = response
                    .headers()
                    .get_all("www-authenticate")
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(str::to_string)
                    .collect();
                let changed = self.auth.handle_response(&host.name, &challenges).await?;
                if changed && attempt + 1 < AUTH_ATTEMPTS {
                    continue;
                }
                return Err(OciregError::HttpUnauthorized(url.clone()));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(OciregError::RateLimit(url.clone()));
            }
            if status.is_server_error() {
                return Err(OciregError::http_status(status.as_u16(), url.clone()));
            }

            let rate_limit = RateLimit::from_lookup(|name| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
            return Ok(TransportResponse {
                response,
                host_name: host.name.clone(),
                rate_limit,
            });
        }
        Err(OciregError::HttpUnauthorized(url))
    }

    /// Sends one request, bounded by the context deadline and the host
    /// timeout, unwinding promptly on cancellation.
    async fn send(
        &self,
        ctx: &OpCtx,
        host: &Host,
        builder: reqwest_middleware::RequestBuilder,
    ) -> OciregResult<reqwest::Response> {
        let timeout = match (ctx.remaining(), host.timeout_secs) {
            (Some(remaining), Some(secs)) => Some(remaining.min(Duration::from_secs(secs))),
            (Some(remaining), None) => Some(remaining),
            (None, Some(secs)) => Some(Duration::from_secs(secs)),
            (None, None) => None,
        };

        let send = async {
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, builder.send())
                    .await
                    .map_err(|_| {
                        OciregError::NetworkTransient(format!(
                            "request to {} timed out",
                            host.api_host()
                        ))
                    })?,
                None => builder.send().await,
            };
            result.map_err(map_middleware_error)
        };

        tokio::select! {
            _ = ctx.cancel_token().cancelled() => Err(OciregError::Canceled),
            result = send => result,
        }
    }

    /// The retry-wrapped client for a host, built on first use.
    async fn client_for(&self, host: &Host) -> OciregResult<ClientWithMiddleware> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&host.name) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.clone());
        if host.tls == TlsMode::Insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &host.reg_cert {
            builder = builder.add_root_certificate(Certificate::from_pem(pem.as_bytes())?);
        }
        if let (Some(cert), Some(key)) = (&host.client_cert, &host.client_key) {
            let identity =
                reqwest::Identity::from_pkcs8_pem(cert.as_bytes(), key.as_bytes())?;
            builder = builder.identity(identity);
        }
        let inner = builder.build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(
                Duration::from_millis(host.delay_min_ms),
                Duration::from_millis(host.delay_max_ms),
            )
            .build_with_max_retries(host.retry_limit);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        clients.insert(host.name.clone(), client.clone());
        Ok(client)
    }

    /// Adds the scheme-mismatch hint to final network failures on TLS hosts.
    fn with_tls_hint(&self, host: &Host, err: OciregError) -> OciregError {
        match err {
            OciregError::NetworkTransient(msg) if host.tls == TlsMode::Enabled => {
                OciregError::NetworkTransient(format!(
                    "{} (if {} only serves HTTP, set its tls mode to disabled)",
                    msg, host.name
                ))
            }
            err => err,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Candidate hosts for a request: mirrors ordered by descending priority,
/// then the upstream. Writes go to the upstream only.
fn order_candidates(config: &Config, upstream: &Host, is_read: bool) -> Vec<Host> {
    if !is_read || upstream.mirrors.is_empty() {
        return vec![upstream.clone()];
    }
    let mut mirrors: Vec<Host> = upstream
        .mirrors
        .iter()
        .map(|name| config.host(name))
        .collect();
    mirrors.sort_by(|a, b| b.priority.cmp(&a.priority));
    mirrors.push(upstream.clone());
    mirrors
}

/// True when the failure should advance to the next candidate host.
fn host_advance(err: &OciregError) -> bool {
    match err {
        OciregError::NetworkTransient(_) => true,
        OciregError::HttpStatus { status, .. } => (500..600).contains(&(*status as i32)),
        _ => false,
    }
}

/// Maps middleware send errors: middleware-level failures are retries already
/// exhausted, so they surface as transient network errors.
fn map_middleware_error(err: reqwest_middleware::Error) -> OciregError {
    match err {
        reqwest_middleware::Error::Reqwest(err) => {
            if err.is_builder() || err.is_request() {
                OciregError::NetworkFatal(err.to_string())
            } else {
                OciregError::NetworkTransient(err.to_string())
            }
        }
        reqwest_middleware::Error::Middleware(err) => OciregError::NetworkTransient(err.to_string()),
    }
}

/// Parses and forwards `Warning` headers, deduplicated by the context.
fn forward_warnings(ctx: &OpCtx, headers: &HeaderMap) {
    for value in headers.get_all("warning").iter() {
        if let Some(warning) = value.to_str().ok().and_then(parse_warning_header) {
            ctx.warn(warning);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
