//! Per-host registry authentication: `WWW-Authenticate` challenge parsing and
//! the Basic / Bearer / session-token state machines behind it.

use std::{collections::HashMap, sync::Arc};

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{OciregError, OciregResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Minimum token lifetime. Registries advertising less get clamped up.
const TOKEN_EXPIRE_MIN_SECS: i64 = 60;

/// Safety margin subtracted from a token's lifetime before reuse.
const TOKEN_EXPIRE_SKEW_SECS: i64 = 10;

/// The client id sent on token requests.
const TOKEN_CLIENT_ID: &str = "ocireg";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single authentication challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The challenge scheme, lowercased (`basic`, `bearer`, ...).
    pub scheme: String,

    /// The challenge parameters (`realm`, `service`, `scope`, ...).
    pub params: HashMap<String, String>,
}

/// A credential for one registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    /// Username for Basic auth or the password grant.
    pub user: Option<String>,

    /// Password or personal access token.
    pub password: Option<String>,

    /// A pre-issued session token, sent as a bearer value directly.
    pub token: Option<String>,
}

/// Supplies credentials for registry hosts. Lookup failures degrade to
/// anonymous access; they only become fatal when the registry insists on
/// authentication.
pub trait CredentialProvider: Send + Sync {
    /// The credential for `hostname`, or `None` for anonymous access.
    fn credential(&self, hostname: &str) -> Option<Credential>;
}

/// A fixed credential table, useful for tests and simple embedders.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    creds: HashMap<String, Credential>,
}

/// Authentication state for every host the client has spoken to.
pub struct Auth {
    provider: Arc<dyn CredentialProvider>,
    client: reqwest::Client,
    hosts: Mutex<HashMap<String, Arc<Mutex<HostAuth>>>>,
}

/// Per-host handler set, serialized behind a mutex so concurrent requests
/// coalesce on a single token fetch.
#[derive(Default)]
struct HostAuth {
    basic: Option<BasicHandler>,
    bearer: Option<BearerHandler>,
    session: Option<SessionHandler>,
}

struct BasicHandler {
    realm: String,
    cred: Credential,
}

struct BearerHandler {
    realm: String,
    service: String,
    scopes: Vec<String>,
    cred: Credential,
    token: Option<BearerToken>,
    refresh_token: Option<String>,
}

/// A pre-issued session token (the Docker Hub JWT flavor): emitted verbatim.
struct SessionHandler {
    token: String,
}

#[derive(Debug, Clone)]
struct BearerToken {
    token: String,
    issued_at: DateTime<Utc>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh_token: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StaticCredentials {
    /// Adds a credential for a host.
    pub fn insert(&mut self, hostname: impl Into<String>, cred: Credential) {
        self.creds.insert(hostname.into(), cred);
    }
}

impl Auth {
    /// Creates auth state backed by the given credential provider.
    pub fn new(provider: Arc<dyn CredentialProvider>, client: reqwest::Client) -> Self {
        Self {
            provider,
            client,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Processes the `WWW-Authenticate` headers of a 401 response. Returns
    /// true when auth state changed and the request is worth retrying; false
    /// means the challenge is unchanged and a valid header was already sent,
    /// so a retry would fail the same way.
    pub async fn handle_response(&self, host: &str, headers: &[String]) -> OciregResult<bool> {
        let mut challenges = Vec::new();
        for header in headers {
            challenges.extend(parse_challenges(header)?);
        }
        if challenges.is_empty() {
            return Err(OciregError::InvalidChallenge(format!(
                "401 from {} without a WWW-Authenticate challenge",
                host
            )));
        }

        let host_auth = self.host_auth(host).await;
        let mut state = host_auth.lock().await;
        let cred = self.provider.credential(host).unwrap_or_default();

        let mut changed = false;
        for challenge in challenges {
            match challenge.scheme.as_str() {
                "basic" => {
                    let realm = challenge.params.get("realm").cloned().unwrap_or_default();
                    if cred.user.is_none() || cred.password.is_none() {
                        if let Some(token) = &cred.token {
                            changed |= state.set_session(token.clone());
                            continue;
                        }
                        return Err(OciregError::NoLogin(host.to_string()));
                    }
                    changed |= state.set_basic(realm, cred.clone());
                }
                "bearer" => {
                    changed |= state.process_bearer(&challenge, cred.clone())?;
                }
                other => {
                    tracing::debug!("ignoring unsupported auth scheme {} from {}", other, host);
                }
            }
        }
        Ok(changed)
    }

    /// Produces the `Authorization` header value for a request to `host`,
    /// fetching or refreshing a token when needed. `None` when the host has
    /// never challenged us.
    pub async fn update_request(&self, host: &str) -> OciregResult<Option<String>> {
        let host_auth = self.host_auth(host).await;
        let mut state = host_auth.lock().await;

        if let Some(bearer) = &mut state.bearer {
            if !bearer.token_valid() {
                bearer.fetch_token(&self.client).await?;
            }
            let token = bearer
                .token
                .as_ref()
                .ok_or_else(|| OciregError::HttpUnauthorized(host.to_string()))?;
            return Ok(Some(format!("Bearer {}", token.token)));
        }
        if let Some(basic) = &state.basic {
            return Ok(Some(basic.header_value()));
        }
        if let Some(session) = &state.session {
            return Ok(Some(format!("Bearer {}", session.token)));
        }
        Ok(None)
    }

    /// Ensures `scope` is part of the next token request for `host`. Returns
    /// true when the scope was new (the cached token was cleared).
    pub async fn add_scope(&self, host: &str, scope: &str) -> OciregResult<bool> {
        let host_auth = self.host_auth(host).await;
        let mut state = host_auth.lock().await;
        match &mut state.bearer {
            Some(bearer) => Ok(bearer.add_scope(scope)),
            None => Ok(false),
        }
    }

    async fn host_auth(&self, host: &str) -> Arc<Mutex<HostAuth>> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostAuth::default())))
            .clone()
    }
}

impl HostAuth {
    fn set_basic(&mut self, realm: String, cred: Credential) -> bool {
        let unchanged = self
            .basic
            .as_ref()
            .is_some_and(|b| b.realm == realm && b.cred == cred);
        if unchanged {
            return false;
        }
        self.basic = Some(BasicHandler { realm, cred });
        true
    }

    fn set_session(&mut self, token: String) -> bool {
        let unchanged = self.session.as_ref().is_some_and(|s| s.token == token);
        if unchanged {
            return false;
        }
        self.session = Some(SessionHandler { token });
        true
    }

    fn process_bearer(&mut self, challenge: &Challenge, cred: Credential) -> OciregResult<bool> {
        let realm = challenge
            .params
            .get("realm")
            .cloned()
            .ok_or_else(|| OciregError::InvalidChallenge("bearer challenge without realm".into()))?;
        let service = challenge.params.get("service").cloned().unwrap_or_default();
        let scope = challenge.params.get("scope").cloned();

        let fresh = !self
            .bearer
            .as_ref()
            .is_some_and(|b| b.realm == realm && b.service == service);
        if fresh {
            self.bearer = Some(BearerHandler {
                realm,
                service,
                scopes: Vec::new(),
                cred,
                token: None,
                refresh_token: None,
            });
            let bearer = self.bearer.as_mut().expect("bearer handler just set");
            if let Some(scope) = scope {
                bearer.add_scope(&scope);
            }
            return Ok(true);
        }

        let bearer = self.bearer.as_mut().expect("bearer handler present");
        bearer.cred = cred;
        let mut changed = false;
        if let Some(scope) = scope {
            changed |= bearer.add_scope(&scope);
        }
        // An unchanged challenge with a still-fresh token means the registry
        // rejected a header we just minted: authentication has failed.
        if !changed && bearer.token_valid() {
            return Ok(false);
        }
        Ok(true)
    }
}

impl BasicHandler {
    fn header_value(&self) -> String {
        let pair = format!(
            "{}:{}",
            self.cred.user.as_deref().unwrap_or_default(),
            self.cred.password.as_deref().unwrap_or_default()
        );
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(pair)
        )
    }
}

impl BearerHandler {
    fn add_scope(&mut self, scope: &str) -> bool {
        if self.scopes.iter().any(|s| s == scope) {
            return false;
        }
        self.scopes.push(scope.to_string());
        self.token = None;
        true
    }

    fn token_valid(&self) -> bool {
        self.token.as_ref().is_some_and(|t| {
            t.issued_at + ChronoDuration::seconds(t.expires_in - TOKEN_EXPIRE_SKEW_SECS)
                > Utc::now()
        })
    }

    /// Requests a fresh token from the realm. Grants are tried in order:
    /// refresh token, password, anonymous/basic GET.
    async fn fetch_token(&mut self, client: &reqwest::Client) -> OciregResult<()> {
        let scope = self.scopes.join(" ");
        let response = if let Some(refresh) = &self.refresh_token {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
                ("client_id", TOKEN_CLIENT_ID),
                ("service", self.service.as_str()),
                ("scope", scope.as_str()),
            ];
            client.post(&self.realm).form(&form).send().await?
        } else if let (Some(user), Some(password)) = (&self.cred.user, &self.cred.password) {
            let form = [
                ("grant_type", "password"),
                ("username", user.as_str()),
                ("password", password.as_str()),
                ("client_id", TOKEN_CLIENT_ID),
                ("service", self.service.as_str()),
                ("scope", scope.as_str()),
            ];
            client.post(&self.realm).form(&form).send().await?
        } else {
            let mut query: Vec<(&str, &str)> = vec![("client_id", TOKEN_CLIENT_ID)];
            if !self.service.is_empty() {
                query.push(("service", self.service.as_str()));
            }
            for scope in &self.scopes {
                query.push(("scope", scope.as_str()));
            }
            let mut request = client.get(&self.realm).query(&query);
            if let Some(token) = &self.cred.token {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
            request.send().await?
        };

        if !response.status().is_success() {
            return Err(OciregError::HttpUnauthorized(format!(
                "token request to {} failed with status {}",
                self.realm,
                response.status()
            )));
        }

        let parsed: TokenResponse = response.json().await?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                OciregError::HttpUnauthorized(format!("token response from {} is empty", self.realm))
            })?;

        self.refresh_token = parsed.refresh_token.or(self.refresh_token.take());
        self.token = Some(BearerToken {
            token,
            issued_at: parsed.issued_at.unwrap_or_else(Utc::now),
            expires_in: parsed
                .expires_in
                .unwrap_or(TOKEN_EXPIRE_MIN_SECS)
                .max(TOKEN_EXPIRE_MIN_SECS),
        });
        tracing::debug!("fetched bearer token from {}", self.realm);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl CredentialProvider for StaticCredentials {
    fn credential(&self, hostname: &str) -> Option<Credential> {
        self.creds.get(hostname).cloned()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `WWW-Authenticate` header into its challenges.
///
/// Grammar: a scheme keyword followed by comma-separated `key=value` pairs,
/// values either bare tokens or quoted strings with `\` escapes. A header may
/// carry several challenges back to back.
pub fn parse_challenges(header: &str) -> OciregResult<Vec<Challenge>> {
    let mut challenges: Vec<Challenge> = Vec::new();
    let bytes = header.as_bytes();
    let mut i = 0;

    let err = |msg: &str| OciregError::InvalidChallenge(format!("{}: {}", msg, header));

    while i < bytes.len() {
        // Skip whitespace and separators between elements
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        // Read a token
        let start = i;
        while i < bytes.len() && is_token_char(bytes[i]) {
            i += 1;
        }
        if i == start {
            return Err(err("unexpected character"));
        }
        let token = &header[start..i];

        // A '=' makes it a parameter of the current challenge
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            let value = if i < bytes.len() && bytes[i] == b'"' {
                i += 1;
                let mut value = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(err("unterminated quoted value"));
                    }
                    match bytes[i] {
                        b'"' => {
                            i += 1;
                            break;
                        }
                        b'\\' if i + 1 < bytes.len() => {
                            value.push(bytes[i + 1] as char);
                            i += 2;
                        }
                        b => {
                            value.push(b as char);
                            i += 1;
                        }
                    }
                }
                value
            } else {
                let start = i;
                while i < bytes.len() && is_token_char(bytes[i]) {
                    i += 1;
                }
                header[start..i].to_string()
            };
            let current = challenges.last_mut().ok_or_else(|| err("parameter before scheme"))?;
            current.params.insert(token.to_ascii_lowercase(), value);
        } else {
            // A bare token starts a new challenge
            challenges.push(Challenge {
                scheme: token.to_ascii_lowercase(),
                params: HashMap::new(),
            });
        }
    }

    Ok(challenges)
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'+' | b'/' | b':')
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authn_parse_single_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:library/alpine:pull""#;
        let challenges = parse_challenges(header).unwrap();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme, "bearer");
        assert_eq!(
            challenges[0].params.get("realm").unwrap(),
            "https://auth.example.com/token"
        );
        assert_eq!(
            challenges[0].params.get("scope").unwrap(),
            "repository:library/alpine:pull"
        );
    }

    #[test]
    fn test_authn_parse_multiple_challenges_and_escapes() {
        let header = r#"Basic realm="si\"mple", Bearer realm=unquoted,service=svc"#;
        let challenges = parse_challenges(header).unwrap();
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "basic");
        assert_eq!(challenges[0].params.get("realm").unwrap(), "si\"mple");
        assert_eq!(challenges[1].scheme, "bearer");
        assert_eq!(challenges[1].params.get("realm").unwrap(), "unquoted");
        assert_eq!(challenges[1].params.get("service").unwrap(), "svc");
    }

    #[test]
    fn test_authn_parse_invalid_challenges() {
        assert!(parse_challenges(r#"Bearer realm="unterminated"#).is_err());
        assert!(parse_challenges("=orphan").is_err());
    }

    fn bearer_challenge(realm: &str, service: &str, scope: &str) -> Challenge {
        Challenge {
            scheme: "bearer".into(),
            params: HashMap::from([
                ("realm".to_string(), realm.to_string()),
                ("service".to_string(), service.to_string()),
                ("scope".to_string(), scope.to_string()),
            ]),
        }
    }

    #[test]
    fn test_authn_bearer_challenge_state_machine() {
        let mut state = HostAuth::default();
        let challenge = bearer_challenge("https://auth/token", "svc", "repository:app:pull");

        // First challenge always changes state
        assert!(state
            .process_bearer(&challenge, Credential::default())
            .unwrap());

        // Same challenge without a cached token still changes (a fetch is due)
        assert!(state
            .process_bearer(&challenge, Credential::default())
            .unwrap());

        // With a fresh token and an unchanged challenge, auth has failed
        state.bearer.as_mut().unwrap().token = Some(BearerToken {
            token: "t".into(),
            issued_at: Utc::now(),
            expires_in: 300,
        });
        assert!(!state
            .process_bearer(&challenge, Credential::default())
            .unwrap());

        // A new scope invalidates the token and changes state
        let push = bearer_challenge("https://auth/token", "svc", "repository:app:pull,push");
        assert!(state.process_bearer(&push, Credential::default()).unwrap());
        let bearer = state.bearer.as_ref().unwrap();
        assert!(bearer.token.is_none());
        assert_eq!(
            bearer.scopes,
            vec!["repository:app:pull", "repository:app:pull,push"]
        );

        // A different realm resets the handler
        let moved = bearer_challenge("https://other/token", "svc", "repository:app:pull");
        assert!(state.process_bearer(&moved, Credential::default()).unwrap());
        assert_eq!(state.bearer.as_ref().unwrap().scopes.len(), 1);
    }

    #[test]
    fn test_authn_bearer_token_expiry() {
        let mut bearer = BearerHandler {
            realm: "r".into(),
            service: "s".into(),
            scopes: vec![],
            cred: Credential::default(),
            token: None,
            refresh_token: None,
        };
        assert!(!bearer.token_valid());

        bearer.token = Some(BearerToken {
            token: "t".into(),
            issued_at: Utc::now(),
            expires_in: 300,
        });
        assert!(bearer.token_valid());

        bearer.token = Some(BearerToken {
            token: "t".into(),
            issued_at: Utc::now() - ChronoDuration::seconds(301),
            expires_in: 300,
        });
        assert!(!bearer.token_valid());
    }

    #[test]
    fn test_authn_token_response_parsing() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","expires_in":30,"issued_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(parsed.access_token.as_deref(), Some("abc"));
        // The clamp itself is applied at fetch time
        assert_eq!(parsed.expires_in, Some(30));

        let parsed: TokenResponse = serde_json::from_str(r#"{"token":"xyz"}"#).unwrap();
        assert_eq!(parsed.token.as_deref(), Some("xyz"));
        assert!(parsed.issued_at.is_none());
    }

    #[test]
    fn test_authn_basic_header_value() {
        let basic = BasicHandler {
            realm: "r".into(),
            cred: Credential {
                user: Some("user".into()),
                password: Some("pass".into()),
                token: None,
            },
        };
        assert_eq!(basic.header_value(), "Basic dXNlcjpwYXNz");
    }
}
