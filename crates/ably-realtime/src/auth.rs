//! Credentials, token requests and token renewal.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::Error;
use crate::options::{AuthMethod, ClientOptions};
use crate::protocol::{ErrorInfo, error_code};
use crate::types::{AuthCallback, TokenDetails, TokenParams, TokenRequest, TokenSource};

type HmacSha256 = Hmac<Sha256>;

/// A token is treated as expired this long before its real expiry.
pub const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(10);
pub(crate) const PROTOCOL_VERSION: &str = "2";
const DEFAULT_CAPABILITY: &str = r#"{"*":["*"]}"#;
const NONCE_LEN: usize = 16;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sign a token request with the key secret.
///
/// The MAC covers `keyName\nttl\ncapability\nclientId\ntimestamp\nnonce\n`;
/// unset optional fields contribute an empty line.
pub fn sign_token_request(
    key_name: &str,
    key_secret: &str,
    ttl: Option<i64>,
    capability: &str,
    client_id: Option<&str>,
    timestamp: i64,
    nonce: &str,
) -> Result<TokenRequest, Error> {
    if key_name.is_empty() || key_secret.is_empty() {
        return Err(Error::TokenRequestFailed(ErrorInfo::new(
            error_code::INVALID_CREDENTIALS,
            Some(401),
            "a key name and secret are required to sign a token request",
        )));
    }
    let ttl_text = ttl.map(|t| t.to_string()).unwrap_or_default();
    let client_text = client_id.unwrap_or_default();
    let sign_text =
        format!("{key_name}\n{ttl_text}\n{capability}\n{client_text}\n{timestamp}\n{nonce}\n");

    let mut mac = HmacSha256::new_from_slice(key_secret.as_bytes()).map_err(|e| {
        Error::TokenRequestFailed(ErrorInfo::new(
            error_code::INVALID_CREDENTIALS,
            Some(401),
            format!("HMAC error: {e}"),
        ))
    })?;
    mac.update(sign_text.as_bytes());

    Ok(TokenRequest {
        key_name: key_name.to_string(),
        timestamp,
        nonce: nonce.to_string(),
        mac: BASE64.encode(mac.finalize().into_bytes()),
        capability: capability.to_string(),
        ttl,
        client_id: client_id.map(str::to_string),
    })
}

/// Random alphanumeric string, used for nonces and ping ids.
pub(crate) fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Credentials and token state for one client.
///
/// Basic auth sends the API key itself and is only allowed over TLS. Token
/// auth is used whenever a token, auth callback or auth URL is configured, or
/// when `use_token_auth` is set.
#[derive(Clone)]
pub struct Auth {
    key_name: Option<String>,
    key_secret: Option<String>,
    callback: Option<AuthCallback>,
    auth_url: Option<String>,
    auth_method: AuthMethod,
    auth_headers: HashMap<String, String>,
    auth_params: HashMap<String, String>,
    token_auth: bool,
    default_token_params: TokenParams,
    client_id: Option<String>,
    token: Option<TokenDetails>,
    http: reqwest::Client,
    rest_base: String,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("key_name", &self.key_name)
            .field("token_auth", &self.token_auth)
            .field("client_id", &self.client_id)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl Auth {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let (key_name, key_secret) = match options.key.as_deref().and_then(|k| k.split_once(':')) {
            Some((name, secret)) => (Some(name.to_string()), Some(secret.to_string())),
            None => (None, None),
        };
        let token_auth = options.use_token_auth
            || key_name.is_none()
            || options.token_details.is_some()
            || options.auth_callback.is_some()
            || options.auth_url.is_some();
        Auth {
            key_name,
            key_secret,
            callback: options.auth_callback.clone(),
            auth_url: options.auth_url.clone(),
            auth_method: options.auth_method,
            auth_headers: options.auth_headers.clone(),
            auth_params: options.auth_params.clone(),
            token_auth,
            default_token_params: options.default_token_params.clone(),
            client_id: options.client_id.clone(),
            token: options.token_details.clone(),
            http: reqwest::Client::new(),
            rest_base: options.rest_base_url(),
        }
    }

    pub fn uses_token_auth(&self) -> bool {
        self.token_auth
    }

    /// The client id from the options, or else from the current token.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .or_else(|| self.token.as_ref().and_then(|t| t.client_id.as_deref()))
    }

    pub fn token_details(&self) -> Option<&TokenDetails> {
        self.token.as_ref()
    }

    /// `true` when a new token can be obtained without user intervention.
    pub fn is_renewable(&self) -> bool {
        self.key_secret.is_some() || self.callback.is_some() || self.auth_url.is_some()
    }

    fn valid_token(&self) -> Option<&TokenDetails> {
        let buffer = i64::try_from(TOKEN_EXPIRY_BUFFER.as_millis()).unwrap_or(i64::MAX);
        self.token
            .as_ref()
            .filter(|t| !t.is_expired(now_ms(), buffer))
    }

    fn insecure_basic_auth() -> Error {
        Error::InsecureRequest(ErrorInfo::new(
            error_code::INSECURE_REQUEST,
            Some(401),
            "basic authentication requires a TLS connection",
        ))
    }

    /// Query parameters that authenticate a realtime connection.
    ///
    /// `Ok(None)` means token auth is in effect but no valid token is cached;
    /// the caller must obtain one with [`Auth::request_token`] first.
    pub fn auth_params(&self, tls: bool) -> Result<Option<Vec<(String, String)>>, Error> {
        if !self.token_auth {
            if !tls {
                return Err(Self::insecure_basic_auth());
            }
            let (Some(name), Some(secret)) = (&self.key_name, &self.key_secret) else {
                return Err(Error::configuration(error_code::NO_CREDENTIALS, "no key configured"));
            };
            return Ok(Some(vec![("key".to_string(), format!("{name}:{secret}"))]));
        }
        Ok(self
            .valid_token()
            .map(|t| vec![("access_token".to_string(), t.token.clone())]))
    }

    /// `Authorization` header value, with the same `None` convention as
    /// [`Auth::auth_params`].
    pub fn auth_header(&self, tls: bool) -> Result<Option<String>, Error> {
        if !self.token_auth {
            if !tls {
                return Err(Self::insecure_basic_auth());
            }
            let (Some(name), Some(secret)) = (&self.key_name, &self.key_secret) else {
                return Err(Error::configuration(error_code::NO_CREDENTIALS, "no key configured"));
            };
            return Ok(Some(format!("Basic {}", BASE64.encode(format!("{name}:{secret}")))));
        }
        Ok(self
            .valid_token()
            .map(|t| format!("Bearer {}", BASE64.encode(&t.token))))
    }

    pub(crate) fn set_token(&mut self, token: TokenDetails) {
        self.token = Some(token);
    }

    pub(crate) fn clear_token(&mut self) {
        self.token = None;
    }

    /// Build and sign a token request with the configured key.
    pub fn create_token_request(&self, params: Option<&TokenParams>) -> Result<TokenRequest, Error> {
        let (Some(name), Some(secret)) = (&self.key_name, &self.key_secret) else {
            return Err(Error::TokenRequestFailed(ErrorInfo::new(
                error_code::INVALID_CREDENTIALS,
                Some(401),
                "no key configured: cannot sign a token request",
            )));
        };
        let params = self.merged_params(params);
        let nonce = params.nonce.clone().unwrap_or_else(|| random_string(NONCE_LEN));
        sign_token_request(
            name,
            secret,
            params.ttl,
            params.capability.as_deref().unwrap_or(DEFAULT_CAPABILITY),
            params.client_id.as_deref(),
            params.timestamp.unwrap_or_else(now_ms),
            &nonce,
        )
    }

    fn merged_params(&self, params: Option<&TokenParams>) -> TokenParams {
        let mut merged = params
            .cloned()
            .unwrap_or_default()
            .or(&self.default_token_params);
        if merged.client_id.is_none() {
            merged.client_id = self.client_id.clone();
        }
        merged
    }

    /// Obtain a fresh token from the auth callback, the auth URL, or by
    /// signing a request with the key, in that order of preference.
    pub async fn request_token(&self, params: Option<&TokenParams>) -> Result<TokenDetails, Error> {
        let params = self.merged_params(params);
        let source = if let Some(callback) = &self.callback {
            callback(params.clone()).await.map_err(Error::TokenFetch)?
        } else if let Some(url) = &self.auth_url {
            self.fetch_auth_url(url, &params).await?
        } else if self.key_secret.is_some() {
            TokenSource::Request(self.create_token_request(Some(&params))?)
        } else {
            return Err(Error::TokenRequestFailed(ErrorInfo::new(
                error_code::NO_MEANS_TO_RENEW,
                Some(401),
                "no means to obtain a token: configure a key, auth callback or auth URL",
            )));
        };
        let details = match source {
            TokenSource::Request(request) => self.exchange_token(&request).await?,
            TokenSource::Details(details) => details,
            TokenSource::Token(token) => TokenDetails::from_token(token),
        };
        self.check_client_id(&details)?;
        tracing::debug!(expires = details.expires, "Obtained token");
        Ok(details)
    }

    fn check_client_id(&self, details: &TokenDetails) -> Result<(), Error> {
        match (&self.client_id, &details.client_id) {
            (Some(ours), Some(theirs)) if theirs != "*" && ours != theirs => {
                Err(Error::TokenRequestFailed(ErrorInfo::new(
                    error_code::INCOMPATIBLE_CREDENTIALS,
                    Some(401),
                    format!("token client id '{theirs}' does not match configured client id '{ours}'"),
                )))
            }
            _ => Ok(()),
        }
    }

    /// Exchange a TokenRequest for a TokenDetails via Ably's REST API.
    async fn exchange_token(&self, request: &TokenRequest) -> Result<TokenDetails, Error> {
        let url = format!("{}/keys/{}/requestToken", self.rest_base, request.key_name);
        let resp = self
            .http
            .post(&url)
            .header("X-Ably-Version", PROTOCOL_VERSION)
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TokenRequestFailed(error_from_body(
                &body,
                i32::from(status.as_u16()),
            )));
        }
        resp.json::<TokenDetails>().await.map_err(|e| {
            Error::InvalidResponseBody(ErrorInfo::new(
                error_code::AUTH_RESPONSE_INVALID,
                Some(401),
                format!("invalid token response: {e}"),
            ))
        })
    }

    async fn fetch_auth_url(&self, url: &str, params: &TokenParams) -> Result<TokenSource, Error> {
        let mut query: Vec<(String, String)> = self
            .auth_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.extend(token_params_pairs(params));

        let mut req = match self.auth_method {
            AuthMethod::Get => self.http.get(url).query(&query),
            AuthMethod::Post => self.http.post(url).form(&query),
        };
        for (name, value) in &self.auth_headers {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TokenRequestFailed(error_from_body(
                &body,
                i32::from(status.as_u16()),
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let value: serde_json::Value = resp.json().await?;
            return parse_token_json(value);
        }
        if content_type.starts_with("text/plain") || content_type.starts_with("application/jwt") {
            let token = resp.text().await?.trim().to_string();
            if token.is_empty() {
                return Err(invalid_body("auth_url returned an empty token"));
            }
            return Ok(TokenSource::Token(token));
        }
        Err(invalid_body(format!(
            "auth_url returned unsupported content type '{content_type}'"
        )))
    }
}

fn invalid_body(message: impl Into<String>) -> Error {
    Error::InvalidResponseBody(ErrorInfo::new(error_code::AUTH_RESPONSE_INVALID, Some(401), message))
}

/// A JSON token response is a TokenRequest when it carries a MAC, otherwise
/// TokenDetails. A JSON string is a bare token.
fn parse_token_json(value: serde_json::Value) -> Result<TokenSource, Error> {
    let is_request = value.get("mac").is_some() || value.get("keyName").is_some();
    match value {
        serde_json::Value::String(token) => Ok(TokenSource::Token(token)),
        serde_json::Value::Object(_) if is_request => serde_json::from_value(value)
            .map(TokenSource::Request)
            .map_err(|e| invalid_body(format!("invalid token request from auth_url: {e}"))),
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .map(TokenSource::Details)
            .map_err(|e| invalid_body(format!("invalid token details from auth_url: {e}"))),
        other => Err(invalid_body(format!("unexpected auth_url JSON body: {other}"))),
    }
}

fn token_params_pairs(params: &TokenParams) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(ttl) = params.ttl {
        pairs.push(("ttl".to_string(), ttl.to_string()));
    }
    if let Some(capability) = &params.capability {
        pairs.push(("capability".to_string(), capability.clone()));
    }
    if let Some(client_id) = &params.client_id {
        pairs.push(("clientId".to_string(), client_id.clone()));
    }
    if let Some(timestamp) = params.timestamp {
        pairs.push(("timestamp".to_string(), timestamp.to_string()));
    }
    if let Some(nonce) = &params.nonce {
        pairs.push(("nonce".to_string(), nonce.clone()));
    }
    pairs
}

fn error_from_body(body: &str, status: i32) -> ErrorInfo {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: ErrorInfo,
    }
    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => envelope.error,
        Err(_) => ErrorInfo::new(
            error_code::AUTH_RESPONSE_INVALID,
            Some(status),
            format!("token request failed with status {status}: {body}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use httpmock::prelude::*;

    use super::*;
    use crate::types::BoxError;

    fn signed(ttl: Option<i64>, cap: &str, client: Option<&str>, ts: i64, nonce: &str) -> String {
        sign_token_request("app.key", "secret", ttl, cap, client, ts, nonce)
            .unwrap()
            .mac
    }

    #[test]
    fn mac_is_deterministic() {
        let a = signed(Some(3_600_000), DEFAULT_CAPABILITY, Some("bob"), 1_700_000_000_000, "n1");
        let b = signed(Some(3_600_000), DEFAULT_CAPABILITY, Some("bob"), 1_700_000_000_000, "n1");
        assert_eq!(a, b);
    }

    #[test]
    fn mac_matches_reference_signature() {
        let text = "app.key\n3600000\n{\"*\":[\"*\"]}\nbob\n1700000000000\nn1\n";
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(text.as_bytes());
        let expected = BASE64.encode(mac.finalize().into_bytes());
        assert_eq!(
            signed(Some(3_600_000), DEFAULT_CAPABILITY, Some("bob"), 1_700_000_000_000, "n1"),
            expected
        );
    }

    #[test]
    fn every_field_changes_the_mac() {
        let base = signed(Some(1000), DEFAULT_CAPABILITY, Some("bob"), 1, "n1");
        let variants = [
            sign_token_request("app.other", "secret", Some(1000), DEFAULT_CAPABILITY, Some("bob"), 1, "n1")
                .unwrap()
                .mac,
            sign_token_request("app.key", "secret2", Some(1000), DEFAULT_CAPABILITY, Some("bob"), 1, "n1")
                .unwrap()
                .mac,
            signed(Some(1001), DEFAULT_CAPABILITY, Some("bob"), 1, "n1"),
            signed(Some(1000), r#"{"ch":["publish"]}"#, Some("bob"), 1, "n1"),
            signed(Some(1000), DEFAULT_CAPABILITY, Some("alice"), 1, "n1"),
            signed(Some(1000), DEFAULT_CAPABILITY, Some("bob"), 2, "n1"),
            signed(Some(1000), DEFAULT_CAPABILITY, Some("bob"), 1, "n2"),
        ];
        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn signing_requires_key() {
        let err = sign_token_request("", "secret", None, DEFAULT_CAPABILITY, None, 1, "n")
            .unwrap_err();
        assert!(matches!(err, Error::TokenRequestFailed(_)));

        let auth = Auth::new(&ClientOptions::with_token("tok"));
        let err = auth.create_token_request(None).unwrap_err();
        assert!(matches!(err, Error::TokenRequestFailed(_)));
    }

    #[test]
    fn create_token_request_uses_defaults() {
        let auth = Auth::new(&ClientOptions::with_key("app.key:secret").with_client_id("carol"));
        let req = auth.create_token_request(None).unwrap();
        assert_eq!(req.key_name, "app.key");
        assert_eq!(req.capability, DEFAULT_CAPABILITY);
        assert_eq!(req.client_id.as_deref(), Some("carol"));
        assert_eq!(req.nonce.len(), NONCE_LEN);
        assert!(req.nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn basic_auth_requires_tls() {
        let auth = Auth::new(&ClientOptions::with_key("app.key:secret"));
        assert!(!auth.uses_token_auth());
        let err = auth.auth_params(false).unwrap_err();
        assert!(matches!(err, Error::InsecureRequest(_)));
        assert_eq!(err.code(), error_code::INSECURE_REQUEST);
        assert!(auth.auth_header(false).is_err());

        let params = auth.auth_params(true).unwrap().unwrap();
        assert_eq!(params, vec![("key".to_string(), "app.key:secret".to_string())]);
        let header = auth.auth_header(true).unwrap().unwrap();
        assert!(header.starts_with("Basic "));
    }

    #[test]
    fn token_auth_works_without_tls() {
        let auth = Auth::new(&ClientOptions::with_token("tok"));
        assert!(auth.uses_token_auth());
        assert!(!auth.is_renewable());
        let params = auth.auth_params(false).unwrap().unwrap();
        assert_eq!(params, vec![("access_token".to_string(), "tok".to_string())]);
    }

    #[test]
    fn expired_token_needs_renewal() {
        let mut auth = Auth::new(&ClientOptions::with_key("app.key:secret").with_use_token_auth(true));
        assert!(auth.auth_params(true).unwrap().is_none());
        auth.set_token(TokenDetails {
            token: "soon".into(),
            expires: now_ms() + 5_000, // inside the expiry buffer
            ..Default::default()
        });
        assert!(auth.auth_params(true).unwrap().is_none());
        auth.set_token(TokenDetails {
            token: "later".into(),
            expires: now_ms() + 60_000,
            ..Default::default()
        });
        assert!(auth.auth_params(true).unwrap().is_some());
    }

    #[tokio::test]
    async fn request_token_accepts_every_callback_result() {
        for (source, expected) in [
            (TokenSource::Token("bare".into()), "bare"),
            (TokenSource::Details(TokenDetails::from_token("details")), "details"),
        ] {
            let options = ClientOptions::with_auth_callback(move |_params| {
                let source = source.clone();
                Box::pin(async move { Ok(source) })
            });
            let auth = Auth::new(&options);
            let details = auth.request_token(None).await.unwrap();
            assert_eq!(details.token, expected);
        }
    }

    #[tokio::test]
    async fn callback_failure_is_token_fetch_error() {
        let options = ClientOptions::with_auth_callback(|_| Box::pin(async { Err::<TokenSource, BoxError>("denied".into()) }));
        let err = Auth::new(&options).request_token(None).await.unwrap_err();
        assert!(matches!(err, Error::TokenFetch(_)));
    }

    #[tokio::test]
    async fn callback_receives_merged_params() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_cb = seen.clone();
        let options = ClientOptions::with_auth_callback(move |params| {
            *seen_cb.lock().unwrap() = Some(params);
            Box::pin(async { Ok(TokenSource::Token("t".into())) })
        })
        .with_client_id("dana")
        .with_default_token_params(TokenParams {
            ttl: Some(60_000),
            ..Default::default()
        });
        Auth::new(&options).request_token(None).await.unwrap();
        let params = seen.lock().unwrap().clone().unwrap();
        assert_eq!(params.ttl, Some(60_000));
        assert_eq!(params.client_id.as_deref(), Some("dana"));
    }

    #[tokio::test]
    async fn token_request_is_exchanged_over_rest() {
        let http = MockServer::start_async().await;
        let mock = http
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/keys/app.key/requestToken")
                    .header("X-Ably-Version", PROTOCOL_VERSION);
                then.status(201)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({"token": "exchanged", "expires": 1, "issued": 0}));
            })
            .await;
        let options = ClientOptions::with_key("app.key:secret")
            .with_use_token_auth(true)
            .with_rest_host(format!("127.0.0.1:{}", http.port()))
            .with_tls(false);
        let details = Auth::new(&options).request_token(None).await.unwrap();
        assert_eq!(details.token, "exchanged");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_exchange_carries_server_error() {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(POST).path("/keys/app.key/requestToken");
            then.status(401)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "error": {"code": 40101, "statusCode": 401, "message": "invalid credentials"}
                }));
        })
        .await;
        let options = ClientOptions::with_key("app.key:secret")
            .with_use_token_auth(true)
            .with_rest_host(format!("127.0.0.1:{}", http.port()))
            .with_tls(false);
        let err = Auth::new(&options).request_token(None).await.unwrap_err();
        assert!(matches!(err, Error::TokenRequestFailed(_)));
        assert_eq!(err.code(), error_code::INVALID_CREDENTIALS);
    }

    #[tokio::test]
    async fn auth_url_content_types() {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(GET).path("/json").query_param("clientId", "erin");
            then.status(200)
                .header("content-type", "application/json; charset=utf-8")
                .json_body(serde_json::json!({"token": "from-json", "expires": 0}));
        })
        .await;
        http.mock_async(|when, then| {
            when.method(POST).path("/text").header("x-custom", "1");
            then.status(200).header("content-type", "text/plain").body("from-text\n");
        })
        .await;
        http.mock_async(|when, then| {
            when.method(GET).path("/html");
            then.status(200).header("content-type", "text/html").body("<p>no</p>");
        })
        .await;

        let json = ClientOptions::with_auth_url(http.url("/json")).with_client_id("erin");
        let details = Auth::new(&json).request_token(None).await.unwrap();
        assert_eq!(details.token, "from-json");

        let text = ClientOptions::with_auth_url(http.url("/text"))
            .with_auth_method(AuthMethod::Post)
            .with_auth_header("x-custom", "1");
        let details = Auth::new(&text).request_token(None).await.unwrap();
        assert_eq!(details.token, "from-text");

        let html = ClientOptions::with_auth_url(http.url("/html"));
        let err = Auth::new(&html).request_token(None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponseBody(_)));
    }

    #[test]
    fn json_token_body_detection() {
        let request = parse_token_json(serde_json::json!({
            "keyName": "app.key", "timestamp": 1, "nonce": "n", "mac": "m", "capability": "{}"
        }))
        .unwrap();
        assert!(matches!(request, TokenSource::Request(_)));

        let details = parse_token_json(serde_json::json!({"token": "t"})).unwrap();
        assert!(matches!(details, TokenSource::Details(_)));

        assert!(parse_token_json(serde_json::json!(42)).is_err());
    }

    #[tokio::test]
    async fn mismatched_token_client_id_is_rejected() {
        let options = ClientOptions::with_auth_callback(|_| {
            Box::pin(async {
                Ok(TokenSource::Details(TokenDetails {
                    token: "t".into(),
                    client_id: Some("mallory".into()),
                    ..Default::default()
                }))
            })
        })
        .with_client_id("frank");
        let err = Auth::new(&options).request_token(None).await.unwrap_err();
        assert_eq!(err.code(), error_code::INCOMPATIBLE_CREDENTIALS);
    }
}
