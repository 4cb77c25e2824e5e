use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::cookie::Jar;
use reqwest::{Client, Method, Response, Url, header};
use serde_json::Value;

use crate::credential::Credential;
use crate::error::{HarnessError, Result};
use crate::session::{CSRF_HEADER, Session};
use crate::types::{ApiResult, Envelope, IdempotencyKey};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for ApiClient
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `http://127.0.0.1:8080/api/v1`
    pub base_url: String,
    /// Absolute deadline for one call, connect included
    pub timeout: Duration,
    /// Actor label used in log lines (`user`, `admin`)
    pub actor: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            actor: "client".to_string(),
        }
    }
}

/// One request as described by a scenario step.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    /// Exact bytes to send, e.g. a signed webhook payload.
    pub raw: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Attach the anti-forgery header on mutating methods.
    pub with_csrf: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            json: None,
            raw: None,
            headers: Vec::new(),
            idempotency_key: None,
            with_csrf: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn raw(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.raw = Some(body.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn idempotency_key(mut self, key: Option<&IdempotencyKey>) -> Self {
        self.idempotency_key = key.cloned();
        self
    }

    pub fn without_csrf(mut self) -> Self {
        self.with_csrf = false;
        self
    }

    fn needs_csrf(&self) -> bool {
        self.with_csrf
            && matches!(
                self.method,
                Method::POST | Method::PUT | Method::PATCH | Method::DELETE
            )
            && !self.path.starts_with("/auth/")
    }
}

/// HTTP client for one actor. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    session: Session,
    actor: Arc<str>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(ClientConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        })
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let jar = Arc::new(Jar::default());

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let http = Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(default_headers)
            .user_agent(concat!("idemcheck/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            session: Session::new(&config.base_url, jar, config.timeout),
            actor: Arc::from(config.actor.as_str()),
            timeout: config.timeout,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn login(&self, credential: &Credential) -> Result<()> {
        self.session.login(&self.http, credential).await
    }

    pub async fn refresh_anti_forgery(&self) -> Result<()> {
        self.session.refresh_anti_forgery(&self.http).await
    }

    /// Issue one request.
    ///
    /// Non-2xx responses are returned as ordinary results; only transport
    /// failures, timeouts, auth failures and malformed requests are errors.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResult> {
        if request.json.is_some() && request.raw.is_some() {
            return Err(HarnessError::InvalidRequest(format!(
                "{} {}: json and raw bodies are mutually exclusive",
                request.method, request.path
            )));
        }

        let url = endpoint_url(self.session.base_url(), &request.path)?;
        let csrf_token = if request.needs_csrf() {
            Some(self.session.ensure_anti_forgery(&self.http, &url).await?)
        } else {
            None
        };

        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = csrf_token {
            builder = builder.header(CSRF_HEADER, token);
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key.as_str());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        } else if let Some(raw) = &request.raw {
            builder = builder.body(raw.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&request.method, &request.path, self.timeout, e))?;
        let result = read_response(
            &request.method,
            &request.path,
            self.timeout,
            response,
            started,
        )
        .await?;

        tracing::debug!(
            actor = %self.actor,
            method = %request.method,
            path = %request.path,
            status = ?result.status,
            code = %result.code(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "api call"
        );
        Ok(result)
    }
}

/// Join the API root and a path, tolerating missing or doubled slashes.
pub(crate) fn endpoint_url(base_url: &str, path: &str) -> Result<Url> {
    let base = base_url.trim_end_matches('/');
    let url = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    Url::parse(&url).map_err(|e| HarnessError::Config(format!("invalid url {}: {}", url, e)))
}

pub(crate) fn transport_error(
    method: &Method,
    path: &str,
    timeout: Duration,
    err: reqwest::Error,
) -> HarnessError {
    if err.is_timeout() {
        HarnessError::Timeout {
            method: method.to_string(),
            path: path.to_string(),
            timeout,
        }
    } else {
        HarnessError::Transport {
            method: method.to_string(),
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Drain a response into an [`ApiResult`]. Decoding never fails; a broken body stream does.
pub(crate) async fn read_response(
    method: &Method,
    path: &str,
    timeout: Duration,
    response: Response,
    started: Instant,
) -> Result<ApiResult> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(method, path, timeout, e))?;

    Ok(ApiResult::new(
        status,
        Envelope::from_bytes(&body),
        headers,
        started.elapsed(),
    ))
}
