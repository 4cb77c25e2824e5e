//! Per-actor authentication state.
//!
//! A [`Session`] owns the cookie jar and the anti-forgery (CSRF) token of one
//! logical actor. Clones share the same state, so every worker of a concurrent
//! batch reads the same auth snapshot.
//!
//! The token sits behind an `Arc<RwLock<>>`: workers take the read lock to
//! fetch the current token, and a worker that finds it missing or stale takes
//! the write lock to re-issue it. A generation counter, bumped on every
//! issuance, lets late writers notice that someone else already refreshed,
//! so a burst of workers hitting an expired token produces one `GET
//! /auth/csrf` instead of one per worker. A failed issuance is recorded
//! against its generation, and the workers queued behind it fail with the
//! same reason instead of retrying.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Method, Url};
use serde_json::json;
use tokio::sync::RwLock;

use crate::client::{endpoint_url, read_response, transport_error};
use crate::credential::Credential;
use crate::error::{HarnessError, Result};
use crate::types::{ApiResult, CsrfIssued};

/// Cookie set by a successful login.
pub const SESSION_COOKIE: &str = "access_token";
/// Cookie that must match the anti-forgery header.
pub const CSRF_COOKIE: &str = "csrf_token";
/// Header carrying the anti-forgery token on mutating calls.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

const LOGIN_PATH: &str = "/auth/login";
const CSRF_PATH: &str = "/auth/csrf";

/// Read-only view handed to workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub csrf_token: Option<String>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    account: Option<String>,
    csrf_token: Option<String>,
    /// Bumped every time an issuance completes, successful or not.
    generation: u64,
    /// Why the issuance that produced `generation` failed, if it did.
    last_failure: Option<String>,
}

#[derive(Clone)]
pub struct Session {
    base_url: Arc<str>,
    jar: Arc<Jar>,
    timeout: Duration,
    state: Arc<RwLock<SessionState>>,
}

impl Session {
    pub fn new(base_url: &str, jar: Arc<Jar>, timeout: Duration) -> Self {
        Self {
            base_url: Arc::from(base_url.trim_end_matches('/')),
            jar,
            timeout,
            state: Arc::new(RwLock::new(SessionState::default())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Account this session logged in as, if any.
    pub async fn account(&self) -> Option<String> {
        self.state.read().await.account.clone()
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        let state = self.state.read().await;
        AuthSnapshot {
            csrf_token: state.csrf_token.clone(),
            generation: state.generation,
        }
    }

    /// Values of every cookie named `name` that would be attached to a request for `url`.
    pub fn cookie_values(&self, url: &Url, name: &str) -> Vec<String> {
        let Some(header) = self.jar.cookies(url) else {
            return Vec::new();
        };
        let Ok(header) = header.to_str() else {
            return Vec::new();
        };
        header
            .split(';')
            .filter_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                (key == name).then(|| value.to_string())
            })
            .collect()
    }

    /// Authenticate. Fails unless the call is 2xx, reports success, and leaves a session cookie.
    pub async fn login(&self, http: &Client, credential: &Credential) -> Result<()> {
        let url = endpoint_url(&self.base_url, LOGIN_PATH)?;
        let started = Instant::now();
        let response = http
            .post(url.clone())
            .json(&json!({
                "account": credential.account,
                "password": credential.password,
            }))
            .send()
            .await
            .map_err(|e| transport_error(&Method::POST, LOGIN_PATH, self.timeout, e))?;
        let result = read_response(&Method::POST, LOGIN_PATH, self.timeout, response, started).await?;

        if !is_2xx(&result) || !result.success() {
            return Err(HarnessError::Auth(format!(
                "login failed for {}: {}",
                credential.account,
                result.summary()
            )));
        }
        if self.cookie_values(&url, SESSION_COOKIE).is_empty() {
            return Err(HarnessError::Auth(format!(
                "login succeeded but {} cookie missing, set-cookie={:?}",
                SESSION_COOKIE,
                result.header("set-cookie")
            )));
        }

        let mut state = self.state.write().await;
        state.account = Some(credential.account.clone());
        tracing::info!(account = %credential.account, "logged in");
        Ok(())
    }

    /// Unconditionally issue a new anti-forgery token.
    pub async fn refresh_anti_forgery(&self, http: &Client) -> Result<()> {
        let mut state = self.state.write().await;
        let token = self.issue_anti_forgery(http).await?;
        state.csrf_token = Some(token);
        state.last_failure = None;
        state.generation += 1;
        Ok(())
    }

    /// Return a token that is attached, as a cookie, to requests for `url`.
    ///
    /// Re-issues at most once; if the cookie is still not attached afterwards
    /// the call fails with [`HarnessError::Auth`].
    pub async fn ensure_anti_forgery(&self, http: &Client, url: &Url) -> Result<String> {
        let seen = self.snapshot().await;
        if let Some(token) = seen.csrf_token.as_deref()
            && self.token_attached(url, token)
        {
            return Ok(token.to_string());
        }

        self.refresh_if_stale(http, seen.generation).await?;

        let current = self.snapshot().await;
        match current.csrf_token {
            Some(token) if self.token_attached(url, &token) => Ok(token),
            _ => Err(HarnessError::Auth(format!(
                "{} cookie not attached to request for {}, cookie_header={:?}",
                CSRF_COOKIE,
                url,
                self.jar.cookies(url)
            ))),
        }
    }

    /// Single-flight refresh: only re-issue if nobody has done so since `seen_generation`.
    async fn refresh_if_stale(&self, http: &Client, seen_generation: u64) -> Result<()> {
        let mut state = self.state.write().await;

        // Double-check: another worker may have refreshed while we waited for the lock
        if state.generation != seen_generation {
            if let Some(reason) = &state.last_failure {
                return Err(HarnessError::Auth(format!(
                    "anti-forgery refresh failed in another worker: {}",
                    reason
                )));
            }
            if state.csrf_token.is_some() {
                tracing::debug!(
                    generation = state.generation,
                    "anti-forgery token already refreshed by another worker"
                );
                return Ok(());
            }
        }

        tracing::warn!(
            generation = state.generation,
            "anti-forgery token missing or stale, re-issuing"
        );
        let outcome = self.issue_anti_forgery(http).await;
        state.generation += 1;
        match outcome {
            Ok(token) => {
                state.csrf_token = Some(token);
                state.last_failure = None;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(generation = state.generation, error = %err, "anti-forgery issuance failed");
                state.last_failure = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// `GET /auth/csrf`; requires the token in the body and a matching cookie in the jar.
    async fn issue_anti_forgery(&self, http: &Client) -> Result<String> {
        let url = endpoint_url(&self.base_url, CSRF_PATH)?;
        let started = Instant::now();
        let response = http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(&Method::GET, CSRF_PATH, self.timeout, e))?;
        let result = read_response(&Method::GET, CSRF_PATH, self.timeout, response, started).await?;

        if !is_2xx(&result) || !result.success() {
            return Err(HarnessError::Auth(format!(
                "csrf issuance failed: {}",
                result.summary()
            )));
        }
        let token = result
            .decode_data::<CsrfIssued>("auth.csrf")
            .map(|issued| issued.csrf_token)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                HarnessError::Auth(format!("csrf token missing, data={}", result.data()))
            })?;

        let cookie_values = self.cookie_values(&url, CSRF_COOKIE);
        if cookie_values.is_empty() {
            return Err(HarnessError::Auth(format!(
                "{} cookie missing, set-cookie={:?}",
                CSRF_COOKIE,
                result.header("set-cookie")
            )));
        }
        if !cookie_values.contains(&token) {
            return Err(HarnessError::Auth(format!(
                "{} cookie mismatch, cookie_vals={:?}, header_token={}",
                CSRF_COOKIE, cookie_values, token
            )));
        }
        Ok(token)
    }

    fn token_attached(&self, url: &Url, token: &str) -> bool {
        self.cookie_values(url, CSRF_COOKIE)
            .iter()
            .any(|v| v == token)
    }
}

fn is_2xx(result: &ApiResult) -> bool {
    result.status.is_some_and(|s| (200..300).contains(&s))
}
