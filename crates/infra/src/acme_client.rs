use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use crate::auth::{AcmeAuthService, AuthError};
use crate::config::AppConfig;

type SharedResponse = Shared<BoxFuture<'static, Result<Value, AcmeClientError>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AcmeClientError {
    #[error("acme configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("acme transport error: {0}")]
    Transport(String),
    #[error("acme client error: status {status}: {message}")]
    Client {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("acme unauthorized: {message}")]
    Unauthorized {
        message: String,
        code: Option<String>,
    },
    #[error("acme upstream error: status {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("acme response decode error: {0}")]
    InvalidResponse(String),
}

impl AcmeClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AcmeClientError::Client { status, .. } | AcmeClientError::Upstream { status, .. } => {
                Some(*status)
            }
            AcmeClientError::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            AcmeClientError::Client { code, .. }
            | AcmeClientError::Unauthorized { code, .. }
            | AcmeClientError::Upstream { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// A 4xx other than 401 is a caller mistake and never worth repeating;
    /// everything else (transport, 5xx, a 401 that survived its inline
    /// refresh, an auth exchange failure) is transient as far as the retry
    /// loop is concerned.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AcmeClientError::Client { .. } | AcmeClientError::Configuration(_)
        )
    }
}

/// Per-call knobs for [`AcmeApiClient::request`]. Method defaults to GET;
/// only the retry budget is overridable per call, everything else comes
/// from [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub retry_attempts: Option<u32>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Some(Method::POST),
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    fn effective_method(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }

    fn cacheable(&self) -> bool {
        self.effective_method() == Method::GET
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub endpoint: String,
    pub options: RequestOptions,
}

impl BatchItem {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            options: RequestOptions::get(),
        }
    }

    pub fn new(endpoint: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
        }
    }
}

/// Outcome of one batch member; failures are captured here instead of
/// aborting the rest of the batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Success(Value),
    Failure(AcmeClientError),
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success(_))
    }

    pub fn into_result(self) -> Result<Value, AcmeClientError> {
        match self {
            BatchOutcome::Success(data) => Ok(data),
            BatchOutcome::Failure(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    expires_at: Instant,
}

/// Authenticated client for the Acme CRM API.
///
/// Wraps every outbound call with a short-lived GET cache, deduplication of
/// concurrent identical requests, a bounded timeout, retry with exponential
/// backoff, and a one-shot token renewal on 401. Cheap to clone; clones
/// share the cache, the pending-request table and the token state.
#[derive(Clone)]
pub struct AcmeApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: AcmeAuthService,
    retry_attempts: u32,
    retry_delay: Duration,
    cache_ttl: Duration,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    pending: Arc<Mutex<HashMap<String, SharedResponse>>>,
}

impl AcmeApiClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let timeout = Duration::from_millis(config.acme_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: config.acme_base_url.trim_end_matches('/').to_string(),
            auth: AcmeAuthService::from_config(config),
            retry_attempts: config.acme_retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.acme_retry_delay_ms),
            cache_ttl: Duration::from_millis(config.acme_cache_ttl_ms.max(1)),
            cache: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn auth(&self) -> &AcmeAuthService {
        &self.auth
    }

    /// Issues one request against the API.
    ///
    /// GETs are served from cache while their entry is fresh. Identical
    /// concurrent requests (any method) collapse into a single network
    /// call whose outcome every caller observes.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, AcmeClientError> {
        let key = request_key(endpoint, &options);
        let cacheable = options.cacheable();

        if cacheable {
            if let Some(data) = self.get_from_cache(&key).await {
                tracing::debug!(endpoint, "acme cache hit");
                return Ok(data);
            }
        }

        let response = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key).cloned() {
                Some(in_flight) => {
                    tracing::debug!(endpoint, "joining in-flight acme request");
                    in_flight
                }
                None => {
                    let in_flight =
                        self.spawn_request(key.clone(), endpoint.to_string(), options, cacheable);
                    pending.insert(key, in_flight.clone());
                    in_flight
                }
            }
        };

        response.await
    }

    /// Runs the items concurrently with retries disabled, so one slow
    /// member cannot stretch the whole batch through backoff. Failures are
    /// isolated per item; the result keeps the input order.
    pub async fn batch_request(&self, requests: Vec<BatchItem>) -> Vec<BatchOutcome> {
        tracing::debug!(count = requests.len(), "dispatching acme batch");
        let calls = requests.into_iter().map(|item| {
            let client = self.clone();
            async move {
                client
                    .request(&item.endpoint, item.options.with_retry_attempts(1))
                    .await
            }
        });

        join_all(calls)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(data) => BatchOutcome::Success(data),
                Err(err) => {
                    tracing::warn!(index, error = %err, "acme batch item failed");
                    BatchOutcome::Failure(err)
                }
            })
            .collect()
    }

    /// Drops every cache entry, or with a pattern only the entries whose
    /// key contains it as a substring.
    pub async fn clear_cache(&self, pattern: Option<&str>) {
        let mut cache = self.cache.write().await;
        match pattern {
            Some(pattern) => cache.retain(|key, _| !key.contains(pattern)),
            None => cache.clear(),
        }
    }

    fn spawn_request(
        &self,
        key: String,
        endpoint: String,
        options: RequestOptions,
        cacheable: bool,
    ) -> SharedResponse {
        let client = self.clone();
        let task = tokio::spawn(async move {
            let result = client.execute_request(&endpoint, &options).await;
            if cacheable {
                if let Ok(data) = &result {
                    client.save_to_cache(&key, data.clone()).await;
                }
            }
            // the pending entry must come out on every path, or the key
            // would be stuck joining a finished future forever
            client.pending.lock().await.remove(&key);
            result
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(AcmeClientError::Transport(format!(
                    "request task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    async fn execute_request(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Value, AcmeClientError> {
        let attempts = options.retry_attempts.unwrap_or(self.retry_attempts).max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.make_authenticated_request(endpoint, options).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt < attempts {
                        let delay = backoff_for_attempt(self.retry_delay, attempt);
                        tracing::warn!(
                            endpoint,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "acme request failed; retrying"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AcmeClientError::Transport("retry loop exited unexpectedly".into())))
    }

    async fn make_authenticated_request(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Value, AcmeClientError> {
        let token = self.auth.get_valid_token().await?;
        let response = self.send(endpoint, options, &token).await?;

        let status = response.status();
        if status.is_success() {
            return decode_json(response).await;
        }

        if status == StatusCode::UNAUTHORIZED {
            tracing::info!(endpoint, "acme access token rejected; forcing renewal");
            let new_token = self.auth.force_refresh().await?;
            let retry = self.send(endpoint, options, &new_token).await?;
            if retry.status().is_success() {
                return decode_json(retry).await;
            }
            return Err(error_from_response(retry).await);
        }

        Err(error_from_response(response).await)
    }

    async fn send(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        token: &str,
    ) -> Result<reqwest::Response, AcmeClientError> {
        let url = endpoint_url(&self.base_url, endpoint);

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                AcmeClientError::Configuration(format!("invalid header name {name:?}: {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                AcmeClientError::Configuration(format!("invalid header value: {err}"))
            })?;
            headers.insert(name, value);
        }
        // inserted after the caller's headers: the bearer token wins over a
        // caller-supplied Authorization
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
            AcmeClientError::Configuration(format!("invalid access token: {err}"))
        })?;
        headers.insert(AUTHORIZATION, bearer);

        let mut request = self
            .http
            .request(options.effective_method(), &url)
            .headers(headers);
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .map_err(|err| AcmeClientError::Transport(err.to_string()))
    }

    async fn get_from_cache(&self, key: &str) -> Option<Value> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(entry) if Instant::now() < entry.expires_at => {
                    return Some(entry.data.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // expired: evict lazily, re-checking under the write lock
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(key) {
            if Instant::now() >= entry.expires_at {
                cache.remove(key);
            }
        }
        None
    }

    async fn save_to_cache(&self, key: &str, data: Value) {
        let entry = CacheEntry {
            data,
            expires_at: Instant::now() + self.cache_ttl,
        };
        self.cache.write().await.insert(key.to_string(), entry);
    }
}

async fn decode_json(response: reqwest::Response) -> Result<Value, AcmeClientError> {
    response
        .json::<Value>()
        .await
        .map_err(|err| AcmeClientError::InvalidResponse(err.to_string()))
}

async fn error_from_response(response: reqwest::Response) -> AcmeClientError {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    let code = body
        .get("code")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    if status == StatusCode::UNAUTHORIZED {
        AcmeClientError::Unauthorized { message, code }
    } else if status.is_client_error() {
        AcmeClientError::Client {
            status: status.as_u16(),
            message,
            code,
        }
    } else {
        AcmeClientError::Upstream {
            status: status.as_u16(),
            message,
            code,
        }
    }
}

/// Join point for both the response cache and request deduplication.
fn request_key(endpoint: &str, options: &RequestOptions) -> String {
    let method = options.effective_method();
    let body = options
        .body
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    format!("{method}:{endpoint}:{body}")
}

fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let multiplier = 1u64 << attempt.saturating_sub(1).min(8);
    Duration::from_millis((base.as_millis() as u64).saturating_mul(multiplier))
}
