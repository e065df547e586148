use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::AppConfig;

type SharedTokenFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("acme auth transport error: {0}")]
    Transport(String),
    #[error("acme auth rejected: status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("acme auth response invalid: {0}")]
    InvalidResponse(String),
}

/// Access/refresh token pair plus the single-flight renewal marker.
///
/// The whole struct is reset as a unit when a credential exchange fails,
/// so `access_token` and `access_expires_at` are always both set or both
/// absent.
#[derive(Default)]
struct TokenState {
    access_token: Option<String>,
    access_expires_at: Option<Instant>,
    refresh_token: Option<String>,
    refresh_expires_at: Option<Instant>,
    in_flight: Option<SharedTokenFuture>,
}

impl TokenState {
    fn token_if_valid(&self, buffer: Duration, now: Instant) -> Option<String> {
        let token = self.access_token.as_ref()?;
        let expires_at = self.access_expires_at?;
        if now + buffer < expires_at {
            Some(token.clone())
        } else {
            None
        }
    }

    fn usable_refresh_token(&self, now: Instant) -> Option<String> {
        let token = self.refresh_token.as_ref()?;
        let expires_at = self.refresh_expires_at?;
        if now < expires_at {
            Some(token.clone())
        } else {
            None
        }
    }

    fn clear(&mut self) {
        *self = TokenState::default();
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    access_token_expires_in: Option<u64>,
    refresh_token: Option<String>,
    refresh_token_expires_in: Option<u64>,
}

/// Owns the credential exchange against the Acme auth endpoint and the
/// lifecycle of the resulting tokens. Tokens are renewed before they
/// actually expire (`acme_refresh_buffer_seconds` ahead), and concurrent
/// callers of [`get_valid_token`](Self::get_valid_token) share one renewal.
#[derive(Clone)]
pub struct AcmeAuthService {
    http: reqwest::Client,
    auth_url: String,
    access_key: String,
    secret_key: String,
    refresh_buffer: Duration,
    state: Arc<Mutex<TokenState>>,
}

impl AcmeAuthService {
    pub fn from_config(config: &AppConfig) -> Self {
        let timeout = Duration::from_millis(config.acme_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            auth_url: config.acme_auth_url.trim_end_matches('/').to_string(),
            access_key: config.acme_access_key.clone(),
            secret_key: config.acme_secret_key.clone(),
            refresh_buffer: Duration::from_secs(config.acme_refresh_buffer_seconds),
            state: Arc::new(Mutex::new(TokenState::default())),
        }
    }

    /// True while the cached access token has more than the refresh buffer
    /// left before expiry. A token inside the buffer window counts as
    /// invalid so it is renewed before a request can race its expiry.
    pub async fn is_token_valid(&self) -> bool {
        let state = self.state.lock().await;
        state
            .token_if_valid(self.refresh_buffer, Instant::now())
            .is_some()
    }

    /// Returns the cached access token, or renews it. At most one renewal
    /// is in flight at a time; every concurrent caller awaits that same
    /// renewal and observes the same token or the same error.
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        let renewal = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.token_if_valid(self.refresh_buffer, Instant::now()) {
                return Ok(token);
            }
            match state.in_flight.clone() {
                Some(in_flight) => in_flight,
                None => {
                    let renewal = self.spawn_renewal();
                    state.in_flight = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    /// Drops whatever is cached and performs a fresh credential exchange,
    /// returning the new access token.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        self.state.lock().await.clear();
        self.get_valid_token().await
    }

    fn spawn_renewal(&self) -> SharedTokenFuture {
        let service = self.clone();
        let task = tokio::spawn(async move {
            let result = service.renew().await;
            // in-flight marker comes off whether the exchange succeeded or not
            service.state.lock().await.in_flight = None;
            result
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(AuthError::Transport(format!("renewal task failed: {err}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// Refresh with the stored refresh token when one is usable, otherwise
    /// (or when the refresh endpoint misbehaves in any way) fall back to a
    /// full credential exchange. Refresh is strictly best-effort.
    async fn renew(&self) -> Result<String, AuthError> {
        let refresh_token = {
            let state = self.state.lock().await;
            state.usable_refresh_token(Instant::now())
        };

        if let Some(refresh_token) = refresh_token {
            match self.refresh_token(&refresh_token).await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    tracing::warn!(error = %err, "acme token refresh failed; re-authenticating");
                }
            }
        }

        self.authenticate().await
    }

    /// Exchanges the configured credentials for a token pair. Any failure
    /// resets the token state before the error propagates.
    pub async fn authenticate(&self) -> Result<String, AuthError> {
        match self.exchange_credentials().await {
            Ok(token) => Ok(token),
            Err(err) => {
                tracing::error!(error = %err, "acme authentication failed");
                self.state.lock().await.clear();
                Err(err)
            }
        }
    }

    async fn exchange_credentials(&self) -> Result<String, AuthError> {
        tracing::debug!("authenticating with acme api");
        let response = self
            .http
            .post(&self.auth_url)
            .json(&json!({
                "access_key": self.access_key,
                "secret_key": self.secret_key,
            }))
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("authentication rejected")
                .to_string();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        let access_token = body
            .access_token
            .ok_or_else(|| AuthError::InvalidResponse("missing access_token".to_string()))?;

        let expires_in = body.access_token_expires_in.unwrap_or(0);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.access_token = Some(access_token.clone());
        state.access_expires_at = Some(now + Duration::from_secs(expires_in));
        state.refresh_token = body.refresh_token;
        state.refresh_expires_at = body
            .refresh_token_expires_in
            .map(|seconds| now + Duration::from_secs(seconds));
        drop(state);

        tracing::info!(expires_in_seconds = expires_in, "acme authentication succeeded");
        Ok(access_token)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<String, AuthError> {
        let url = format!("{}/refresh", self.auth_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("refresh rejected")
                .to_string();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        let access_token = body
            .access_token
            .ok_or_else(|| AuthError::InvalidResponse("missing access_token".to_string()))?;

        // refresh only rotates the access token; the refresh pair stays
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.access_token = Some(access_token.clone());
        state.access_expires_at = Some(
            now + Duration::from_secs(body.access_token_expires_in.unwrap_or(0)),
        );
        Ok(access_token)
    }
}
