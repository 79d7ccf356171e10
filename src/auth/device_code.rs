//! OAuth2 device authorization grant against Azure AD
//!
//! Polling is driven by hand rather than through the oauth2 crate because
//! the backoff rules differ: `slow_down` adds one second to the interval for
//! the rest of the session, and `authorization_declined` is treated as a
//! terminal state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{AuthConfig, AuthError};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Interval used when the provider omits one or sends a non-positive value.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Added to the poll interval on every `slow_down` response.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(1);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// An in-flight device authorization, created by [`DeviceCodeAuthenticator::request_device_code`].
#[derive(Debug, Clone)]
pub struct DeviceCodeSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Always at least one second
    pub poll_interval: Duration,
    pub message: Option<String>,
}

impl DeviceCodeSession {
    /// Human-readable instruction for completing the login out-of-band.
    pub fn verification_message(&self) -> Option<String> {
        if let Some(msg) = self.message.as_deref().map(str::trim) {
            if !msg.is_empty() {
                return Some(msg.to_string());
            }
        }
        if let Some(uri) = self.verification_uri_complete.as_deref() {
            if !uri.is_empty() {
                return Some(format!("Go to {}", uri));
            }
        }
        if !self.verification_uri.is_empty() && !self.user_code.is_empty() {
            return Some(format!(
                "Go to {} and enter code {}",
                self.verification_uri, self.user_code
            ));
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    #[serde(default)]
    device_code: String,
    #[serde(default)]
    user_code: String,
    #[serde(default)]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Tokens returned by the token endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenSet {
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenSet {
    /// The credential handed to the Teams client: the id token when present,
    /// else the access token.
    pub fn primary_token(&self) -> Option<&str> {
        [self.id_token.as_deref(), Some(self.access_token.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    #[serde(flatten)]
    tokens: TokenSet,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Result of a single poll of the token endpoint.
#[derive(Debug)]
enum PollStep {
    Authorized(TokenSet),
    Pending,
    SlowDown,
}

fn classify(payload: TokenEndpointResponse) -> Result<PollStep, AuthError> {
    if payload.error.is_empty() && !payload.tokens.access_token.is_empty() {
        return Ok(PollStep::Authorized(payload.tokens));
    }
    match payload.error.as_str() {
        "authorization_pending" => Ok(PollStep::Pending),
        "slow_down" => Ok(PollStep::SlowDown),
        "authorization_declined" => Err(AuthError::Expired(
            "device code authorization declined".to_string(),
        )),
        "expired_token" => Err(AuthError::Expired("device code expired".to_string())),
        "" => Err(AuthError::protocol(
            "device code token response missing access_token",
        )),
        other => Err(AuthError::protocol(format!(
            "device code token error: {} ({})",
            other, payload.error_description
        ))),
    }
}

/// Waits between polls. Swappable so tests do not sit out real intervals.
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Executes the device authorization grant end to end.
pub struct DeviceCodeAuthenticator {
    http: reqwest::Client,
    config: AuthConfig,
    sleep: SleepFn,
}

impl DeviceCodeAuthenticator {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            config,
            sleep: Arc::new(|d| Box::pin(tokio::time::sleep(d))),
        })
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    /// Start a device authorization for `scope`.
    pub async fn request_device_code(
        &self,
        tenant: &str,
        scope: &str,
    ) -> Result<DeviceCodeSession, AuthError> {
        let url = self.config.endpoint(tenant, "devicecode")?;
        tracing::debug!("Requesting device code from {}", url);

        let body = self
            .http
            .post(url)
            .form(&[("client_id", self.config.client_id.as_str()), ("scope", scope)])
            .send()
            .await?
            .text()
            .await?;

        let payload: DeviceCodeResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::protocol(format!("device code response parse failed: {}", e)))?;
        if !payload.error.is_empty() {
            return Err(AuthError::protocol(format!(
                "device code error: {} ({})",
                payload.error, payload.error_description
            )));
        }
        if payload.device_code.is_empty() {
            return Err(AuthError::protocol("device code response missing device_code"));
        }

        let interval = if payload.interval <= 0 {
            DEFAULT_POLL_INTERVAL_SECS
        } else {
            payload.interval as u64
        };

        Ok(DeviceCodeSession {
            device_code: payload.device_code,
            user_code: payload.user_code,
            verification_uri: payload.verification_uri,
            verification_uri_complete: payload.verification_uri_complete.filter(|u| !u.is_empty()),
            expires_at: Utc::now() + chrono::Duration::seconds(payload.expires_in.max(0)),
            poll_interval: Duration::from_secs(interval),
            message: payload.message,
        })
    }

    /// Poll the token endpoint until the user completes the login.
    pub async fn poll_for_token(
        &self,
        tenant: &str,
        session: &DeviceCodeSession,
        cancel: &CancellationToken,
    ) -> Result<TokenSet, AuthError> {
        let sleep = Arc::clone(&self.sleep);
        self.poll_for_token_with(tenant, session, cancel, move |d| sleep(d))
            .await
    }

    /// Like [`poll_for_token`](Self::poll_for_token) with a caller-supplied sleep function.
    pub async fn poll_for_token_with<S, F>(
        &self,
        tenant: &str,
        session: &DeviceCodeSession,
        cancel: &CancellationToken,
        sleep: S,
    ) -> Result<TokenSet, AuthError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        let url = self.config.endpoint(tenant, "token")?;
        let mut interval = session.poll_interval.max(Duration::from_secs(1));

        loop {
            if Utc::now() > session.expires_at {
                return Err(AuthError::Expired(
                    "device code expired before authorization completed".to_string(),
                ));
            }
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled("device code polling".to_string()));
            }

            let request = self
                .http
                .post(url.clone())
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.config.client_id.as_str()),
                    ("device_code", session.device_code.as_str()),
                ])
                .send();

            let body = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AuthError::Cancelled("device code polling".to_string()));
                }
                resp = request => resp?.text().await?,
            };

            let payload: TokenEndpointResponse = serde_json::from_str(&body)
                .map_err(|e| AuthError::protocol(format!("token response parse failed: {}", e)))?;

            match classify(payload)? {
                PollStep::Authorized(tokens) => {
                    tracing::info!("Device code authorization completed");
                    return Ok(tokens);
                }
                PollStep::Pending => {
                    tracing::debug!(interval_secs = interval.as_secs(), "authorization pending");
                }
                PollStep::SlowDown => {
                    interval += SLOW_DOWN_STEP;
                    tracing::debug!(interval_secs = interval.as_secs(), "provider asked to slow down");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AuthError::Cancelled("device code polling".to_string()));
                }
                _ = sleep(interval) => {}
            }
        }
    }
}
