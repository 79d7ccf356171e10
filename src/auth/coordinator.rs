//! Session refresh coordination
//!
//! [`SessionRefreshCoordinator`] is the single entry point for renewing
//! credentials. It runs the device code flow, falls back to the external
//! login helper, and swaps in a freshly built API client afterwards.
//! Concurrent callers share one in-flight refresh.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::device_code::DeviceCodeAuthenticator;
use super::fallback::plan::Strategy;
use super::fallback::{AuthAttemptResult, FallbackAuthRunner};
use super::resource::ResourceTokenRefresher;
use super::{AuthConfig, AuthError, TokenStore, PRIMARY_TOKEN_NAME};

/// Errors that can tell whether fresh credentials would fix them.
pub trait NeedsAuth {
    fn needs_auth(&self) -> bool;
}

/// Builds the downstream API client from persisted tokens.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Error: StdError + NeedsAuth + Send + Sync + 'static;

    fn build(&self) -> Result<Self::Client, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStatus {
    Succeeded,
    Failed(String),
}

/// UI collaborator notified about refresh progress.
pub trait RefreshObserver: Send + Sync {
    /// Instructions for completing the device code login.
    fn verification_message(&self, message: &str);

    /// A refresh is starting; `display_note` says how the login helper would run.
    fn refresh_started(&self, _display_note: &str) {}

    fn refresh_finished(&self, status: &RefreshStatus);

    /// Release the terminal for an interactive helper. The receiver fires
    /// once the UI has stopped drawing.
    fn suspend_terminal(&self) -> Option<oneshot::Receiver<()>> {
        None
    }

    fn resume_terminal(&self) {}
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// Every strategy failed.
    #[error("auth refresh failed: {}", describe_attempts(.attempts))]
    Exhausted { attempts: Vec<AuthAttemptResult> },

    /// Credentials were refreshed but the client could not be rebuilt.
    #[error("unable to reinitialize Teams client after token refresh: {0}")]
    ClientInit(String),
}

impl RefreshError {
    pub fn attempts(&self) -> &[AuthAttemptResult] {
        match self {
            RefreshError::Exhausted { attempts } => attempts,
            RefreshError::ClientInit(_) => &[],
        }
    }

    /// Error of the last strategy tried.
    #[cfg(test)]
    pub fn last_error(&self) -> Option<&AuthError> {
        self.attempts().iter().rev().find_map(|a| a.error.as_ref())
    }
}

fn describe_attempts(attempts: &[AuthAttemptResult]) -> String {
    if attempts.is_empty() {
        return "no strategy attempted".to_string();
    }
    attempts
        .iter()
        .filter_map(|a| a.error.as_ref().map(|e| format!("{}: {}", a.strategy, e)))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of [`SessionRefreshCoordinator::call_with_refresh`].
#[derive(Debug)]
pub enum CallError<E> {
    Api(E),
    Refresh(Arc<RefreshError>),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Api(e) => e.fmt(f),
            CallError::Refresh(e) => e.fmt(f),
        }
    }
}

impl<E: StdError + 'static> StdError for CallError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CallError::Api(e) => Some(e),
            CallError::Refresh(e) => Some(e.as_ref()),
        }
    }
}

struct ClientSlot<C> {
    client: Option<Arc<C>>,
    version: u64,
}

pub type SharedOutcome = Result<(), Arc<RefreshError>>;

pub struct SessionRefreshCoordinator<F: ClientFactory> {
    config: AuthConfig,
    store: TokenStore,
    device: DeviceCodeAuthenticator,
    resources: ResourceTokenRefresher,
    fallback: FallbackAuthRunner,
    factory: F,
    observer: Arc<dyn RefreshObserver>,
    client: RwLock<ClientSlot<F::Client>>,
    /// Held for the duration of a refresh; keeps the last outcome
    gate: Mutex<Option<SharedOutcome>>,
    /// Number of refreshes completed so far
    completed: AtomicU64,
    cancel: CancellationToken,
}

impl<F: ClientFactory> SessionRefreshCoordinator<F> {
    pub fn new(
        config: AuthConfig,
        store: TokenStore,
        fallback: FallbackAuthRunner,
        factory: F,
        observer: Arc<dyn RefreshObserver>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            device: DeviceCodeAuthenticator::new(config.clone())?,
            resources: ResourceTokenRefresher::new(config.clone()),
            config,
            store,
            fallback,
            factory,
            observer,
            client: RwLock::new(ClientSlot {
                client: None,
                version: 0,
            }),
            gate: Mutex::new(None),
            completed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_device_authenticator(mut self, device: DeviceCodeAuthenticator) -> Self {
        self.device = device;
        self
    }

    /// Cancel to abort an in-flight device code flow, e.g. on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn display_note(&self) -> &'static str {
        self.fallback.display_note()
    }

    /// Current client handle, if one has been built.
    pub fn client(&self) -> Option<Arc<F::Client>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .client
            .clone()
    }

    /// Bumped every time the handle is replaced or cleared.
    #[cfg(test)]
    pub fn client_version(&self) -> u64 {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Build the initial client from whatever tokens are on disk.
    pub fn init_client(&self) -> Result<Arc<F::Client>, F::Error> {
        let client = Arc::new(self.factory.build()?);
        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
        slot.client = Some(Arc::clone(&client));
        slot.version += 1;
        Ok(client)
    }

    /// Refresh credentials and rebuild the client.
    ///
    /// Only one refresh runs at a time. A caller that arrives while another
    /// refresh is in flight waits for it and returns its outcome.
    pub async fn refresh(&self) -> SharedOutcome {
        let seen = self.completed.load(Ordering::Acquire);
        self.refresh_after(seen).await
    }

    /// Refresh unless one has completed since generation `seen`, in which
    /// case its outcome is returned instead.
    async fn refresh_after(&self, seen: u64) -> SharedOutcome {
        let mut gate = self.gate.lock().await;

        let generation = self.completed.load(Ordering::Acquire);
        if generation != seen {
            if let Some(outcome) = gate.as_ref() {
                tracing::debug!(generation, "Sharing outcome of concurrent auth refresh");
                return outcome.clone();
            }
        }

        tracing::info!(generation = generation + 1, "Starting auth refresh");
        self.observer.refresh_started(self.fallback.display_note());

        let outcome = self.run_refresh().await.map_err(Arc::new);
        *gate = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::Release);
        drop(gate);

        let status = match &outcome {
            Ok(()) => RefreshStatus::Succeeded,
            Err(e) => RefreshStatus::Failed(e.to_string()),
        };
        self.observer.refresh_finished(&status);
        outcome
    }

    /// Run `op` against the current client; on an auth failure refresh once
    /// and retry once.
    pub async fn call_with_refresh<T, Op, Fut>(&self, op: Op) -> Result<T, CallError<F::Error>>
    where
        Op: Fn(Arc<F::Client>) -> Fut,
        Fut: Future<Output = Result<T, F::Error>>,
    {
        // A refresh finishing after this point already covers our failure
        let seen = self.completed.load(Ordering::Acquire);

        let client = match self.client() {
            Some(client) => Some(client),
            None => match self.init_client() {
                Ok(client) => Some(client),
                Err(e) if e.needs_auth() => {
                    tracing::info!("No usable credentials ({}), refreshing", e);
                    None
                }
                Err(e) => return Err(CallError::Api(e)),
            },
        };

        if let Some(client) = client {
            match op(client).await {
                Err(e) if e.needs_auth() => {
                    tracing::info!("Request unauthorized ({}), refreshing auth", e);
                }
                other => return other.map_err(CallError::Api),
            }
        }

        self.refresh_after(seen).await.map_err(CallError::Refresh)?;
        let client = match self.client() {
            Some(client) => client,
            None => self.init_client().map_err(CallError::Api)?,
        };
        op(client).await.map_err(CallError::Api)
    }

    async fn run_refresh(&self) -> Result<(), RefreshError> {
        let mut attempts = Vec::new();

        if self.config.disable_device_code {
            tracing::info!("Device code auth disabled");
        } else {
            match self.refresh_via_device_code().await {
                Ok(()) => {
                    tracing::info!("Device code auth refresh succeeded");
                    return self.reinitialize_client();
                }
                Err(err) => {
                    tracing::warn!(kind = err.kind(), "Device code auth refresh failed, falling back: {}", err);
                    attempts.push(AuthAttemptResult::failure(Strategy::DeviceCode, err));
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(RefreshError::Exhausted { attempts });
        }

        let results = self.fallback.run(self.observer.as_ref()).await;
        let succeeded = results.last().is_some_and(|r| r.succeeded);
        attempts.extend(results);

        if succeeded {
            self.reinitialize_client()
        } else {
            Err(RefreshError::Exhausted { attempts })
        }
    }

    async fn refresh_via_device_code(&self) -> Result<(), AuthError> {
        let timeout = self.config.device_code_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(AuthError::Cancelled("device code flow".to_string()))
            }
            res = tokio::time::timeout(timeout, self.device_code_flow()) => match res {
                Ok(result) => result,
                Err(_) => Err(AuthError::Expired(format!(
                    "device code flow did not complete within {}s",
                    timeout.as_secs()
                ))),
            },
        }
    }

    async fn device_code_flow(&self) -> Result<(), AuthError> {
        let tenant = self.config.tenant.as_str();

        let session = self.device.request_device_code(tenant, &self.config.scope).await?;
        if let Some(message) = session.verification_message() {
            self.observer.verification_message(&message);
        }

        let tokens = self.device.poll_for_token(tenant, &session, &self.cancel).await?;

        let primary = tokens.primary_token().ok_or_else(|| {
            AuthError::protocol("device code flow did not return an id_token or access_token")
        })?;
        self.store.write(PRIMARY_TOKEN_NAME, primary)?;

        let refresh_token = tokens
            .refresh_token()
            .ok_or_else(|| AuthError::protocol("device code flow did not return a refresh_token"))?;

        let results = join_all(self.config.resources.iter().map(|resource| async move {
            let token = self
                .resources
                .refresh_resource(tenant, refresh_token, resource)
                .await?;
            self.store.write(&resource.label, &token.access_token)?;
            tracing::info!(resource = %resource.label, "Resource token refreshed");
            Ok::<(), AuthError>(())
        }))
        .await;

        let mut failures: Vec<AuthError> = results.into_iter().filter_map(Result::err).collect();
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(AuthError::protocol(
                failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }

    fn reinitialize_client(&self) -> Result<(), RefreshError> {
        let built = self.factory.build();
        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
        slot.version += 1;
        match built {
            Ok(client) => {
                slot.client = Some(Arc::new(client));
                tracing::info!(version = slot.version, "Teams client reinitialized");
                Ok(())
            }
            Err(e) => {
                slot.client = None;
                Err(RefreshError::ClientInit(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fallback::locate::HostProbe;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("401 unauthorized")]
        Unauthorized,
        #[error("missing token")]
        MissingToken,
        #[error("boom")]
        Other,
    }

    impl NeedsAuth for FakeError {
        fn needs_auth(&self) -> bool {
            matches!(self, FakeError::Unauthorized | FakeError::MissingToken)
        }
    }

    /// Client is the primary token read from the store.
    struct StoreFactory {
        store: TokenStore,
    }

    impl ClientFactory for StoreFactory {
        type Client = String;
        type Error = FakeError;

        fn build(&self) -> Result<String, FakeError> {
            match self.store.read(PRIMARY_TOKEN_NAME) {
                Ok(Some(token)) => Ok(token),
                _ => Err(FakeError::MissingToken),
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        messages: StdMutex<Vec<String>>,
        finished: StdMutex<Vec<RefreshStatus>>,
    }

    impl RefreshObserver for RecordingObserver {
        fn verification_message(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }

        fn refresh_finished(&self, status: &RefreshStatus) {
            self.finished.lock().unwrap().push(status.clone());
        }
    }

    struct Harness {
        coordinator: SessionRefreshCoordinator<StoreFactory>,
        observer: Arc<RecordingObserver>,
        tokens: TempDir,
        _roots: TempDir,
    }

    fn harness(server: &MockServer, disable_device_code: bool) -> Harness {
        harness_with(AuthConfig {
            authority: server.uri(),
            disable_device_code,
            disable_embedded_display: true,
            ..AuthConfig::default()
        })
    }

    fn harness_with(config: AuthConfig) -> Harness {
        let tokens = TempDir::new().unwrap();
        let roots = TempDir::new().unwrap();
        let store = TokenStore::new(tokens.path());
        let observer = Arc::new(RecordingObserver::default());
        let fallback = FallbackAuthRunner::new(
            &config,
            HostProbe::new(vec![roots.path().to_path_buf()], None),
        );
        let device = DeviceCodeAuthenticator::new(config.clone())
            .unwrap()
            .with_sleep(Arc::new(|_| Box::pin(async {})));

        let coordinator = SessionRefreshCoordinator::new(
            config,
            store.clone(),
            fallback,
            StoreFactory { store },
            observer.clone(),
        )
        .unwrap()
        .with_device_authenticator(device);

        Harness {
            coordinator,
            observer,
            tokens,
            _roots: roots,
        }
    }

    async fn mount_device_code(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "abc",
                "user_code": "XYZ-123",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 5
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mount_pending_then_tokens(server: &MockServer, pending: u64) {
        if pending > 0 {
            Mock::given(method("POST"))
                .and(path("/common/oauth2/v2.0/token"))
                .and(body_string_contains("device_code=abc"))
                .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                    "error": "authorization_pending",
                    "error_description": "waiting"
                })))
                .up_to_n_times(pending)
                .with_priority(1)
                .mount(server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("device_code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": "AT1",
                "refresh_token": "RT1",
                "id_token": "IDT1"
            })))
            .with_priority(2)
            .mount(server)
            .await;
    }

    async fn mount_resource(server: &MockServer, host: &str, token: &str) {
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT1"))
            .and(body_string_contains(host))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "access_token": token,
                "expires_in": 3599
            })))
            .mount(server)
            .await;
    }

    fn read_token(dir: &TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(format!("token-{}.jwt", name))).unwrap()
    }

    #[tokio::test]
    async fn test_device_code_refresh_persists_all_tokens() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_pending_then_tokens(&server, 3).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        mount_resource(&server, "chatsvcagg.teams.microsoft.com", "CSA1").await;

        let h = harness(&server, false);
        assert_eq!(h.coordinator.client_version(), 0);

        assert_ok!(h.coordinator.refresh().await);

        assert_eq!(read_token(&h.tokens, "teams"), "IDT1");
        assert_eq!(read_token(&h.tokens, "skype"), "SKYPE1");
        assert_eq!(read_token(&h.tokens, "chatsvcagg"), "CSA1");

        assert_eq!(h.coordinator.client().as_deref().map(String::as_str), Some("IDT1"));
        assert_eq!(h.coordinator.client_version(), 1);
        assert_eq!(
            h.observer.messages.lock().unwrap().as_slice(),
            ["Go to https://microsoft.com/devicelogin and enter code XYZ-123"]
        );
        assert_eq!(
            h.observer.finished.lock().unwrap().as_slice(),
            [RefreshStatus::Succeeded]
        );

        let token_polls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| String::from_utf8_lossy(&r.body).contains("device_code=abc"))
            .count();
        assert_eq!(token_polls, 4);
    }

    #[tokio::test]
    async fn test_disabled_device_code_without_helper() {
        let server = MockServer::start().await;
        mount_device_code(&server, 0).await;

        let h = harness(&server, true);
        let err = assert_err!(h.coordinator.refresh().await);

        assert!(matches!(err.last_error(), Some(AuthError::ToolchainMissing(_))));
        assert!(err.to_string().contains("teams-token, teams-token-cli"));
        assert!(h.coordinator.client().is_none());
        assert!(matches!(
            h.observer.finished.lock().unwrap().as_slice(),
            [RefreshStatus::Failed(msg)] if msg.contains("teams-token-cli")
        ));
    }

    #[tokio::test]
    async fn test_device_code_failure_then_fallback_failure_names_both() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_declined",
                "error_description": "user said no"
            })))
            .mount(&server)
            .await;

        let h = harness(&server, false);
        let err = assert_err!(h.coordinator.refresh().await);

        let strategies: Vec<Strategy> = err.attempts().iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, vec![Strategy::DeviceCode, Strategy::HelperLookup]);
        let msg = err.to_string();
        assert!(msg.contains("device code: device code authorization declined"));
        assert!(msg.contains("helper lookup: no teams-token directory found"));
    }

    #[tokio::test]
    async fn test_resource_failure_fails_device_code_path() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_pending_then_tokens(&server, 0).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("chatsvcagg.teams.microsoft.com"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS65001"
            })))
            .mount(&server)
            .await;

        let h = harness(&server, false);
        let err = assert_err!(h.coordinator.refresh().await);

        let device = &err.attempts()[0];
        assert_eq!(device.strategy, Strategy::DeviceCode);
        assert!(device
            .error
            .as_ref()
            .unwrap()
            .to_string()
            .contains("refresh token error for chatsvcagg: invalid_grant"));
        // The primary token and the resource that succeeded are still on disk
        assert_eq!(read_token(&h.tokens, "teams"), "IDT1");
        assert_eq!(read_token(&h.tokens, "skype"), "SKYPE1");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_flow() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_pending_then_tokens(&server, 2).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        mount_resource(&server, "chatsvcagg.teams.microsoft.com", "CSA1").await;

        let h = harness(&server, false);
        let (first, second) = tokio::join!(h.coordinator.refresh(), h.coordinator.refresh());

        assert_ok!(first);
        assert_ok!(second);
        assert_eq!(h.coordinator.client_version(), 1);
        assert_eq!(h.observer.finished.lock().unwrap().len(), 1);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_refresh_after_completion_starts_new_flow() {
        let server = MockServer::start().await;
        mount_device_code(&server, 2).await;
        mount_pending_then_tokens(&server, 0).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        mount_resource(&server, "chatsvcagg.teams.microsoft.com", "CSA1").await;

        let h = harness(&server, false);
        assert_ok!(h.coordinator.refresh().await);
        assert_ok!(h.coordinator.refresh().await);
        assert_eq!(h.coordinator.client_version(), 2);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_call_with_refresh_retries_once_after_unauthorized() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_pending_then_tokens(&server, 0).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        mount_resource(&server, "chatsvcagg.teams.microsoft.com", "CSA1").await;

        let h = harness(&server, false);
        h.coordinator.store().write(PRIMARY_TOKEN_NAME, "STALE").unwrap();

        let calls = AtomicUsize::new(0);
        let result = h
            .coordinator
            .call_with_refresh(|client: Arc<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if client.as_str() == "STALE" {
                        Err(FakeError::Unauthorized)
                    } else {
                        Ok(client.len())
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(result), "IDT1".len());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_after_completed_refresh_reuses_it() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_pending_then_tokens(&server, 0).await;
        mount_resource(&server, "api.spaces.skype.com", "SKYPE1").await;
        mount_resource(&server, "chatsvcagg.teams.microsoft.com", "CSA1").await;

        let h = harness(&server, false);
        h.coordinator.store().write(PRIMARY_TOKEN_NAME, "STALE").unwrap();
        assert_ok!(h.coordinator.init_client());

        let coordinator = &h.coordinator;
        let result = coordinator
            .call_with_refresh(|client: Arc<String>| async move {
                if client.as_str() == "STALE" {
                    // Another request path refreshes while this call is in flight
                    assert_ok!(coordinator.refresh().await);
                    Err(FakeError::Unauthorized)
                } else {
                    Ok(client.to_string())
                }
            })
            .await;

        assert_eq!(assert_ok!(result), "IDT1");
        assert_eq!(h.observer.finished.lock().unwrap().len(), 1);
        let device_code_requests = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path().ends_with("/devicecode"))
            .count();
        assert_eq!(device_code_requests, 1);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_call_with_refresh_passes_through_other_errors() {
        let server = MockServer::start().await;
        mount_device_code(&server, 0).await;

        let h = harness(&server, false);
        h.coordinator.store().write(PRIMARY_TOKEN_NAME, "AT").unwrap();

        let result: Result<(), _> = h
            .coordinator
            .call_with_refresh(|_| async { Err(FakeError::Other) })
            .await;
        assert!(matches!(result, Err(CallError::Api(FakeError::Other))));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_cancelled_device_code_flow() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending"
            })))
            .mount(&server)
            .await;

        let h = harness(&server, false);
        let device = DeviceCodeAuthenticator::new(AuthConfig {
            authority: server.uri(),
            ..AuthConfig::default()
        })
        .unwrap()
        .with_sleep(Arc::new(|_| Box::pin(tokio::time::sleep(Duration::from_millis(20)))));
        let coordinator = h.coordinator.with_device_authenticator(device);

        let cancel = coordinator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(10), coordinator.refresh())
            .await
            .expect("refresh should stop once cancelled")
            .unwrap_err();
        let strategies: Vec<Strategy> = err.attempts().iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, vec![Strategy::DeviceCode]);
        assert!(matches!(err.attempts()[0].error, Some(AuthError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_device_code_deadline_is_expired() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending"
            })))
            .mount(&server)
            .await;

        let config = AuthConfig {
            authority: server.uri(),
            disable_embedded_display: true,
            device_code_timeout: Duration::from_millis(200),
            ..AuthConfig::default()
        };
        let device = DeviceCodeAuthenticator::new(config.clone())
            .unwrap()
            .with_sleep(Arc::new(|_| Box::pin(tokio::time::sleep(Duration::from_millis(20)))));
        let h = harness_with(config);
        let coordinator = h.coordinator.with_device_authenticator(device);

        let err = assert_err!(coordinator.refresh().await);
        let device = &err.attempts()[0];
        assert_eq!(device.strategy, Strategy::DeviceCode);
        assert!(matches!(
            device.error,
            Some(AuthError::Expired(ref msg)) if msg.contains("did not complete within")
        ));
    }

    #[test]
    fn test_exhausted_display() {
        let err = RefreshError::Exhausted {
            attempts: vec![
                AuthAttemptResult::failure(Strategy::DeviceCode, AuthError::Expired("expired".into())),
                AuthAttemptResult::failure(
                    Strategy::NativeBinary,
                    AuthError::toolchain_missing("no binary"),
                ),
            ],
        };
        assert_eq!(
            err.to_string(),
            "auth refresh failed: device code: expired; native binary: no binary"
        );
        assert!(matches!(err.last_error(), Some(AuthError::ToolchainMissing(_))));
    }
}
