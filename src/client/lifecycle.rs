//! Token lifecycle: login, optimistic restore, single-flight refresh, logout.
//!
//! One manager per client domain. State lives in a `watch` channel so guards
//! and views observe every change. Refresh is single-flight: however many
//! callers hit an expired token at once, the backend sees one refresh request
//! and every caller gets the same outcome.
//!
//! The user id is pinned before a refresh and compared with the identity the
//! backend reports afterwards. A mismatch is treated as a security anomaly and
//! wipes everything, including CSRF tokens.

use crate::client::{
    api::{ApiError, AuthApi},
    csrf::CsrfTokenCache,
    single_flight::SingleFlight,
    storage::{clear_auth, load_auth, save_auth, AuthStorage},
    sync::{CrossDomainSync, SyncEvent},
    types::{AuthState, AuthTokens, LoginCredentials, StoredAuth, User},
};
use chrono::Utc;
use std::sync::{Arc, Weak};
use tokio::{
    runtime::Handle,
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

pub const SESSION_EXPIRED: &str = "Session expired";
pub const INVALID_RESPONSE: &str = "Invalid response from server";

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Success(User),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Transient failure; state is unchanged.
    Failed { reason: String },
    /// The backend rejected the session; state is cleared.
    SessionCleared { reason: String },
    /// The refreshed session belongs to someone else; state is cleared.
    IdentityMismatch { expected: String, actual: String },
}

struct Inner<A: AuthApi> {
    api: Arc<A>,
    storage: Arc<dyn AuthStorage>,
    domain: String,
    instance_id: String,
    sync: Option<Arc<CrossDomainSync<A>>>,
    csrf: Option<Arc<CsrfTokenCache>>,
    state: watch::Sender<AuthState>,
    refresh: SingleFlight<(), RefreshOutcome>,
    /// Cancelled when the last manager handle goes away.
    dropped: CancellationToken,
}

impl<A: AuthApi> Drop for Inner<A> {
    fn drop(&mut self) {
        self.dropped.cancel();
    }
}

pub struct TokenLifecycleManager<A: AuthApi> {
    inner: Arc<Inner<A>>,
}

impl<A: AuthApi> Clone for TokenLifecycleManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct LifecycleBuilder<A: AuthApi> {
    api: Arc<A>,
    storage: Arc<dyn AuthStorage>,
    domain: String,
    sync: Option<Arc<CrossDomainSync<A>>>,
    csrf: Option<Arc<CsrfTokenCache>>,
}

impl<A: AuthApi> LifecycleBuilder<A> {
    #[must_use]
    pub fn sync(mut self, sync: Arc<CrossDomainSync<A>>) -> Self {
        self.sync = Some(sync);
        self
    }

    #[must_use]
    pub fn csrf(mut self, csrf: Arc<CsrfTokenCache>) -> Self {
        self.csrf = Some(csrf);
        self
    }

    #[must_use]
    pub fn build(self) -> TokenLifecycleManager<A> {
        let instance_id = self
            .sync
            .as_ref()
            .map_or_else(|| Ulid::new().to_string(), |sync| sync.instance_id().to_string());
        let (state, _) = watch::channel(AuthState::loading(&self.domain));

        TokenLifecycleManager {
            inner: Arc::new(Inner {
                api: self.api,
                storage: self.storage,
                domain: self.domain,
                instance_id,
                sync: self.sync,
                csrf: self.csrf,
                state,
                refresh: SingleFlight::new(),
                dropped: CancellationToken::new(),
            }),
        }
    }
}

impl<A: AuthApi> TokenLifecycleManager<A> {
    #[must_use]
    pub fn builder(api: Arc<A>, storage: Arc<dyn AuthStorage>, domain: &str) -> LifecycleBuilder<A> {
        LifecycleBuilder {
            api,
            storage,
            domain: domain.to_string(),
            sync: None,
            csrf: None,
        }
    }

    /// Restore from storage. A valid snapshot is trusted optimistically and
    /// revalidated in the background when a runtime is available.
    pub fn initialize(&self) -> AuthState {
        let state = self
            .inner
            .restore()
            .unwrap_or_else(|| AuthState::signed_out(&self.inner.domain));
        self.inner.state.send_replace(state.clone());

        if state.is_authenticated() {
            match Handle::try_current() {
                Ok(handle) => {
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move {
                        inner.revalidate().await;
                    });
                }
                Err(_) => warn!("No async runtime; skipping session revalidation"),
            }
        }

        state
    }

    /// Confirm the cached identity with "who am I".
    pub async fn revalidate(&self) -> AuthState {
        self.inner.revalidate().await
    }

    #[instrument(skip_all)]
    pub async fn login(&self, credentials: &LoginCredentials) -> LoginOutcome {
        self.inner.state.send_modify(|state| {
            state.is_loading = true;
            state.error = None;
        });

        let outcome = match self.inner.api.login(credentials).await {
            Err(err) => Err(err.reason()),
            Ok(response) if !response.succeeded() => {
                Err(response.reason().unwrap_or("Login failed").to_string())
            }
            Ok(response) => match (response.user.clone().filter(User::is_valid), response.tokens()) {
                (Some(user), Some(tokens)) => Ok((user, tokens, response.session_id)),
                _ => Err(INVALID_RESPONSE.to_string()),
            },
        };

        match outcome {
            Err(reason) => {
                warn!("Login failed: {}", reason);
                self.inner.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(reason.clone());
                });
                LoginOutcome::Failed { reason }
            }
            Ok((user, tokens, session_id)) => {
                if let Some(csrf) = &self.inner.csrf {
                    csrf.clear();
                }
                let state = AuthState::authenticated(&self.inner.domain, user.clone(), Some(tokens), session_id);
                self.inner.publish(state.clone());
                info!("Login succeeded for user {}", user.id);

                if let Some(sync) = &self.inner.sync {
                    let report = sync.on_login(&state).await;
                    if !report.failed.is_empty() {
                        warn!("Login sync failed for {} sibling domain(s)", report.failed.len());
                    }
                }
                LoginOutcome::Success(user)
            }
        }
    }

    /// Refresh the session. Concurrent callers share one backend request.
    pub async fn refresh_token(&self) -> RefreshOutcome {
        let inner = Arc::clone(&self.inner);
        self.inner
            .refresh
            .run((), move || async move { inner.refresh().await })
            .await
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.is_in_flight(&())
    }

    /// Sign out everywhere. Local state is cleared even if propagation fails.
    #[instrument(skip_all)]
    pub async fn logout(&self) {
        let tokens = self.inner.state.borrow().tokens.clone();

        let result = match &self.inner.sync {
            Some(sync) => sync.on_logout(tokens.as_ref()).await.map(|_| ()).map_err(|err| err.to_string()),
            None => self
                .inner
                .api
                .logout(tokens.as_ref().map(|t| t.access_token.as_str()))
                .await
                .map_err(|err| err.to_string()),
        };
        if let Err(err) = result {
            warn!("Logout propagation failed: {}", err);
        }

        self.inner.clear_all(None);
        info!("Logged out of {}", self.inner.domain);
    }

    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.inner
            .state
            .borrow()
            .user
            .clone()
            .filter(User::is_valid)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Apply an auth change announced by another tab or domain.
    pub fn handle_sync_event(&self, event: &SyncEvent) {
        if event.origin() == self.inner.instance_id {
            return;
        }

        match event {
            SyncEvent::Logout { domain, .. } => {
                if self.is_authenticated() {
                    info!("Remote logout from {}", domain);
                    self.inner.clear_all(None);
                }
            }
            SyncEvent::Login { user, .. } => {
                if self.is_authenticated() {
                    return;
                }
                if let Some(state) = self.inner.restore() {
                    if state.user_id() == Some(user.id.as_str()) {
                        debug!("Adopting remote login for user {}", user.id);
                        self.inner.state.send_replace(state);
                    }
                }
            }
            SyncEvent::TokensRefreshed { .. } => {
                let current = self.state();
                let Some(stored) = self.inner.restore() else {
                    return;
                };
                if current.user_id().is_some() && current.user_id() == stored.user_id() {
                    self.inner.state.send_modify(|state| state.tokens = stored.tokens.clone());
                }
            }
        }
    }

    /// Apply events from the sync channel until it closes or the last
    /// manager handle is dropped. The task does not keep the manager alive.
    #[must_use]
    pub fn spawn_sync_listener(&self) -> Option<JoinHandle<()>> {
        let mut events = self.inner.sync.as_ref()?.subscribe();
        let inner: Weak<Inner<A>> = Arc::downgrade(&self.inner);
        let dropped = self.inner.dropped.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = dropped.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            let Some(inner) = inner.upgrade() else { break };
                            Self { inner }.handle_sync_event(&event);
                        }
                        Err(RecvError::Lagged(skipped)) => warn!("Sync listener skipped {} event(s)", skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Sync listener stopped");
        }))
    }
}

impl<A: AuthApi> Inner<A> {
    /// Snapshot from storage; an invalid one is removed.
    fn restore(&self) -> Option<AuthState> {
        let stored = load_auth(self.storage.as_ref())?;
        match stored.user.filter(User::is_valid) {
            Some(user) => Some(AuthState::authenticated(&self.domain, user, stored.tokens, stored.session_id)),
            None => {
                warn!("Discarding cached auth state without a valid user");
                clear_auth(self.storage.as_ref());
                None
            }
        }
    }

    fn publish(&self, state: AuthState) {
        let state = state.normalized();
        if state.is_authenticated() {
            save_auth(
                self.storage.as_ref(),
                &StoredAuth::from_state(&state, Utc::now().timestamp_millis()),
            );
        } else {
            clear_auth(self.storage.as_ref());
        }
        self.state.send_replace(state);
    }

    fn clear_all(&self, error: Option<&str>) {
        clear_auth(self.storage.as_ref());
        if let Some(csrf) = &self.csrf {
            csrf.clear();
        }
        let state = match error {
            Some(error) => AuthState::signed_out_with_error(&self.domain, error),
            None => AuthState::signed_out(&self.domain),
        };
        self.state.send_replace(state);
    }

    fn access_token(&self) -> Option<String> {
        self.state
            .borrow()
            .tokens
            .as_ref()
            .map(|tokens| tokens.access_token.clone())
    }

    #[instrument(skip_all)]
    async fn revalidate(&self) -> AuthState {
        let current = self.state.borrow().clone();
        let Some(expected) = current.user_id().map(str::to_string) else {
            return current;
        };

        let result = self.api.current_user(self.access_token().as_deref()).await;

        // Logout, login, or refresh may have replaced the state meanwhile.
        if self.state.borrow().user_id() != Some(expected.as_str()) {
            return self.state.borrow().clone();
        }

        match result {
            Ok(user) if user.is_valid() && user.id == expected => {
                let mut state = self.state.borrow().clone();
                state.user = Some(user);
                state.error = None;
                self.publish(state);
            }
            Ok(user) => {
                error!(
                    "Revalidation returned user {} for session of {}; clearing state",
                    user.id, expected
                );
                self.clear_all(Some(SESSION_EXPIRED));
            }
            Err(err) => {
                warn!("Session revalidation failed: {}", err);
                self.clear_all(Some(SESSION_EXPIRED));
            }
        }

        self.state.borrow().clone()
    }

    async fn refresh(&self) -> RefreshOutcome {
        let current = self.state.borrow().clone();

        let expected = match current.user_id() {
            Some(id) => id.to_string(),
            None => match self.api.current_user(self.access_token().as_deref()).await {
                Ok(user) if user.is_valid() => user.id,
                Ok(_) => return self.session_cleared(INVALID_RESPONSE.to_string()),
                Err(err) => return self.classify_failure(&err),
            },
        };

        let refresh_token = current.tokens.as_ref().map(|t| t.refresh_token.clone());
        let response = match self.api.refresh(refresh_token.as_deref()).await {
            Ok(response) => response,
            Err(err) => return self.classify_failure(&err),
        };
        if !response.succeeded() {
            return self.session_cleared(response.reason().unwrap_or("Refresh rejected").to_string());
        }

        let tokens: Option<AuthTokens> = response.tokens();
        let actual = match response.user.clone().filter(User::is_valid) {
            Some(user) => user,
            None => {
                let access = tokens
                    .as_ref()
                    .map(|t| t.access_token.clone())
                    .or_else(|| self.access_token());
                match self.api.current_user(access.as_deref()).await {
                    Ok(user) if user.is_valid() => user,
                    Ok(_) => return self.session_cleared(INVALID_RESPONSE.to_string()),
                    Err(err) => return self.classify_failure(&err),
                }
            }
        };

        if actual.id != expected {
            error!(
                "Refresh returned user {} for session of {}; clearing state",
                actual.id, expected
            );
            self.clear_all(Some(SESSION_EXPIRED));
            return RefreshOutcome::IdentityMismatch {
                expected,
                actual: actual.id,
            };
        }

        let mut state = self.state.borrow().clone();
        if state.user_id() != Some(expected.as_str()) {
            return RefreshOutcome::Failed {
                reason: "Session changed during refresh".to_string(),
            };
        }
        if let Some(tokens) = tokens {
            state.tokens = Some(tokens);
        }
        state.error = None;
        self.publish(state);

        if let Some(sync) = &self.sync {
            sync.notify_tokens_refreshed();
        }
        debug!("Tokens refreshed for user {}", expected);
        RefreshOutcome::Refreshed
    }

    fn classify_failure(&self, err: &ApiError) -> RefreshOutcome {
        if err.is_auth_rejection() {
            self.session_cleared(err.reason())
        } else {
            warn!("Token refresh failed: {}", err);
            RefreshOutcome::Failed { reason: err.reason() }
        }
    }

    fn session_cleared(&self, reason: String) -> RefreshOutcome {
        info!("Session cleared after refresh: {}", reason);
        self.clear_all(Some(SESSION_EXPIRED));
        RefreshOutcome::SessionCleared { reason }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::{
        api::{ClientConfig, HttpAuthApi, LOGIN_PATH, LOGOUT_PATH, ME_PATH, REFRESH_PATH},
        csrf::{CsrfConfig, CSRF_PATH},
        storage::{MemoryStorage, AUTH_STORAGE_KEY},
        sync::{SyncChannel, SyncConfig},
        types::VerificationTier,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOMAIN: &str = "dashboard.example.com";

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: None,
            role: "seller".to_string(),
            verification: VerificationTier::Basic,
        }
    }

    fn api(uri: &str) -> Arc<HttpAuthApi> {
        Arc::new(HttpAuthApi::new(&ClientConfig::new(uri, DOMAIN)).unwrap())
    }

    fn manager(uri: &str, storage: &MemoryStorage) -> TokenLifecycleManager<HttpAuthApi> {
        TokenLifecycleManager::builder(api(uri), Arc::new(storage.clone()), DOMAIN).build()
    }

    fn seed(storage: &MemoryStorage, user: Option<User>) {
        save_auth(
            storage,
            &StoredAuth {
                user,
                tokens: Some(AuthTokens::bearer("a1", "r1")),
                session_id: None,
                domain: DOMAIN.to_string(),
                stored_at: 0,
            },
        );
    }

    async fn wait_for<F: Fn(&AuthState) -> bool>(
        manager: &TokenLifecycleManager<HttpAuthApi>,
        predicate: F,
    ) -> AuthState {
        let mut rx = manager.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|state| predicate(state)))
            .await
            .unwrap()
            .unwrap()
            .clone();
        state
    }

    #[tokio::test]
    async fn initialize_without_cache_is_signed_out() {
        let state = manager("http://127.0.0.1:9", &MemoryStorage::new()).initialize();
        assert!(!state.is_authenticated());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn initialize_discards_invalid_cached_user() {
        let storage = MemoryStorage::new();
        let mut bad = user("u1");
        bad.email = "nope".to_string();
        seed(&storage, Some(bad));

        let state = manager("http://127.0.0.1:9", &storage).initialize();
        assert!(!state.is_authenticated());
        assert!(state.tokens.is_none());
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn cached_session_is_optimistic_then_cleared_when_revalidation_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ME_PATH))
            .and(header("authorization", "Bearer a1"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(50)))
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);

        let state = manager.initialize();
        assert!(state.is_authenticated());
        assert!(!state.is_loading);

        let cleared = wait_for(&manager, |state| !state.is_authenticated()).await;
        assert_eq!(cleared.error.as_deref(), Some(SESSION_EXPIRED));
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn revalidation_with_other_user_clears_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ME_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": user("u2") })))
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        let state = manager.revalidate().await;
        assert!(!state.is_authenticated());
    }

    #[tokio::test]
    async fn login_success_persists_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "user": user("u1"),
                "accessToken": "a1",
                "refreshToken": "r1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        let manager = manager(&server.uri(), &storage);
        let outcome = manager
            .login(&LoginCredentials::new("u1@example.com", "pw"))
            .await;

        assert_eq!(outcome, LoginOutcome::Success(user("u1")));
        assert!(manager.is_authenticated());
        assert_eq!(manager.current_user().map(|u| u.id), Some("u1".to_string()));
        let stored = load_auth(&storage).unwrap();
        assert_eq!(stored.tokens, Some(AuthTokens::bearer("a1", "r1")));
    }

    #[tokio::test]
    async fn login_failures_become_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .and(wiremock::matchers::body_partial_json(json!({ "email": "bad@example.com" })))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid credentials" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .and(wiremock::matchers::body_partial_json(json!({ "email": "partial@example.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "user": user("u1"),
                "accessToken": "a1"
            })))
            .mount(&server)
            .await;

        let manager = manager(&server.uri(), &MemoryStorage::new());
        assert_eq!(
            manager.login(&LoginCredentials::new("bad@example.com", "pw")).await,
            LoginOutcome::Failed {
                reason: "Invalid credentials".to_string()
            }
        );
        assert_eq!(
            manager.login(&LoginCredentials::new("partial@example.com", "pw")).await,
            LoginOutcome::Failed {
                reason: INVALID_RESPONSE.to_string()
            }
        );
        assert!(!manager.is_authenticated());
        assert!(!manager.state().is_loading);
    }

    #[tokio::test]
    async fn concurrent_refreshes_send_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "success": true,
                        "user": user("u1"),
                        "accessToken": "a2",
                        "refreshToken": "r2"
                    }))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.refresh_token().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), RefreshOutcome::Refreshed);
        }

        assert!(!manager.is_refreshing());
        assert_eq!(manager.state().tokens, Some(AuthTokens::bearer("a2", "r2")));
        assert_eq!(load_auth(&storage).unwrap().tokens, Some(AuthTokens::bearer("a2", "r2")));
    }

    #[tokio::test]
    async fn refresh_without_user_in_response_pins_through_who_am_i() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(ME_PATH))
            .and(header("authorization", "Bearer a2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": user("u1") })))
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        assert_eq!(manager.refresh_token().await, RefreshOutcome::Refreshed);
    }

    #[tokio::test]
    async fn identity_mismatch_clears_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "user": user("u2"),
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(CSRF_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "c1" })))
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let api = api(&server.uri());
        let csrf = Arc::new(
            CsrfTokenCache::new(api.http_client().clone(), CsrfConfig::new(DOMAIN, &server.uri())).unwrap(),
        );
        let manager = TokenLifecycleManager::builder(api, Arc::new(storage.clone()), DOMAIN)
            .csrf(Arc::clone(&csrf))
            .build();
        manager.inner.state.send_replace(manager.inner.restore().unwrap());
        assert!(csrf.get_token(None).await.is_some());

        let outcome = manager.refresh_token().await;
        assert_eq!(
            outcome,
            RefreshOutcome::IdentityMismatch {
                expected: "u1".to_string(),
                actual: "u2".to_string()
            }
        );
        assert!(!manager.is_authenticated());
        assert!(manager.state().tokens.is_none());
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
        assert!(csrf.entry(DOMAIN).is_none());
    }

    async fn refresh_as(expected: &str, actual: &str) -> (RefreshOutcome, AuthState, Option<String>) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "user": user(actual),
                "accessToken": "a2",
                "refreshToken": "r2"
            })))
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user(expected)));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        let outcome = manager.refresh_token().await;
        (outcome, manager.state(), storage.get(AUTH_STORAGE_KEY))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn refresh_for_any_other_user_is_a_mismatch(
            expected in "[a-z0-9]{1,12}",
            actual in "[a-z0-9]{1,12}",
        ) {
            prop_assume!(expected != actual);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (outcome, state, stored) = runtime.block_on(refresh_as(&expected, &actual));

            prop_assert_eq!(
                outcome,
                RefreshOutcome::IdentityMismatch { expected: expected.clone(), actual: actual.clone() }
            );
            prop_assert!(!state.is_authenticated());
            prop_assert!(state.tokens.is_none());
            prop_assert_eq!(state.error.as_deref(), Some(SESSION_EXPIRED));
            prop_assert_eq!(stored, None);
        }
    }

    #[tokio::test]
    async fn refresh_for_same_user_keeps_session() {
        let (outcome, state, stored) = refresh_as("u1", "u1").await;
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(state.user_id(), Some("u1"));
        assert_eq!(state.tokens, Some(AuthTokens::bearer("a2", "r2")));
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn refresh_with_success_false_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "Refresh token revoked"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        assert_eq!(
            manager.refresh_token().await,
            RefreshOutcome::SessionCleared {
                reason: "Refresh token revoked".to_string()
            }
        );
        assert!(!manager.is_authenticated());
        assert_eq!(manager.state().error.as_deref(), Some(SESSION_EXPIRED));
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn rejected_refresh_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Refresh token expired" })))
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        assert_eq!(
            manager.refresh_token().await,
            RefreshOutcome::SessionCleared {
                reason: "Refresh token expired".to_string()
            }
        );
        assert!(!manager.is_authenticated());
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn network_failure_leaves_state_untouched() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&uri, &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());
        let before = manager.state();

        assert!(matches!(manager.refresh_token().await, RefreshOutcome::Failed { .. }));
        assert_eq!(manager.state(), before);
        assert!(!manager.is_refreshing());
    }

    #[tokio::test]
    async fn logout_clears_state_even_when_backend_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGOUT_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = manager(&server.uri(), &storage);
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        manager.logout().await;
        assert!(!manager.is_authenticated());
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn sync_events_from_other_instances_are_applied() {
        let server = MockServer::start().await;
        let api = api(&server.uri());
        let http = api.http_client().clone();
        let sync = Arc::new(CrossDomainSync::new(
            Arc::clone(&api),
            http,
            SyncConfig {
                domain: DOMAIN.to_string(),
                siblings: Vec::new(),
            },
            SyncChannel::default(),
        ));
        let storage = MemoryStorage::new();
        let manager = TokenLifecycleManager::builder(api, Arc::new(storage.clone()), DOMAIN)
            .sync(Arc::clone(&sync))
            .build();
        manager.initialize();

        // Own events are ignored.
        seed(&storage, Some(user("u1")));
        manager.handle_sync_event(&SyncEvent::Login {
            origin: manager.instance_id().to_string(),
            domain: DOMAIN.to_string(),
            user: user("u1"),
            session_id: None,
        });
        assert!(!manager.is_authenticated());

        // Another tab logged in and wrote the shared snapshot.
        manager.handle_sync_event(&SyncEvent::Login {
            origin: "other-tab".to_string(),
            domain: DOMAIN.to_string(),
            user: user("u1"),
            session_id: None,
        });
        assert!(manager.is_authenticated());

        manager.handle_sync_event(&SyncEvent::Logout {
            origin: "other-tab".to_string(),
            domain: DOMAIN.to_string(),
        });
        assert!(!manager.is_authenticated());
        assert_eq!(storage.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn sync_listener_stops_when_manager_is_dropped() {
        let server = MockServer::start().await;
        let api = api(&server.uri());
        let http = api.http_client().clone();
        let sync = Arc::new(CrossDomainSync::new(
            Arc::clone(&api),
            http,
            SyncConfig {
                domain: DOMAIN.to_string(),
                siblings: Vec::new(),
            },
            SyncChannel::default(),
        ));
        let storage = MemoryStorage::new();
        seed(&storage, Some(user("u1")));
        let manager = TokenLifecycleManager::builder(api, Arc::new(storage.clone()), DOMAIN)
            .sync(Arc::clone(&sync))
            .build();
        manager.inner.state.send_replace(manager.inner.restore().unwrap());

        let listener = manager.spawn_sync_listener().unwrap();
        sync.channel().publish(SyncEvent::Logout {
            origin: "other-tab".to_string(),
            domain: DOMAIN.to_string(),
        });
        wait_for(&manager, |state| !state.is_authenticated()).await;

        // `sync` still holds the sender, so the channel never closes.
        drop(manager);
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
