//! Backend auth API as seen from the client services.
//!
//! `AuthApi` is the seam the lifecycle manager and sync service are generic
//! over; `HttpAuthApi` is the reqwest implementation with a cookie jar, so
//! cookie-based refresh works without the client ever seeing the tokens.

use crate::{
    client::types::{AuthTokens, LoginCredentials, User},
    APP_USER_AGENT,
};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh-token";
pub const ME_PATH: &str = "/auth/me";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const HANDOFF_PATH: &str = "/auth/sso/token";

pub const CLIENT_DOMAIN_HEADER: &str = "X-Client-Domain";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum number of error body characters surfaced to callers.
const MAX_ERROR_CHARS: usize = 200;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request failed ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("Response error: {0}")]
    Parse(String),
}

impl ApiError {
    /// The backend refused the credentials themselves (as opposed to being down).
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Http { status: 401 | 403, .. })
    }

    /// Human-readable reason for outcome enums.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Http { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub domain: String,
    pub timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(api_base_url: &str, domain: &str) -> Self {
        Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            domain: domain.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Body of login and refresh responses. Backends nest the payload under
/// `data` in some versions; `into_flat` lifts it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default, alias = "access_token", alias = "token")]
    pub access_token: Option<String>,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "token_type")]
    pub token_type: Option<String>,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Option<Box<AuthResponse>>,
}

impl AuthResponse {
    #[must_use]
    pub fn into_flat(mut self) -> Self {
        if let Some(data) = self.data.take() {
            let data = data.into_flat();
            self.user = self.user.or(data.user);
            self.access_token = self.access_token.or(data.access_token);
            self.refresh_token = self.refresh_token.or(data.refresh_token);
            self.token_type = self.token_type.or(data.token_type);
            self.session_id = self.session_id.or(data.session_id);
            self.message = self.message.or(data.message);
        }
        self
    }

    /// Absent `success` counts as success; only an explicit `false` fails.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.success != Some(false)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|reason| !reason.trim().is_empty())
    }

    /// Both durable tokens, when the response carries them.
    #[must_use]
    pub fn tokens(&self) -> Option<AuthTokens> {
        let access = self.access_token.as_deref().filter(|t| !t.is_empty())?;
        let refresh = self.refresh_token.as_deref().filter(|t| !t.is_empty())?;
        let mut tokens = AuthTokens::bearer(access, refresh);
        if let Some(token_type) = self.token_type.as_deref().filter(|t| !t.is_empty()) {
            tokens.token_type = token_type.to_string();
        }
        Some(tokens)
    }
}

pub trait AuthApi: Send + Sync + 'static {
    fn login(
        &self,
        credentials: &LoginCredentials,
    ) -> impl Future<Output = Result<AuthResponse, ApiError>> + Send;

    /// Without a refresh token the cookie jar carries it.
    fn refresh(
        &self,
        refresh_token: Option<&str>,
    ) -> impl Future<Output = Result<AuthResponse, ApiError>> + Send;

    /// "Who am I".
    fn current_user(
        &self,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<User, ApiError>> + Send;

    fn logout(&self, access_token: Option<&str>)
        -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Mint a hand-off token whose audience is `audience`.
    fn issue_handoff(
        &self,
        audience: &str,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: Client,
    base_url: String,
    domain: String,
}

impl HttpAuthApi {
    /// # Errors
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .cookie_store(true)
            .timeout(config.timeout)
            .build()
            .map_err(|err| ApiError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Reuse an existing client (and its cookie jar).
    #[must_use]
    pub fn with_client(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            domain: config.domain.clone(),
        }
    }

    #[must_use]
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn decorate(&self, request: RequestBuilder, access_token: Option<&str>) -> RequestBuilder {
        let request = request
            .header(CLIENT_DOMAIN_HEADER, self.domain.as_str())
            .header("X-Requested-With", "XMLHttpRequest");
        match access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl AuthApi for HttpAuthApi {
    #[instrument(skip_all)]
    async fn login(&self, credentials: &LoginCredentials) -> Result<AuthResponse, ApiError> {
        let body = json!({
            "email": credentials.email,
            "password": credentials.password.expose_secret(),
        });
        let response = send(self.decorate(self.client.post(self.url(LOGIN_PATH)), None).json(&body))
            .await?;
        json_response::<AuthResponse>(response)
            .await
            .map(AuthResponse::into_flat)
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: Option<&str>) -> Result<AuthResponse, ApiError> {
        let mut request = self.decorate(self.client.post(self.url(REFRESH_PATH)), None);
        if let Some(token) = refresh_token {
            request = request.json(&json!({ "refreshToken": token }));
        }
        let response = send(request).await?;
        json_response::<AuthResponse>(response)
            .await
            .map(AuthResponse::into_flat)
    }

    #[instrument(skip_all)]
    async fn current_user(&self, access_token: Option<&str>) -> Result<User, ApiError> {
        let response = send(self.decorate(self.client.get(self.url(ME_PATH)), access_token)).await?;
        let value: Value = json_response(response).await?;
        extract_user(&value).ok_or_else(|| ApiError::Parse("Response did not contain a user".to_string()))
    }

    #[instrument(skip_all)]
    async fn logout(&self, access_token: Option<&str>) -> Result<(), ApiError> {
        let response =
            send(self.decorate(self.client.post(self.url(LOGOUT_PATH)), access_token)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(http_error(response).await)
        }
    }

    #[instrument(skip(self, access_token))]
    async fn issue_handoff(&self, audience: &str, access_token: Option<&str>) -> Result<String, ApiError> {
        let request = self
            .decorate(self.client.post(self.url(HANDOFF_PATH)), access_token)
            .json(&json!({ "audience": audience }));
        let value: Value = json_response(send(request).await?).await?;
        ["token", "handoffToken"]
            .iter()
            .find_map(|key| {
                value
                    .get(key)
                    .or_else(|| value.get("data").and_then(|data| data.get(key)))
                    .and_then(Value::as_str)
                    .filter(|token| !token.is_empty())
            })
            .map(str::to_string)
            .ok_or_else(|| ApiError::Parse("Response did not contain a hand-off token".to_string()))
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    request
        .send()
        .await
        .map_err(|err| ApiError::Network(err.to_string()))
}

async fn json_response<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, ApiError> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Parse(format!("Failed to decode response: {err}")))
    } else {
        Err(http_error(response).await)
    }
}

async fn http_error(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    debug!("backend responded {}", status);
    ApiError::Http {
        status,
        message: error_message(&body),
    }
}

/// `message`/`error` from a JSON body, else the trimmed and truncated text.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["message", "error"]
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
    });
    if let Some(message) = from_json.filter(|m| !m.trim().is_empty()) {
        return message.chars().take(MAX_ERROR_CHARS).collect();
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Request failed.".to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_CHARS).collect()
    }
}

/// Accepts `{user}`, `{data: {user}}`, `{data: user}`, or a bare user object.
fn extract_user(value: &Value) -> Option<User> {
    [
        value.get("user"),
        value.get("data").and_then(|data| data.get("user")),
        value.get("data"),
        Some(value),
    ]
    .into_iter()
    .flatten()
    .find_map(|candidate| serde_json::from_value::<User>(candidate.clone()).ok())
}
