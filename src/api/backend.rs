//! Backend REST API client used by the server half.
//!
//! Two jobs: validate hand-off tokens during the exchange, and forward auth
//! calls (login, refresh, logout) with the browser's cookies and XSRF header,
//! relaying every `Set-Cookie` the backend returns.

use crate::{client::types::User, config::SsoConfig, APP_USER_AGENT};
use axum::{
    body::Bytes,
    http::{
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
};
use reqwest::{redirect::Policy, Client};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const SSO_VALIDATE_PATH: &str = "/auth/sso/validate";
pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh-token";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Request headers relayed from the browser to the backend.
const FORWARDED_HEADERS: [&str; 4] = ["x-xsrf-token", "x-csrf-token", "x-requested-with", "accept"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to build backend client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("backend request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("backend response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SsoValidateBody {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "access_token")]
    access_token: Option<String>,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<serde_json::Value>,
    #[serde(default, alias = "session_id")]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Outcome of asking the backend to validate a hand-off token.
#[derive(Debug)]
pub enum SsoValidation {
    Accepted {
        access_token: String,
        refresh_token: String,
        user: Option<User>,
        session_id: Option<String>,
    },
    /// Non-2xx or `success: false`; replayed tokens land here.
    Rejected {
        status: StatusCode,
        message: Option<String>,
    },
    /// Backend said yes but omitted one of the durable tokens.
    MissingTokens,
}

/// A backend response relayed verbatim to the browser.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub set_cookies: Vec<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct BackendClient {
    client: Client,
    config: Arc<SsoConfig>,
}

impl BackendClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: Arc<SsoConfig>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.backend_timeout())
            .redirect(Policy::none())
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn config(&self) -> &SsoConfig {
        &self.config
    }

    /// Forward the raw hand-off token to the backend for single-use validation.
    ///
    /// # Errors
    /// Returns `Transport` on network failure and `Decode` when a 2xx body is not
    /// the expected JSON.
    #[instrument(skip_all)]
    pub async fn validate_handoff(&self, token: &str) -> Result<SsoValidation, BackendError> {
        let url = self.config.api_url(SSO_VALIDATE_PATH);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(BackendError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<SsoValidateBody>()
                .await
                .ok()
                .and_then(|body| body.message);
            debug!("SSO validation rejected: {}", status);
            return Ok(SsoValidation::Rejected { status, message });
        }

        let body: SsoValidateBody = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;

        if !body.success {
            return Ok(SsoValidation::Rejected {
                status,
                message: body.message,
            });
        }

        let (Some(access_token), Some(refresh_token)) = (
            body.access_token.filter(|t| !t.is_empty()),
            body.refresh_token.filter(|t| !t.is_empty()),
        ) else {
            return Ok(SsoValidation::MissingTokens);
        };

        let user = body.user.and_then(|value| match serde_json::from_value::<User>(value) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!("SSO validation returned an unrecognised user shape: {err}");
                None
            }
        });

        Ok(SsoValidation::Accepted {
            access_token,
            refresh_token,
            user,
            session_id: body.session_id,
        })
    }

    /// Forward an auth call with the browser's cookies and XSRF header.
    ///
    /// # Errors
    /// Returns `Transport` when the backend cannot be reached or the body cannot be read.
    #[instrument(skip(self, headers, body))]
    pub async fn forward(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<ForwardedResponse, BackendError> {
        let url = self.config.api_url(path);
        let mut request = self.client.post(&url);

        for value in headers.get_all(COOKIE) {
            request = request.header(COOKIE, value.clone());
        }
        for name in FORWARDED_HEADERS {
            if let Some(value) = headers.get(HeaderName::from_static(name)) {
                request = request.header(name, value.clone());
            }
        }

        if let Some(body) = body.filter(|b| !b.is_empty()) {
            let content_type = headers
                .get(CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/json"));
            request = request.header(CONTENT_TYPE, content_type).body(body);
        }

        let response = request.send().await.map_err(BackendError::Transport)?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let set_cookies = collect_set_cookies(response.headers());
        let body = response.bytes().await.map_err(BackendError::Transport)?;

        debug!("backend {} responded {} with {} cookies", path, status, set_cookies.len());

        Ok(ForwardedResponse {
            status,
            content_type,
            set_cookies,
            body,
        })
    }
}

/// Every `Set-Cookie` value in order, dropping exact duplicates.
pub(crate) fn collect_set_cookies(headers: &HeaderMap) -> Vec<HeaderValue> {
    let mut cookies: Vec<HeaderValue> = Vec::new();
    for value in headers.get_all(SET_COOKIE) {
        if !cookies.contains(value) {
            cookies.push(value.clone());
        }
    }
    cookies
}
