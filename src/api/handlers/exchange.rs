//! `GET /sso/receive?token=<handoff>`: turn a hand-off token into session cookies.
//!
//! Every failure is a `303` to the login page with `?error=<code>` and never
//! sets a cookie. Success is a small HTML page that stores a token-free auth
//! snapshot, strips `token` from history, and tells an embedding parent window
//! how it went. A failure inside a frame (`Sec-Fetch-Dest: iframe`) gets the
//! same page carrying `{sso: "error"}` instead of the redirect, so the parent
//! hears about it.
//!
//! Messages are only posted to the configured allowed origins; a parent on
//! any other origin receives nothing.

use crate::{
    api::{
        backend::{BackendClient, BackendError, SsoValidation},
        handlers::cookies::{session_cookies, CookieError},
    },
    client::{storage::AUTH_STORAGE_KEY, sync::SsoMessage, types::StoredAuth},
    token::{verify_hs256, HandoffError},
};
use axum::{
    extract::{rejection::QueryRejection, Extension, Query},
    http::{
        header::{CACHE_CONTROL, LOCATION, REFERRER_POLICY, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use utoipa::IntoParams;

const FALLBACK_LOGIN_URL: &str = "/login";
const SEC_FETCH_DEST: &str = "sec-fetch-dest";

const PAGE_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><meta name="robots" content="noindex"><title>Signing in</title></head>
<body>
<script>
(function () {
  var snapshot = __SNAPSHOT__;
  var message = __MESSAGE__;
  var targets = __TARGETS__;
  var fallback = __FALLBACK__;
  if (snapshot) {
    try { window.sessionStorage.setItem(__STORAGE_KEY__, JSON.stringify(snapshot)); } catch (e) {}
  }
  try {
    var url = new URL(window.location.href);
    url.searchParams.delete("token");
    window.history.replaceState(window.history.state, "", url.pathname + url.search + url.hash);
  } catch (e) {}
  if (window.parent && window.parent !== window) {
    for (var i = 0; i < targets.length; i++) {
      try { window.parent.postMessage(message, targets[i]); } catch (e) {}
    }
  } else {
    window.location.replace(fallback);
  }
})();
</script>
</body>
</html>
"#;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReceiveQuery {
    /// Signed hand-off token minted by the issuing domain.
    pub token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("hand-off token missing")]
    MissingToken,
    #[error("hand-off token rejected: {0}")]
    InvalidToken(#[from] HandoffError),
    #[error("hand-off audience does not include {0}")]
    InvalidAudience(String),
    #[error("backend rejected hand-off with status {0}")]
    ValidationFailed(StatusCode),
    #[error("backend accepted hand-off without tokens")]
    NoTokens,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unexpected exchange failure: {0}")]
    Unexpected(String),
}

impl ExchangeError {
    /// Machine-readable reason appended to the login redirect.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::InvalidAudience(_) => "invalid_audience",
            Self::ValidationFailed(_) => "validation_failed",
            Self::NoTokens => "no_tokens",
            Self::Backend(_) => "backend_error",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

impl From<CookieError> for ExchangeError {
    fn from(err: CookieError) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

#[utoipa::path(
    get,
    path = "/sso/receive",
    params(ReceiveQuery),
    responses(
        (status = 200, description = "Hand-off accepted and session cookies set, or a framed failure reported to the parent window", content_type = "text/html"),
        (status = 303, description = "Hand-off rejected; redirect to login with ?error=<code>")
    ),
    tag = "sso"
)]
pub async fn receive(
    backend: Extension<Arc<BackendClient>>,
    headers: HeaderMap,
    query: Result<Query<ReceiveQuery>, QueryRejection>,
) -> Response {
    let token = query.ok().and_then(|Query(query)| query.token);

    match exchange(&backend, token).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ExchangeError::Backend(_) | ExchangeError::Unexpected(_) => {
                    error!("SSO exchange failed: {}", err);
                }
                _ => warn!("SSO exchange rejected: {}", err),
            }
            if is_framed(&headers) {
                framed_failure(&backend, err.code())
            } else {
                failure_redirect(backend.config().login_url(), err.code())
            }
        }
    }
}

fn is_framed(headers: &HeaderMap) -> bool {
    headers
        .get(SEC_FETCH_DEST)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|dest| dest.eq_ignore_ascii_case("iframe") || dest.eq_ignore_ascii_case("frame"))
}

fn framed_failure(backend: &BackendClient, code: &str) -> Response {
    let config = backend.config();
    let message = SsoMessage::error(config.expected_host());
    let fallback = failure_location(config.login_url(), code);

    match render_page(None, &message, config.allowed_origins(), &fallback) {
        Ok(page) => {
            let mut response = Html(page).into_response();
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        Err(err) => {
            error!("failed to render SSO error page: {}", err);
            failure_redirect(config.login_url(), code)
        }
    }
}

#[instrument(skip_all)]
async fn exchange(backend: &BackendClient, token: Option<String>) -> Result<Response, ExchangeError> {
    let token = token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ExchangeError::MissingToken)?;

    let config = backend.config();
    let claims = verify_hs256(token, config.signing_secret(), Utc::now().timestamp())?;
    if !claims.audience_allows(config.expected_host()) {
        return Err(ExchangeError::InvalidAudience(
            config.expected_host().to_string(),
        ));
    }

    let (access_token, refresh_token, user, session_id) =
        match backend.validate_handoff(token).await? {
            SsoValidation::Accepted {
                access_token,
                refresh_token,
                user,
                session_id,
            } => (access_token, refresh_token, user, session_id),
            SsoValidation::Rejected { status, message } => {
                debug!("backend rejection message: {:?}", message);
                return Err(ExchangeError::ValidationFailed(status));
            }
            SsoValidation::MissingTokens => return Err(ExchangeError::NoTokens),
        };

    let cookies = session_cookies(&access_token, &refresh_token, config)?;

    let snapshot = StoredAuth {
        user: user.clone(),
        tokens: None,
        session_id: session_id.or(claims.sid),
        domain: config.expected_host().to_string(),
        stored_at: Utc::now().timestamp_millis(),
    };
    let message = SsoMessage::ok(user, config.expected_host());
    let page = render_page(Some(&snapshot), &message, config.allowed_origins(), "/")?;

    let mut response = Html(page).into_response();
    let headers = response.headers_mut();
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));

    info!("SSO exchange completed for {}", config.expected_host());

    Ok(response)
}

fn render_page(
    snapshot: Option<&StoredAuth>,
    message: &SsoMessage,
    allowed_origins: &[String],
    fallback: &str,
) -> Result<String, ExchangeError> {
    let snapshot = escape_script_json(&serde_json::to_string(&snapshot)?);
    let message = escape_script_json(&serde_json::to_string(message)?);
    let targets = escape_script_json(&serde_json::to_string(&message_targets(allowed_origins))?);
    let fallback = escape_script_json(&serde_json::to_string(fallback)?);
    let storage_key = escape_script_json(&serde_json::to_string(AUTH_STORAGE_KEY)?);

    Ok(PAGE_TEMPLATE
        .replace("__STORAGE_KEY__", &storage_key)
        .replace("__TARGETS__", &targets)
        .replace("__FALLBACK__", &fallback)
        .replace("__SNAPSHOT__", &snapshot)
        .replace("__MESSAGE__", &message))
}

/// Serialized origins a parent window may receive messages on. Anything that
/// is not a tuple origin (`*`, `null`, garbage) is dropped.
fn message_targets(allowed_origins: &[String]) -> Vec<String> {
    allowed_origins
        .iter()
        .filter_map(|origin| Url::parse(origin.trim()).ok())
        .map(|url| url.origin().ascii_serialization())
        .filter(|origin| origin != "null")
        .fold(Vec::new(), |mut targets, origin| {
            if !targets.contains(&origin) {
                targets.push(origin);
            }
            targets
        })
}

/// Make serialized JSON safe to inline in a `<script>` element.
pub(crate) fn escape_script_json(json: &str) -> String {
    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => escaped.push_str("\\u003c"),
            '>' => escaped.push_str("\\u003e"),
            '&' => escaped.push_str("\\u0026"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn failure_location(login_url: &str, code: &str) -> String {
    let separator = if login_url.contains('?') { '&' } else { '?' };
    format!("{login_url}{separator}error={code}")
}

fn failure_redirect(login_url: &str, code: &str) -> Response {
    let location = HeaderValue::from_str(&failure_location(login_url, code)).unwrap_or_else(|_| {
        error!("login URL is not a valid Location header: {}", login_url);
        HeaderValue::from_str(&failure_location(FALLBACK_LOGIN_URL, code))
            .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_LOGIN_URL))
    });

    (
        StatusCode::SEE_OTHER,
        [
            (LOCATION, location),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        api::{backend::SSO_VALIDATE_PATH, router},
        config::{CookiePolicy, SsoConfig},
        token::{sign_hs256, Audience, HandoffClaims},
    };
    use axum::{
        body::{to_bytes, Body},
        http::Request,
        Router,
    };
    use secrecy::SecretString;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "exchange-test-secret";
    const HOST: &str = "dashboard.example.com";
    const PARENT_ORIGIN: &str = "https://www.example.com";

    fn app(api_base_url: &str, login_url: &str) -> Router {
        let config = SsoConfig::new(api_base_url, SecretString::from(SECRET.to_string()), HOST)
            .unwrap()
            .with_login_url(login_url.to_string())
            .with_allowed_origins(vec![PARENT_ORIGIN.to_string()])
            .with_cookie_policy(CookiePolicy::Production {
                apex_domain: "example.com".to_string(),
            });
        let backend = BackendClient::new(Arc::new(config)).unwrap();
        router(Arc::new(backend)).unwrap()
    }

    fn handoff(audience: &str, ttl: i64) -> String {
        let claims = HandoffClaims::new("u1", Utc::now().timestamp(), ttl)
            .with_audience(Audience::One(audience.to_string()));
        sign_hs256(SECRET.as_bytes(), &claims).unwrap()
    }

    async fn receive_with(app: Router, query: &str) -> Response {
        app.oneshot(
            Request::builder()
                .uri(format!("/sso/receive{query}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    fn assert_rejected(response: &Response, code: &str) {
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(response), format!("/login?error={code}"));
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    async fn validate_mock(server: &MockServer, response: ResponseTemplate, expected: u64) {
        Mock::given(method("POST"))
            .and(path(SSO_VALIDATE_PATH))
            .respond_with(response)
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn valid_handoff_sets_alias_cookies() {
        let server = MockServer::start().await;
        validate_mock(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "accessToken": "access-value",
                "refreshToken": "refresh-value",
                "user": { "id": "u1", "email": "u1@example.com", "name": "</script><b>" }
            })),
            1,
        )
        .await;

        let token = handoff(HOST, 60);
        let response = receive_with(app(&server.uri(), "/login"), &format!("?token={token}")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 4);
        assert!(cookies[0].starts_with("dashboard_access_token=access-value;"));
        assert!(cookies[3].starts_with("refresh_token=refresh-value;"));
        assert!(cookies.iter().all(|c| c.contains("Domain=example.com")));
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(AUTH_STORAGE_KEY));
        assert!(body.contains("replaceState"));
        assert!(!body.contains("access-value"));
        assert!(!body.contains("refresh-value"));
        assert_eq!(body.matches("</script>").count(), 1);
        assert!(body.contains(&format!(r#"var targets = ["{PARENT_ORIGIN}"];"#)));
        assert!(!body.contains(r#""*""#));
    }

    #[tokio::test]
    async fn framed_failure_reports_error_to_parent() {
        let server = MockServer::start().await;
        validate_mock(&server, ResponseTemplate::new(200), 0).await;

        let response = app(&server.uri(), "/login")
            .oneshot(
                Request::builder()
                    .uri("/sso/receive")
                    .header(SEC_FETCH_DEST, "iframe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_none());
        assert!(response.headers().get(LOCATION).is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(r#""sso":"error""#));
        assert!(body.contains(r#"var snapshot = null;"#));
        assert!(body.contains(r#"var fallback = "/login?error=missing_token";"#));
        assert!(body.contains(&format!(r#"var targets = ["{PARENT_ORIGIN}"];"#)));
    }

    #[test]
    fn message_targets_are_exact_origins() {
        let origins = [
            "https://www.example.com/app/".to_string(),
            "*".to_string(),
            "https://www.example.com".to_string(),
            "http://localhost:3000".to_string(),
            "data:text/plain,hi".to_string(),
        ];
        assert_eq!(
            message_targets(&origins),
            ["https://www.example.com", "http://localhost:3000"]
        );
        assert!(message_targets(&[]).is_empty());
    }

    #[tokio::test]
    async fn missing_or_blank_token_redirects() {
        let server = MockServer::start().await;
        validate_mock(&server, ResponseTemplate::new(200), 0).await;

        assert_rejected(&receive_with(app(&server.uri(), "/login"), "").await, "missing_token");
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), "?token=%20").await,
            "missing_token",
        );
    }

    #[tokio::test]
    async fn tampered_and_expired_tokens_redirect() {
        let server = MockServer::start().await;
        validate_mock(&server, ResponseTemplate::new(200), 0).await;

        let token = handoff(HOST, 60);
        let tampered = format!("{}x", token);
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), &format!("?token={tampered}")).await,
            "invalid_token",
        );

        let expired = handoff(HOST, -5);
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), &format!("?token={expired}")).await,
            "invalid_token",
        );
    }

    #[tokio::test]
    async fn wrong_audience_redirects() {
        let server = MockServer::start().await;
        validate_mock(&server, ResponseTemplate::new(200), 0).await;

        let token = handoff("evil.example.net", 60);
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), &format!("?token={token}")).await,
            "invalid_audience",
        );
    }

    #[tokio::test]
    async fn replayed_token_is_validation_failed() {
        let server = MockServer::start().await;
        validate_mock(
            &server,
            ResponseTemplate::new(401).set_body_json(json!({
                "success": false,
                "message": "token already used"
            })),
            1,
        )
        .await;

        let token = handoff(HOST, 60);
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), &format!("?token={token}")).await,
            "validation_failed",
        );
    }

    #[tokio::test]
    async fn backend_without_tokens_is_no_tokens() {
        let server = MockServer::start().await;
        validate_mock(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({ "success": true })),
            1,
        )
        .await;

        let token = handoff(HOST, 60);
        assert_rejected(
            &receive_with(app(&server.uri(), "/login"), &format!("?token={token}")).await,
            "no_tokens",
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_backend_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let token = handoff(HOST, 60);
        assert_rejected(
            &receive_with(app(&uri, "/login"), &format!("?token={token}")).await,
            "backend_error",
        );
    }

    #[tokio::test]
    async fn login_url_with_query_appends_error() {
        let server = MockServer::start().await;
        let response = receive_with(app(&server.uri(), "/login?next=%2F"), "").await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login?next=%2F&error=missing_token");
    }

    #[test]
    fn script_json_cannot_close_the_element() {
        let escaped = escape_script_json(r#"{"name":"</script><script>alert(1)&"}"#);
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('>'));
        assert!(!escaped.contains('&'));
        assert!(escaped.contains("\\u003c/script\\u003e"));
    }

    #[test]
    fn error_codes_are_distinct() {
        let codes = [
            ExchangeError::MissingToken.code(),
            ExchangeError::InvalidToken(HandoffError::Expired).code(),
            ExchangeError::InvalidAudience(HOST.to_string()).code(),
            ExchangeError::ValidationFailed(StatusCode::UNAUTHORIZED).code(),
            ExchangeError::NoTokens.code(),
            ExchangeError::Backend(BackendError::Decode(String::new())).code(),
            ExchangeError::Unexpected(String::new()).code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }
}
