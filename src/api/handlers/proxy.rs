//! Same-origin auth proxy.
//!
//! The browser talks to `/api/auth/*` on the dashboard host; these handlers
//! forward the call with its cookies and XSRF header and relay the backend's
//! status, body, and every `Set-Cookie` header untouched.

use crate::api::{
    backend::{BackendClient, BackendError, ForwardedResponse, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH},
    handlers::cookies::clearing_cookies,
};
use axum::{
    body::{Body, Bytes},
    extract::Extension,
    http::{
        header::{CONTENT_TYPE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

pub const PROXY_ERROR: &str = "PROXY_ERROR";

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ProxyErrorBody {
    success: bool,
    error: String,
    message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Backend login response relayed with its cookies"),
        (status = 503, description = "Backend unreachable", body = ProxyErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    backend: Extension<Arc<BackendClient>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(backend.forward(LOGIN_PATH, &headers, Some(body)).await, Vec::new())
}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    responses(
        (status = 200, description = "Backend refresh response relayed with its cookies"),
        (status = 503, description = "Backend unreachable", body = ProxyErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(backend: Extension<Arc<BackendClient>>, headers: HeaderMap) -> Response {
    relay(backend.forward(REFRESH_PATH, &headers, None).await, Vec::new())
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 200, description = "Backend logout relayed; session cookies cleared"),
        (status = 503, description = "Backend unreachable; session cookies cleared", body = ProxyErrorBody)
    ),
    tag = "auth"
)]
pub async fn logout(backend: Extension<Arc<BackendClient>>, headers: HeaderMap) -> Response {
    let clearing = clearing_cookies(backend.config().cookie_policy()).unwrap_or_else(|err| {
        error!("Failed to build clearing cookies: {}", err);
        Vec::new()
    });
    relay(backend.forward(LOGOUT_PATH, &headers, None).await, clearing)
}

fn relay(result: Result<ForwardedResponse, BackendError>, extra_cookies: Vec<HeaderValue>) -> Response {
    let mut response = match result {
        Ok(forwarded) => {
            let mut response = Response::new(Body::from(forwarded.body));
            *response.status_mut() = forwarded.status;
            if let Some(content_type) = forwarded.content_type {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            for cookie in forwarded.set_cookies {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            response
        }
        Err(err) => {
            warn!("Auth proxy failed: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ProxyErrorBody {
                    success: false,
                    error: PROXY_ERROR.to_string(),
                    message: "Authentication service is unavailable".to_string(),
                }),
            )
                .into_response()
        }
    };

    for cookie in extra_cookies {
        response.headers_mut().append(SET_COOKIE, cookie);
    }

    response
}
