//! `Set-Cookie` construction for the access/refresh alias pairs.

use crate::config::{CookiePolicy, SsoConfig};
use axum::http::{header::InvalidHeaderValue, HeaderValue};
use thiserror::Error;

/// Both names are issued so backends expecting either scheme keep working.
pub const ACCESS_COOKIE_NAMES: [&str; 2] = ["dashboard_access_token", "access_token"];
pub const REFRESH_COOKIE_NAMES: [&str; 2] = ["dashboard_refresh_token", "refresh_token"];

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie value for {0} is empty or contains forbidden characters")]
    InvalidValue(&'static str),
    #[error("cookie header is not valid: {0}")]
    Header(#[from] InvalidHeaderValue),
}

/// RFC 6265 `cookie-octet`.
fn is_cookie_octet(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x2B' | '\x2D'..='\x3A' | '\x3C'..='\x5B' | '\x5D'..='\x7E')
}

fn format_cookie(name: &str, value: &str, max_age: i64, policy: &CookiePolicy) -> String {
    let mut cookie = format!(
        "{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite={}",
        policy.same_site()
    );
    if policy.secure() {
        cookie.push_str("; Secure");
    }
    if let Some(domain) = policy.domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    cookie
}

/// Build one `HttpOnly` cookie under `policy`.
///
/// # Errors
/// Returns an error if the value is empty or not a valid cookie octet string.
pub fn build_cookie(
    name: &'static str,
    value: &str,
    max_age: i64,
    policy: &CookiePolicy,
) -> Result<HeaderValue, CookieError> {
    if value.is_empty() || !value.chars().all(is_cookie_octet) {
        return Err(CookieError::InvalidValue(name));
    }
    Ok(HeaderValue::from_str(&format_cookie(
        name, value, max_age, policy,
    ))?)
}

/// The four session cookies, access aliases first.
///
/// # Errors
/// Returns an error if either token cannot be carried in a cookie.
pub fn session_cookies(
    access_token: &str,
    refresh_token: &str,
    config: &SsoConfig,
) -> Result<Vec<HeaderValue>, CookieError> {
    let policy = config.cookie_policy();
    let mut cookies = Vec::with_capacity(ACCESS_COOKIE_NAMES.len() + REFRESH_COOKIE_NAMES.len());
    for name in ACCESS_COOKIE_NAMES {
        cookies.push(build_cookie(
            name,
            access_token,
            config.access_cookie_ttl_seconds(),
            policy,
        )?);
    }
    for name in REFRESH_COOKIE_NAMES {
        cookies.push(build_cookie(
            name,
            refresh_token,
            config.refresh_cookie_ttl_seconds(),
            policy,
        )?);
    }
    Ok(cookies)
}

/// Expire all four aliases.
///
/// # Errors
/// Returns an error if the configured cookie domain is not a valid header value.
pub fn clearing_cookies(policy: &CookiePolicy) -> Result<Vec<HeaderValue>, CookieError> {
    ACCESS_COOKIE_NAMES
        .iter()
        .chain(REFRESH_COOKIE_NAMES.iter())
        .map(|name| {
            HeaderValue::from_str(&format_cookie(name, "", 0, policy)).map_err(CookieError::from)
        })
        .collect()
}
