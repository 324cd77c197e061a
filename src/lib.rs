//! # ssogate (Cross-domain SSO and token lifecycle)
//!
//! `ssogate` lets a user who signed in on the main web property become signed in
//! on a separate dashboard subdomain without typing credentials again, and keeps
//! the resulting access/refresh tokens valid while many callers use them at once.
//!
//! ## Server half
//!
//! - **Hand-off exchange** (`GET /sso/receive?token=`): verifies a short-lived
//!   HS256 hand-off token, checks its audience against the dashboard host, asks
//!   the backend to validate it, and converts it into `HttpOnly` cookies. Every
//!   failure becomes a redirect to the login page with a machine-readable code.
//! - **Auth proxy** (`/api/auth/login`, `/api/auth/refresh`, `/api/auth/logout`):
//!   forwards credentials, cookies, and the XSRF header to the backend and relays
//!   every `Set-Cookie` header back to the browser.
//!
//! ## Client half
//!
//! - [`client::lifecycle::TokenLifecycleManager`]: login, single-flight refresh
//!   with identity pinning, logout, and cached-session revalidation.
//! - [`client::csrf::CsrfTokenCache`]: per-domain anti-forgery tokens with a
//!   credentialed, anonymous, then local fallback chain.
//! - [`client::guard::SessionGuard`]: route-level gate that never renders or
//!   redirects while auth state is loading.
//! - [`client::sync::CrossDomainSync`]: typed login/logout propagation to
//!   sibling domains and other tabs.
//!
//! Cookie aliases are issued for both access and refresh tokens so backends that
//! expect either naming scheme keep working. In production the cookies are scoped
//! to the apex domain so every subdomain shares them.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
