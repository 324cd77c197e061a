//! Configuration resolved once at startup and injected into the server state.
//!
//! Endpoint URLs, the SSO secret, the expected audience host, and the cookie
//! policy all live here so handlers never branch on the environment themselves.

use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, str::FromStr, time::Duration};
use url::Url;

const DEFAULT_ACCESS_COOKIE_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_COOKIE_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_BACKEND_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_LOGIN_URL: &str = "/login";

/// Deployment flavour. Only affects cookie attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "local" => Ok(Self::Development),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

/// Cookie attributes for the alias pairs.
///
/// Production cookies are shared across subdomains through the apex `Domain`
/// attribute and must be `SameSite=None; Secure` so the exchange page can be
/// framed by the main site. Development cookies stay host-only and `Lax`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookiePolicy {
    Production { apex_domain: String },
    Development,
}

impl CookiePolicy {
    #[must_use]
    pub fn same_site(&self) -> &'static str {
        match self {
            Self::Production { .. } => "None",
            Self::Development => "Lax",
        }
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        matches!(self, Self::Production { .. })
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::Production { apex_domain } => Some(apex_domain),
            Self::Development => None,
        }
    }

    /// Build the policy for `environment`, deriving the apex domain from the
    /// dashboard host when no explicit cookie domain is given.
    ///
    /// # Errors
    /// Returns an error when production is selected and no apex can be derived.
    pub fn resolve(
        environment: Environment,
        cookie_domain: Option<&str>,
        expected_host: &str,
    ) -> Result<Self> {
        match environment {
            Environment::Development => Ok(Self::Development),
            Environment::Production => {
                let apex = match cookie_domain.map(str::trim).filter(|d| !d.is_empty()) {
                    Some(domain) => domain.trim_start_matches('.').to_string(),
                    None => apex_domain(expected_host).ok_or_else(|| {
                        anyhow!("cannot derive cookie domain from host: {expected_host}")
                    })?,
                };
                Ok(Self::Production { apex_domain: apex })
            }
        }
    }
}

/// `dashboard.example.com` -> `example.com`. Hosts with fewer than two labels
/// (or with a port) have no apex.
#[must_use]
pub fn apex_domain(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.');
    if host.is_empty() || host.contains(':') {
        return None;
    }
    let labels: Vec<&str> = host.split('.').filter(|label| !label.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join(".").to_lowercase())
}

#[derive(Clone)]
pub struct SsoConfig {
    api_base_url: String,
    signing_secret: SecretString,
    expected_host: String,
    cookie_policy: CookiePolicy,
    login_url: String,
    allowed_origins: Vec<String>,
    access_cookie_ttl_seconds: i64,
    refresh_cookie_ttl_seconds: i64,
    backend_timeout: Duration,
}

impl SsoConfig {
    /// # Errors
    /// Returns an error when the API base URL is not an absolute http(s) URL,
    /// the secret is empty, or the expected host is blank.
    pub fn new(
        api_base_url: &str,
        signing_secret: SecretString,
        expected_host: &str,
    ) -> Result<Self> {
        let parsed = Url::parse(api_base_url)
            .with_context(|| format!("Invalid API base URL: {api_base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("API base URL must be http(s): {api_base_url}"));
        }
        if signing_secret.expose_secret().is_empty() {
            return Err(anyhow!("SSO signing secret must not be empty"));
        }
        let expected_host = expected_host.trim().to_lowercase();
        if expected_host.is_empty() {
            return Err(anyhow!("Expected dashboard host must not be empty"));
        }

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            signing_secret,
            expected_host,
            cookie_policy: CookiePolicy::Development,
            login_url: DEFAULT_LOGIN_URL.to_string(),
            allowed_origins: Vec::new(),
            access_cookie_ttl_seconds: DEFAULT_ACCESS_COOKIE_TTL_SECONDS,
            refresh_cookie_ttl_seconds: DEFAULT_REFRESH_COOKIE_TTL_SECONDS,
            backend_timeout: Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECONDS),
        })
    }

    #[must_use]
    pub fn with_cookie_policy(mut self, policy: CookiePolicy) -> Self {
        self.cookie_policy = policy;
        self
    }

    #[must_use]
    pub fn with_login_url(mut self, login_url: String) -> Self {
        self.login_url = login_url;
        self
    }

    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    #[must_use]
    pub fn with_access_cookie_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_cookie_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_cookie_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_cookie_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    #[must_use]
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    /// Backend URL for `path` (which must start with `/`).
    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    #[must_use]
    pub fn signing_secret(&self) -> &[u8] {
        self.signing_secret.expose_secret().as_bytes()
    }

    #[must_use]
    pub fn expected_host(&self) -> &str {
        &self.expected_host
    }

    #[must_use]
    pub fn cookie_policy(&self) -> &CookiePolicy {
        &self.cookie_policy
    }

    #[must_use]
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    #[must_use]
    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    #[must_use]
    pub fn access_cookie_ttl_seconds(&self) -> i64 {
        self.access_cookie_ttl_seconds
    }

    #[must_use]
    pub fn refresh_cookie_ttl_seconds(&self) -> i64 {
        self.refresh_cookie_ttl_seconds
    }

    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }
}

impl fmt::Debug for SsoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoConfig")
            .field("api_base_url", &self.api_base_url)
            .field("signing_secret", &"***")
            .field("expected_host", &self.expected_host)
            .field("cookie_policy", &self.cookie_policy)
            .field("login_url", &self.login_url)
            .field("allowed_origins", &self.allowed_origins)
            .field("access_cookie_ttl_seconds", &self.access_cookie_ttl_seconds)
            .field("refresh_cookie_ttl_seconds", &self.refresh_cookie_ttl_seconds)
            .field("backend_timeout", &self.backend_timeout)
            .finish()
    }
}
