use crate::{
    api,
    config::{CookiePolicy, Environment, SsoConfig},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub api_base_url: String,
    pub sso_secret: SecretString,
    pub expected_host: String,
    pub environment: Environment,
    pub cookie_domain: Option<String>,
    pub login_url: String,
    pub allowed_origins: Vec<String>,
    pub backend_timeout_seconds: u64,
}

impl Args {
    /// Resolve the runtime configuration.
    ///
    /// # Errors
    /// Returns an error if the cookie policy cannot be derived or the backend
    /// URL, secret, or host are invalid.
    pub fn into_config(self) -> Result<SsoConfig> {
        let policy = CookiePolicy::resolve(
            self.environment,
            self.cookie_domain.as_deref(),
            &self.expected_host,
        )
        .context("Invalid cookie configuration")?;

        let config = SsoConfig::new(&self.api_base_url, self.sso_secret, &self.expected_host)
            .context("Invalid SSO configuration")?
            .with_cookie_policy(policy)
            .with_login_url(self.login_url)
            .with_allowed_origins(self.allowed_origins)
            .with_backend_timeout(Duration::from_secs(self.backend_timeout_seconds));

        Ok(config)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let port = args.port;
    let config = args.into_config()?;

    api::new(port, config).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("api_base_url", args.api_base_url.clone()),
        ("expected_host", args.expected_host.clone()),
        ("environment", format!("{:?}", args.environment).to_lowercase()),
        (
            "cookie_domain",
            args.cookie_domain
                .clone()
                .unwrap_or_else(|| "derived".to_string()),
        ),
        ("login_url", args.login_url.clone()),
        ("allowed_origins", args.allowed_origins.join(",")),
        (
            "backend_timeout",
            format!("{}s", args.backend_timeout_seconds),
        ),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn args(environment: Environment, cookie_domain: Option<&str>) -> Args {
        Args {
            port: 8080,
            api_base_url: "https://api.example.com".to_string(),
            sso_secret: SecretString::from("s3cret"),
            expected_host: "dashboard.example.com".to_string(),
            environment,
            cookie_domain: cookie_domain.map(str::to_string),
            login_url: "https://example.com/login".to_string(),
            allowed_origins: vec!["https://example.com".to_string()],
            backend_timeout_seconds: 4,
        }
    }

    #[test]
    fn production_derives_apex_cookie_domain() {
        let config = args(Environment::Production, None).into_config().unwrap();
        assert_eq!(
            config.cookie_policy(),
            &CookiePolicy::Production {
                apex_domain: "example.com".to_string()
            }
        );
        assert_eq!(config.backend_timeout(), Duration::from_secs(4));
        assert_eq!(config.login_url(), "https://example.com/login");
        assert_eq!(config.signing_secret(), b"s3cret".as_slice());
    }

    #[test]
    fn explicit_cookie_domain_wins() {
        let config = args(Environment::Production, Some(".corp.example"))
            .into_config()
            .unwrap();
        assert_eq!(config.cookie_policy().domain(), Some("corp.example"));
    }

    #[test]
    fn development_is_host_only() {
        let config = args(Environment::Development, Some("example.com"))
            .into_config()
            .unwrap();
        assert_eq!(config.cookie_policy(), &CookiePolicy::Development);
    }

    #[test]
    fn invalid_backend_url_is_rejected() {
        let mut bad = args(Environment::Development, None);
        bad.api_base_url = "not a url".to_string();
        assert!(bad.into_config().is_err());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let args = args(Environment::Development, None);
        assert!(!format!("{args:?}").contains("s3cret"));
        assert_eq!(args.sso_secret.expose_secret(), "s3cret");
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit("abc"), "abc");
    }
}
