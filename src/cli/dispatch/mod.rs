use crate::cli::{
    actions::{server::Args, Action},
    commands::{sso, ARG_PORT},
};
use crate::config::Environment;
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    let api_base_url = matches
        .get_one::<String>(sso::ARG_API_BASE_URL)
        .cloned()
        .context("missing required argument: --api-base-url")?;
    let sso_secret = matches
        .get_one::<String>(sso::ARG_SSO_SECRET)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --sso-secret")?;
    let expected_host = matches
        .get_one::<String>(sso::ARG_EXPECTED_HOST)
        .cloned()
        .context("missing required argument: --expected-host")?;

    let environment = matches
        .get_one::<Environment>(sso::ARG_ENVIRONMENT)
        .copied()
        .unwrap_or(Environment::Development);
    let cookie_domain = matches.get_one::<String>(sso::ARG_COOKIE_DOMAIN).cloned();
    let login_url = matches
        .get_one::<String>(sso::ARG_LOGIN_URL)
        .cloned()
        .unwrap_or_else(|| "/login".to_string());
    let allowed_origins = matches
        .get_many::<String>(sso::ARG_ALLOWED_ORIGIN)
        .map(|origins| {
            origins
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let backend_timeout_seconds = matches
        .get_one::<u64>(sso::ARG_BACKEND_TIMEOUT_SECONDS)
        .copied()
        .unwrap_or(10);

    Ok(Action::Server(Args {
        port,
        api_base_url,
        sso_secret,
        expected_host,
        environment,
        cookie_domain,
        login_url,
        allowed_origins,
        backend_timeout_seconds,
    }))
}
