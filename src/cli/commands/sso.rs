use crate::config::Environment;
use clap::{Arg, ArgAction, Command};

pub const ARG_API_BASE_URL: &str = "api-base-url";
pub const ARG_SSO_SECRET: &str = "sso-secret";
pub const ARG_EXPECTED_HOST: &str = "expected-host";
pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_LOGIN_URL: &str = "login-url";
pub const ARG_ALLOWED_ORIGIN: &str = "allowed-origin";
pub const ARG_BACKEND_TIMEOUT_SECONDS: &str = "backend-timeout-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_backend_args(command);
    with_cookie_args(command)
}

fn with_backend_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_API_BASE_URL)
                .long(ARG_API_BASE_URL)
                .help("Base URL of the authentication backend, example: https://api.example.com")
                .env("SSOGATE_API_BASE_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_SSO_SECRET)
                .long(ARG_SSO_SECRET)
                .help("Shared HMAC secret used to verify hand-off tokens")
                .env("SSOGATE_SSO_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_EXPECTED_HOST)
                .long(ARG_EXPECTED_HOST)
                .help("Host this gateway serves; hand-off tokens must name it in their audience")
                .env("SSOGATE_EXPECTED_HOST")
                .required(true),
        )
        .arg(
            Arg::new(ARG_BACKEND_TIMEOUT_SECONDS)
                .long(ARG_BACKEND_TIMEOUT_SECONDS)
                .help("Timeout for calls to the authentication backend")
                .env("SSOGATE_BACKEND_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment environment: production or development")
                .env("SSOGATE_ENVIRONMENT")
                .default_value("development")
                .value_parser(|value: &str| value.parse::<Environment>()),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Cookie Domain attribute in production (default: apex of --expected-host)")
                .env("SSOGATE_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_LOGIN_URL)
                .long(ARG_LOGIN_URL)
                .help("Where failed exchanges are redirected")
                .env("SSOGATE_LOGIN_URL")
                .default_value("/login"),
        )
        .arg(
            Arg::new(ARG_ALLOWED_ORIGIN)
                .long(ARG_ALLOWED_ORIGIN)
                .help("Origin allowed to call the gateway with credentials (repeatable or comma separated)")
                .env("SSOGATE_ALLOWED_ORIGINS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
}
