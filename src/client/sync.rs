//! Propagate login and logout to sibling domains and to other tabs.
//!
//! Siblings are reached with real requests: on login each one gets a hand-off
//! token minted for its host and exchanged through its `/sso/receive`; on
//! logout each one gets a proxied logout. Other tabs of the same origin hear
//! about it through a typed broadcast channel.

use crate::client::{
    api::{ApiError, AuthApi},
    types::{AuthState, AuthTokens, User},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;
use url::Url;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SsoStatus {
    Ok,
    Error,
}

/// Payload the exchange page posts to an embedding parent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsoMessage {
    pub sso: SsoStatus,
    #[serde(default)]
    pub user: Option<User>,
    pub host: String,
}

impl SsoMessage {
    #[must_use]
    pub fn ok(user: Option<User>, host: &str) -> Self {
        Self {
            sso: SsoStatus::Ok,
            user,
            host: host.to_string(),
        }
    }

    #[must_use]
    pub fn error(host: &str) -> Self {
        Self {
            sso: SsoStatus::Error,
            user: None,
            host: host.to_string(),
        }
    }
}

/// Auth changes shared between instances. `origin` is the publishing
/// instance so it can ignore its own events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Login {
        origin: String,
        domain: String,
        user: User,
        #[serde(default)]
        session_id: Option<String>,
    },
    Logout {
        origin: String,
        domain: String,
    },
    TokensRefreshed {
        origin: String,
        domain: String,
    },
}

impl SyncEvent {
    #[must_use]
    pub fn origin(&self) -> &str {
        match self {
            Self::Login { origin, .. }
            | Self::Logout { origin, .. }
            | Self::TokensRefreshed { origin, .. } => origin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncChannel {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for SyncChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl SyncChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of listeners reached; zero listeners is not an error.
    pub fn publish(&self, event: SyncEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Host this instance serves, e.g. `dashboard.example.com`.
    pub domain: String,
    /// Sibling origins, e.g. `https://www.example.com`.
    pub siblings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("backend logout failed: {0}")]
    Backend(#[from] ApiError),
    #[error("{} sibling domain(s) could not be updated", .0.failed.len())]
    Siblings(SyncReport),
}

pub struct CrossDomainSync<A: AuthApi> {
    api: Arc<A>,
    http: Client,
    config: SyncConfig,
    channel: SyncChannel,
    instance_id: String,
}

impl<A: AuthApi> CrossDomainSync<A> {
    /// `http` should share the cookie jar with the auth API client so sibling
    /// exchanges land their cookies where later requests will find them.
    #[must_use]
    pub fn new(api: Arc<A>, http: Client, config: SyncConfig, channel: SyncChannel) -> Self {
        Self {
            api,
            http,
            config,
            channel,
            instance_id: Ulid::new().to_string(),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.channel.subscribe()
    }

    /// Announce a login and sign every sibling in. Sibling failures are
    /// recorded in the report and never abort the others.
    #[instrument(skip_all)]
    pub async fn on_login(&self, state: &AuthState) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(user) = state.user.clone().filter(User::is_valid) else {
            debug!("skipping login sync without a valid user");
            return report;
        };

        self.channel.publish(SyncEvent::Login {
            origin: self.instance_id.clone(),
            domain: state.domain.clone(),
            user,
            session_id: state.session_id.clone(),
        });

        let access_token = state.tokens.as_ref().map(|t| t.access_token.as_str());
        for sibling in &self.config.siblings {
            match self.sign_in_sibling(sibling, access_token).await {
                Ok(()) => report.synced.push(sibling.clone()),
                Err(err) => {
                    warn!("SSO sync to {} failed: {}", sibling, err);
                    report.failed.push((sibling.clone(), err.to_string()));
                }
            }
        }

        info!(
            "login synced to {} of {} sibling domain(s)",
            report.synced.len(),
            self.config.siblings.len()
        );
        report
    }

    async fn sign_in_sibling(&self, sibling: &str, access_token: Option<&str>) -> Result<(), ApiError> {
        let host = sibling_host(sibling)
            .ok_or_else(|| ApiError::Config(format!("Invalid sibling origin: {sibling}")))?;
        let token = self.api.issue_handoff(&host, access_token).await?;

        let mut url = Url::parse(&format!("{}/sso/receive", sibling.trim_end_matches('/')))
            .map_err(|err| ApiError::Config(err.to_string()))?;
        url.query_pairs_mut().append_pair("token", &token);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        let status = response.status();
        let rejected = response.url().query_pairs().any(|(key, _)| key == "error");
        if status.is_success() && !rejected {
            Ok(())
        } else {
            Err(ApiError::Http {
                status: status.as_u16(),
                message: "Hand-off rejected by sibling".to_string(),
            })
        }
    }

    /// Sign out of the backend and every sibling, then tell other tabs.
    ///
    /// # Errors
    /// Returns the backend failure, or the siblings that could not be signed
    /// out. The logout event is published either way.
    #[instrument(skip_all)]
    pub async fn on_logout(&self, tokens: Option<&AuthTokens>) -> Result<SyncReport, SyncError> {
        let backend = self
            .api
            .logout(tokens.map(|t| t.access_token.as_str()))
            .await;

        let mut report = SyncReport::default();
        for sibling in &self.config.siblings {
            let url = format!("{}/api/auth/logout", sibling.trim_end_matches('/'));
            match self.http.post(url).send().await {
                Ok(response) if response.status().is_success() => report.synced.push(sibling.clone()),
                Ok(response) => report
                    .failed
                    .push((sibling.clone(), format!("status {}", response.status()))),
                Err(err) => report.failed.push((sibling.clone(), err.to_string())),
            }
        }

        self.channel.publish(SyncEvent::Logout {
            origin: self.instance_id.clone(),
            domain: self.config.domain.clone(),
        });

        backend?;
        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::Siblings(report))
        }
    }

    pub fn notify_tokens_refreshed(&self) {
        self.channel.publish(SyncEvent::TokensRefreshed {
            origin: self.instance_id.clone(),
            domain: self.config.domain.clone(),
        });
    }

    /// Where to send the user after login: the page that started it, if it is
    /// safe, else `default`.
    ///
    /// The target is resolved against this domain the way a browser would.
    /// Relative paths must stay on this domain; absolute URLs may also point
    /// at a configured sibling. Control characters are never accepted since
    /// browsers drop some of them before parsing.
    #[must_use]
    pub fn post_login_destination(&self, return_to: Option<&str>, default: &str) -> String {
        let Some(target) = return_to.map(str::trim).filter(|t| !t.is_empty()) else {
            return default.to_string();
        };

        if target.chars().any(char::is_control) {
            warn!("Ignoring post-login destination with control characters");
            return default.to_string();
        }

        let Ok(own) = Url::parse(&format!("https://{}/", self.config.domain)) else {
            return default.to_string();
        };

        let safe = match own.join(target) {
            Ok(url) if !matches!(url.scheme(), "http" | "https") => false,
            Ok(url) if target.starts_with('/') => url_host(&url) == url_host(&own),
            Ok(url) => Url::parse(target).is_ok() && self.is_known_host(&url),
            Err(_) => false,
        };

        if safe {
            target.to_string()
        } else {
            warn!("Ignoring unsafe post-login destination");
            default.to_string()
        }
    }

    fn is_known_host(&self, url: &Url) -> bool {
        let Some(host) = url_host(url) else {
            return false;
        };
        host == self.config.domain.to_ascii_lowercase()
            || self
                .config
                .siblings
                .iter()
                .filter_map(|sibling| sibling_host(sibling))
                .any(|sibling| sibling == host)
    }
}

fn url_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// `https://www.example.com/` -> `www.example.com` (port kept when explicit).
fn sibling_host(sibling: &str) -> Option<String> {
    url_host(&Url::parse(sibling).ok()?)
}
