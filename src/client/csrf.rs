//! Per-domain anti-forgery token cache.
//!
//! Lookup order for a domain: a fresh cached entry, then an in-flight fetch
//! shared with other callers, then a credentialed fetch, then an anonymous
//! fetch, and finally a locally generated token. The local token is a degraded
//! mode: short-lived, prefixed `local-`, and logged at `warn`.

use crate::client::{api::ApiError, lock, single_flight::SingleFlight};
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, instrument, warn};

pub const CSRF_PATH: &str = "/auth/csrf-token";
pub const SERVER_TOKEN_TTL: Duration = Duration::from_secs(25 * 60);
pub const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const LOCAL_TOKEN_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfSource {
    Server,
    Anonymous,
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfTokenEntry {
    pub token: String,
    pub expires_at: Instant,
    pub domain: String,
    pub source: CsrfSource,
}

impl CsrfTokenEntry {
    #[must_use]
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub default_domain: String,
    /// Domain name -> API origin serving its CSRF tokens.
    pub origins: HashMap<String, String>,
    pub server_ttl: Duration,
    pub fallback_ttl: Duration,
}

impl CsrfConfig {
    #[must_use]
    pub fn new(default_domain: &str, origin: &str) -> Self {
        Self {
            default_domain: default_domain.to_string(),
            origins: HashMap::new(),
            server_ttl: SERVER_TOKEN_TTL,
            fallback_ttl: FALLBACK_TOKEN_TTL,
        }
        .with_origin(default_domain, origin)
    }

    #[must_use]
    pub fn with_origin(mut self, domain: &str, origin: &str) -> Self {
        self.origins.insert(
            domain.to_string(),
            origin.trim_end_matches('/').to_string(),
        );
        self
    }

    #[must_use]
    pub fn with_server_ttl(mut self, ttl: Duration) -> Self {
        self.server_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_fallback_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_ttl = ttl;
        self
    }
}

type Entries = Arc<Mutex<HashMap<String, CsrfTokenEntry>>>;
type Epochs = Arc<Mutex<HashMap<String, u64>>>;

pub struct CsrfTokenCache {
    credentialed: Client,
    anonymous: Client,
    config: CsrfConfig,
    entries: Entries,
    /// Per-domain counter bumped by `invalidate`/`clear`. A fetch started
    /// under an older epoch neither repopulates the cache nor is joined by
    /// later callers.
    epochs: Epochs,
    flights: SingleFlight<(String, u64), CsrfTokenEntry>,
}

impl CsrfTokenCache {
    /// `credentialed` should carry the session cookie jar.
    ///
    /// # Errors
    /// Returns `Config` if the anonymous client cannot be built.
    pub fn new(credentialed: Client, config: CsrfConfig) -> Result<Self, ApiError> {
        let anonymous = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ApiError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self::with_clients(credentialed, anonymous, config))
    }

    #[must_use]
    pub fn with_clients(credentialed: Client, anonymous: Client, config: CsrfConfig) -> Self {
        Self {
            credentialed,
            anonymous,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            epochs: Arc::new(Mutex::new(HashMap::new())),
            flights: SingleFlight::new(),
        }
    }

    /// Token for `target_domain` (the default domain when `None`). `None` only
    /// when the domain has no configured origin.
    #[instrument(skip(self))]
    pub async fn get_token(&self, target_domain: Option<&str>) -> Option<String> {
        let domain = target_domain
            .unwrap_or(&self.config.default_domain)
            .to_string();
        let Some(origin) = self.config.origins.get(&domain).cloned() else {
            debug!("no CSRF origin configured for {}", domain);
            return None;
        };

        if let Some(entry) = self.entry(&domain) {
            return Some(entry.token);
        }

        let epoch = self.epoch(&domain);
        let fetch = Fetch {
            credentialed: self.credentialed.clone(),
            anonymous: self.anonymous.clone(),
            origin,
            domain: domain.clone(),
            server_ttl: self.config.server_ttl,
            fallback_ttl: self.config.fallback_ttl,
            entries: Arc::clone(&self.entries),
            epochs: Arc::clone(&self.epochs),
            started_at_epoch: epoch,
        };
        let entry = self.flights.run((domain, epoch), move || fetch.run()).await;
        Some(entry.token)
    }

    /// The cached entry for `domain` if it has not expired.
    #[must_use]
    pub fn entry(&self, domain: &str) -> Option<CsrfTokenEntry> {
        lock(&self.entries)
            .get(domain)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .cloned()
    }

    /// Forget `domain`'s token. Other domains, and fetches in flight for
    /// them, are unaffected.
    pub fn invalidate(&self, domain: &str) {
        let mut entries = lock(&self.entries);
        bump(&mut lock(&self.epochs), domain);
        entries.remove(domain);
    }

    /// Forget every domain's token, e.g. on logout.
    pub fn clear(&self) {
        let mut entries = lock(&self.entries);
        let mut epochs = lock(&self.epochs);
        for domain in self.config.origins.keys() {
            bump(&mut epochs, domain);
        }
        entries.clear();
    }

    fn epoch(&self, domain: &str) -> u64 {
        lock(&self.epochs).get(domain).copied().unwrap_or(0)
    }
}

fn bump(epochs: &mut HashMap<String, u64>, domain: &str) {
    let epoch = epochs.entry(domain.to_string()).or_insert(0);
    *epoch = epoch.wrapping_add(1);
}

struct Fetch {
    credentialed: Client,
    anonymous: Client,
    origin: String,
    domain: String,
    server_ttl: Duration,
    fallback_ttl: Duration,
    entries: Entries,
    epochs: Epochs,
    started_at_epoch: u64,
}

impl Fetch {
    async fn run(self) -> CsrfTokenEntry {
        let (token, source, ttl) = match request_token(&self.credentialed, &self.origin, &self.domain).await {
            Ok(token) => (token, CsrfSource::Server, self.server_ttl),
            Err(err) => {
                debug!("credentialed CSRF fetch for {} failed: {}", self.domain, err);
                match request_token(&self.anonymous, &self.origin, &self.domain).await {
                    Ok(token) => (token, CsrfSource::Anonymous, self.server_ttl),
                    Err(err) => {
                        warn!(
                            "Using locally generated CSRF token for {} after server fetches failed: {}",
                            self.domain, err
                        );
                        (local_token(&self.domain), CsrfSource::LocalFallback, self.fallback_ttl)
                    }
                }
            }
        };

        let entry = CsrfTokenEntry {
            token,
            expires_at: Instant::now() + ttl,
            domain: self.domain.clone(),
            source,
        };

        let mut entries = lock(&self.entries);
        let current = lock(&self.epochs).get(&self.domain).copied().unwrap_or(0);
        if current == self.started_at_epoch {
            entries.insert(self.domain, entry.clone());
        }
        entry
    }
}

async fn request_token(client: &Client, origin: &str, domain: &str) -> Result<String, ApiError> {
    let response = client
        .get(format!("{origin}{CSRF_PATH}"))
        .header("X-Requested-With", "XMLHttpRequest")
        .header(crate::client::api::CLIENT_DOMAIN_HEADER, domain)
        .send()
        .await
        .map_err(|err| ApiError::Network(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: "CSRF token request rejected".to_string(),
        });
    }

    let value: Value = response
        .json()
        .await
        .map_err(|err| ApiError::Parse(err.to_string()))?;
    extract_token(&value).ok_or_else(|| ApiError::Parse("Response did not contain a CSRF token".to_string()))
}

fn extract_token(value: &Value) -> Option<String> {
    let scopes = [Some(value), value.get("data")];
    scopes.into_iter().flatten().find_map(|scope| {
        ["csrfToken", "csrf_token", "token"]
            .iter()
            .find_map(|key| scope.get(key).and_then(Value::as_str))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// `local-<domain>-<millis>-<hex>`.
fn local_token(domain: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    let random: [u8; 16] = rand::thread_rng().gen();
    let mut token = format!("{LOCAL_TOKEN_PREFIX}{domain}-{millis}-");
    for byte in random {
        let _ = write!(token, "{byte:02x}");
    }
    token
}
