//! HS256 hand-off tokens.
//!
//! The issuing domain signs a compact JWT with the shared SSO secret and puts it
//! in the dashboard URL. Verification here covers format, algorithm, signature,
//! and expiry. Audience is checked separately by the exchange endpoint so it can
//! report `invalid_audience` instead of a generic `invalid_token`.
//!
//! Tokens are bearer credentials: never log them, never put them in span fields.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const ALG_HS256: &str = "HS256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffHeader {
    pub alg: String,
    pub typ: String,
}

impl HandoffHeader {
    fn hs256() -> Self {
        Self {
            alg: ALG_HS256.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// `aud` may be a single host or a list of hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// True when any audience entry names `host`. Entries may be bare hosts or
    /// full URLs; comparison is on the host (and port, when present).
    #[must_use]
    pub fn includes(&self, host: &str) -> bool {
        let expected = normalize_host(host);
        match self {
            Self::One(value) => normalize_host(value) == expected,
            Self::Many(values) => values.iter().any(|value| normalize_host(value) == expected),
        }
    }
}

fn normalize_host(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.contains("://") {
        if let Ok(url) = Url::parse(trimmed) {
            if let Some(host) = url.host_str() {
                return match url.port() {
                    Some(port) => format!("{}:{port}", host.to_ascii_lowercase()),
                    None => host.to_ascii_lowercase(),
                };
            }
        }
    }
    trimmed.trim_end_matches('/').to_ascii_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffClaims {
    /// User or session id the hand-off was minted for.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Login session correlated across domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl HandoffClaims {
    #[must_use]
    pub fn new(sub: impl Into<String>, issued_at: i64, ttl_seconds: i64) -> Self {
        Self {
            sub: sub.into(),
            aud: None,
            exp: issued_at + ttl_seconds,
            iat: Some(issued_at),
            iss: None,
            sid: None,
            email: None,
        }
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.aud = Some(audience);
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    /// An absent audience is accepted; a present one must name `host`.
    #[must_use]
    pub fn audience_allows(&self, host: &str) -> bool {
        self.aud.as_ref().map_or(true, |aud| aud.includes(host))
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, HandoffError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, HandoffError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| HandoffError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn mac_for(secret: &[u8], signing_input: &str) -> Result<HmacSha256, HandoffError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| HandoffError::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// Sign hand-off claims with the shared secret.
///
/// # Errors
///
/// Returns an error if the claims cannot be encoded.
pub fn sign_hs256(secret: &[u8], claims: &HandoffClaims) -> Result<String, HandoffError> {
    let header_b64 = b64e_json(&HandoffHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature = mac_for(secret, &signing_input)?.finalize().into_bytes();
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify an HS256 hand-off token and return its claims.
///
/// # Errors
///
/// Returns an error if:
/// - the token is not three base64url segments of valid JSON,
/// - the header algorithm is not `HS256`,
/// - the signature does not match (compared in constant time),
/// - `exp` is at or before `now_unix_seconds`.
pub fn verify_hs256(
    token: &str,
    secret: &[u8],
    now_unix_seconds: i64,
) -> Result<HandoffClaims, HandoffError> {
    let mut parts = token.trim().split('.');
    let header_b64 = parts.next().ok_or(HandoffError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(HandoffError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(HandoffError::TokenFormat)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(HandoffError::TokenFormat);
    }

    let header: HandoffHeader = b64d_json(header_b64)?;
    if header.alg != ALG_HS256 {
        return Err(HandoffError::UnsupportedAlg(header.alg));
    }

    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| HandoffError::Base64)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    mac_for(secret, &signing_input)?
        .verify_slice(&signature)
        .map_err(|_| HandoffError::InvalidSignature)?;

    let claims: HandoffClaims = b64d_json(claims_b64)?;
    if claims.exp <= now_unix_seconds {
        return Err(HandoffError::Expired);
    }

    Ok(claims)
}
