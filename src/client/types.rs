//! Auth data model shared by the client services and the exchange page.
//!
//! Token values are bearer credentials; `Debug` output redacts them and nothing
//! here logs them.

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Ordered from least to most trusted; policies compare with `>=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    #[default]
    Unverified,
    Basic,
    Verified,
}

impl VerificationTier {
    /// Unknown names rank lowest.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "verified" => Self::Verified,
            "basic" => Self::Basic,
            _ => Self::Unverified,
        }
    }
}

fn lenient_tier<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VerificationTier, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .map_or(VerificationTier::Unverified, VerificationTier::from_name))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "displayName", alias = "fullName")]
    pub name: Option<String>,
    #[serde(default, alias = "userType", alias = "user_type")]
    pub role: String,
    #[serde(
        default,
        alias = "verificationTier",
        alias = "verification_tier",
        deserialize_with = "lenient_tier"
    )]
    pub verification: VerificationTier,
}

impl User {
    /// Structural validity: a non-blank id and a plausible email.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
            && Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(&self.email))
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl AuthTokens {
    #[must_use]
    pub fn bearer(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
        }
    }
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Who is logged in, as seen by one client instance.
///
/// `is_authenticated()` is derived, never stored: it holds iff `user` is present
/// and structurally valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub tokens: Option<AuthTokens>,
    pub session_id: Option<String>,
    pub domain: String,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl AuthState {
    #[must_use]
    pub fn loading(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            is_loading: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn signed_out(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn signed_out_with_error(domain: &str, error: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn authenticated(
        domain: &str,
        user: User,
        tokens: Option<AuthTokens>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            user: Some(user),
            tokens,
            session_id,
            domain: domain.to_string(),
            is_loading: false,
            error: None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.as_ref().is_some_and(User::is_valid)
    }

    /// Drop everything when the user is missing or malformed; tokens without a
    /// valid identity are never trusted.
    #[must_use]
    pub fn normalized(self) -> Self {
        if self.is_authenticated() {
            self
        } else {
            Self {
                domain: self.domain,
                is_loading: self.is_loading,
                error: self.error,
                ..Self::default()
            }
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .filter(|user| user.is_valid())
            .map(|user| user.id.as_str())
    }
}

/// Compact snapshot persisted to page-scoped storage.
///
/// The exchange page writes it without tokens (those stay in `HttpOnly`
/// cookies); the lifecycle manager writes it with tokens when it owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuth {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<AuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub stored_at: i64,
}

impl StoredAuth {
    #[must_use]
    pub fn from_state(state: &AuthState, stored_at: i64) -> Self {
        Self {
            user: state.user.clone(),
            tokens: state.tokens.clone(),
            session_id: state.session_id.clone(),
            domain: state.domain.clone(),
            stored_at,
        }
    }
}

pub struct LoginCredentials {
    pub email: String,
    pub password: SecretString,
}

impl LoginCredentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: email.to_string(),
            name: None,
            role: "buyer".to_string(),
            verification: VerificationTier::Basic,
        }
    }

    #[test]
    fn user_validity_requires_id_and_email() {
        assert!(user("u1", "u1@example.com").is_valid());
        assert!(!user("  ", "u1@example.com").is_valid());
        assert!(!user("u1", "not-an-email").is_valid());
        assert!(!user("u1", "").is_valid());
    }

    #[test]
    fn user_deserializes_backend_aliases() -> Result<(), serde_json::Error> {
        let parsed: User = serde_json::from_value(json!({
            "id": 42,
            "email": "a@example.com",
            "displayName": "Ada",
            "userType": "seller",
            "verificationTier": "verified"
        }))?;
        assert_eq!(parsed.id, "42");
        assert_eq!(parsed.name.as_deref(), Some("Ada"));
        assert_eq!(parsed.role, "seller");
        assert_eq!(parsed.verification, VerificationTier::Verified);
        Ok(())
    }

    #[test]
    fn unknown_verification_tier_is_unverified() -> Result<(), serde_json::Error> {
        let parsed: User = serde_json::from_value(json!({
            "id": "u1",
            "email": "a@example.com",
            "verification": "platinum"
        }))?;
        assert_eq!(parsed.verification, VerificationTier::Unverified);

        let numeric: User = serde_json::from_value(json!({
            "id": "u1",
            "email": "a@example.com",
            "verificationTier": 3
        }))?;
        assert_eq!(numeric.verification, VerificationTier::Unverified);

        let missing: User = serde_json::from_value(json!({ "id": "u1", "email": "a@example.com" }))?;
        assert_eq!(missing.verification, VerificationTier::Unverified);
        Ok(())
    }

    #[test]
    fn known_tiers_round_trip_by_name() -> Result<(), serde_json::Error> {
        let parsed: User = serde_json::from_value(json!({
            "id": "u1",
            "email": "a@example.com",
            "verification": "Basic"
        }))?;
        assert_eq!(parsed.verification, VerificationTier::Basic);
        assert_eq!(serde_json::to_value(VerificationTier::Verified)?, json!("verified"));
        Ok(())
    }

    #[test]
    fn verification_tiers_are_ordered() {
        assert!(VerificationTier::Unverified < VerificationTier::Basic);
        assert!(VerificationTier::Basic < VerificationTier::Verified);
    }

    #[test]
    fn tokens_without_valid_user_are_not_authenticated() {
        let state = AuthState {
            user: Some(user("", "bad")),
            tokens: Some(AuthTokens::bearer("a", "r")),
            domain: "dashboard".to_string(),
            ..AuthState::default()
        };
        assert!(!state.is_authenticated());

        let normalized = state.normalized();
        assert!(normalized.tokens.is_none());
        assert!(normalized.user.is_none());
        assert_eq!(normalized.domain, "dashboard");
    }

    #[test]
    fn valid_state_survives_normalization() {
        let state = AuthState::authenticated(
            "dashboard",
            user("u1", "u1@example.com"),
            Some(AuthTokens::bearer("a", "r")),
            None,
        );
        assert_eq!(state.clone().normalized(), state);
        assert_eq!(state.user_id(), Some("u1"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let tokens = format!("{:?}", AuthTokens::bearer("access-secret", "refresh-secret"));
        assert!(!tokens.contains("access-secret"));
        assert!(!tokens.contains("refresh-secret"));

        let credentials = format!("{:?}", LoginCredentials::new("a@example.com", "hunter2"));
        assert!(!credentials.contains("hunter2"));
    }
}
