//! Route gate over the shared auth state.
//!
//! While auth state is loading the guard neither renders nor redirects. Once
//! loaded, an unauthenticated state gets a short grace window in case
//! authentication is still arriving (cross-domain exchange, another tab).
//! Dropping the guard cancels any pending wait, so a stale redirect can never
//! fire after the view is gone.

use crate::client::types::{AuthState, User, VerificationTier};
use std::{future::Future, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::form_urlencoded;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    /// Empty means any role.
    pub required_roles: Vec<String>,
    pub min_verification: Option<VerificationTier>,
    pub login_path: String,
    pub forbidden_path: String,
    pub grace_period: Duration,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            required_roles: Vec::new(),
            min_verification: None,
            login_path: "/login".to_string(),
            forbidden_path: "/unauthorized".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl GuardPolicy {
    #[must_use]
    pub fn permits(&self, user: &User) -> bool {
        let role_ok = self.required_roles.is_empty()
            || self
                .required_roles
                .iter()
                .any(|role| role.eq_ignore_ascii_case(&user.role));
        let tier_ok = self
            .min_verification
            .map_or(true, |min| user.verification >= min);
        role_ok && tier_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    AuthRequired,
    InsufficientPermissions,
}

impl GuardReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::InsufficientPermissions => "insufficient_permissions",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Loading,
    Render(User),
    Redirect { location: String, reason: GuardReason },
}

/// Decide for one state snapshot.
#[must_use]
pub fn evaluate(policy: &GuardPolicy, state: &AuthState, deep_link: &str) -> GuardDecision {
    if state.is_loading {
        return GuardDecision::Loading;
    }

    match state.user.as_ref().filter(|user| user.is_valid()) {
        None => {
            let return_to: String = form_urlencoded::byte_serialize(deep_link.as_bytes()).collect();
            GuardDecision::Redirect {
                location: format!(
                    "{}?return_to={return_to}&reason={}",
                    policy.login_path,
                    GuardReason::AuthRequired.as_str()
                ),
                reason: GuardReason::AuthRequired,
            }
        }
        Some(user) if !policy.permits(user) => GuardDecision::Redirect {
            location: format!(
                "{}?reason={}",
                policy.forbidden_path,
                GuardReason::InsufficientPermissions.as_str()
            ),
            reason: GuardReason::InsufficientPermissions,
        },
        Some(user) => GuardDecision::Render(user.clone()),
    }
}

pub struct SessionGuard {
    policy: GuardPolicy,
    state: watch::Receiver<AuthState>,
    cancel: CancellationToken,
}

impl SessionGuard {
    #[must_use]
    pub fn new(policy: GuardPolicy, state: watch::Receiver<AuthState>) -> Self {
        Self {
            policy,
            state,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn evaluate(&self, deep_link: &str) -> GuardDecision {
        evaluate(&self.policy, &self.state.borrow(), deep_link)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for a final decision. Resolves to `None` when the guard is
    /// cancelled or dropped first.
    ///
    /// The returned future does not borrow the guard, so the caller can drive
    /// it elsewhere and still drop the guard to abandon it.
    pub fn resolve(&self, deep_link: &str) -> impl Future<Output = Option<GuardDecision>> + Send + 'static {
        let policy = self.policy.clone();
        let mut state = self.state.clone();
        let cancel = self.cancel.child_token();
        let deep_link = deep_link.to_string();

        async move {
            let decision = settle(&policy, &mut state, &cancel, &deep_link).await?;
            if !matches!(
                decision,
                GuardDecision::Redirect {
                    reason: GuardReason::AuthRequired,
                    ..
                }
            ) {
                return Some(decision);
            }

            debug!("unauthenticated; waiting {:?} before redirecting", policy.grace_period);
            let grace = tokio::time::sleep(policy.grace_period);
            tokio::pin!(grace);
            let mut closed = false;

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return None,
                    () = &mut grace => return settle(&policy, &mut state, &cancel, &deep_link).await,
                    changed = state.changed(), if !closed => {
                        if changed.is_err() {
                            closed = true;
                            continue;
                        }
                        let decision = evaluate(&policy, &state.borrow_and_update(), &deep_link);
                        if matches!(
                            decision,
                            GuardDecision::Render(_)
                                | GuardDecision::Redirect {
                                    reason: GuardReason::InsufficientPermissions,
                                    ..
                                }
                        ) {
                            return Some(decision);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// First non-loading decision, or `None` if cancelled (or the state source
/// goes away) while still loading.
async fn settle(
    policy: &GuardPolicy,
    state: &mut watch::Receiver<AuthState>,
    cancel: &CancellationToken,
    deep_link: &str,
) -> Option<GuardDecision> {
    loop {
        let decision = evaluate(policy, &state.borrow_and_update(), deep_link);
        if decision != GuardDecision::Loading {
            return Some(decision);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            changed = state.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}
