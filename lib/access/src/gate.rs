//! Authorization gate.
//!
//! Folds session, profile and identity metadata into one verdict. The verdict
//! depends only on [`GateInput`], so the same inputs always give the same
//! answer no matter how they were reached.
//!
//! When the profile is unavailable the gate falls back to the role requested
//! in identity metadata: unverified teachers are held at approval (fail-closed)
//! while every other role is let through (fail-open).

use crate::config::LandingConfig;
use crate::identity::Identity;
use crate::profile::Profile;
use crate::role::{AccountStatus, Role};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authorization state consumed by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "role", rename_all = "snake_case")]
pub enum Verdict {
    /// Initial determination has not finished.
    Loading,
    /// No identity.
    Unauthenticated,
    /// Teacher account waiting for an administrator.
    AwaitingApproval,
    /// Account blocked by an administrator.
    Blocked,
    /// Full access for the role.
    Authorized(Role),
}

impl Verdict {
    /// Returns true if an identity backs this verdict.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        !matches!(self, Self::Loading | Self::Unauthenticated)
    }

    /// Returns true for an authorized administrator.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Authorized(Role::Admin))
    }

    /// Returns the authorized role, if any.
    #[must_use]
    pub fn authorized_role(&self) -> Option<Role> {
        match self {
            Self::Authorized(role) => Some(*role),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Blocked => write!(f, "blocked"),
            Self::Authorized(role) => write!(f, "authorized({role})"),
        }
    }
}

/// Everything the gate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateInput {
    /// An identity is present.
    pub has_identity: bool,
    /// The initial session determination has completed.
    pub initial_done: bool,
    /// Role and status from the profile row, when one is held.
    pub profile: Option<(Role, AccountStatus)>,
    /// Role requested in identity metadata.
    pub metadata_role: Option<Role>,
}

impl GateInput {
    /// Collects gate input from engine state.
    #[must_use]
    pub fn from_parts(
        identity: Option<&Identity>,
        profile: Option<&Profile>,
        initial_done: bool,
    ) -> Self {
        Self {
            has_identity: identity.is_some(),
            initial_done,
            profile: profile.map(|p| (p.role, p.status)),
            metadata_role: identity.and_then(Identity::requested_role),
        }
    }

    /// Role the gate uses: profile first, then metadata, then student.
    #[must_use]
    pub fn effective_role(&self) -> Role {
        self.profile
            .map(|(role, _)| role)
            .or(self.metadata_role)
            .unwrap_or_default()
    }

    /// Status the gate uses, with the fallback defaults when no profile is held.
    #[must_use]
    pub fn effective_status(&self) -> AccountStatus {
        let role = self.effective_role();
        match self.profile {
            Some((_, status)) => status.effective_for(role),
            None => role.initial_status(),
        }
    }

    /// Returns true when the verdict rests on metadata alone.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.has_identity && self.profile.is_none()
    }
}

/// Derives the verdict.
#[must_use]
pub fn evaluate(input: &GateInput) -> Verdict {
    if !input.initial_done {
        return Verdict::Loading;
    }
    if !input.has_identity {
        return Verdict::Unauthenticated;
    }

    let role = input.effective_role();
    match input.effective_status() {
        AccountStatus::Blocked => Verdict::Blocked,
        AccountStatus::Pending => Verdict::AwaitingApproval,
        AccountStatus::Active => Verdict::Authorized(role),
    }
}

/// Picks the view to redirect to when the verdict and the displayed view
/// disagree, or `None` to stay put.
///
/// While a password recovery is in progress, identity-bearing verdicts are
/// sent to the recovery view. Otherwise they leave pre-authentication views
/// for the admin or default landing. Without an identity, any non-public view
/// goes to sign-in.
#[must_use]
pub fn redirect_target(
    verdict: Verdict,
    current_view: &str,
    recovery_in_progress: bool,
    landing: &LandingConfig,
) -> Option<String> {
    match verdict {
        Verdict::Loading => None,
        Verdict::Unauthenticated => {
            (!landing.is_public(current_view)).then(|| landing.sign_in.clone())
        }
        _ if recovery_in_progress => {
            (current_view != landing.recovery_view).then(|| landing.recovery_view.clone())
        }
        _ if !landing.is_pre_auth(current_view) => None,
        Verdict::Authorized(Role::Admin) => Some(landing.admin_view.clone()),
        _ => Some(landing.default_view.clone()),
    }
}
