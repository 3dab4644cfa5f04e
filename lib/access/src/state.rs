//! Engine state and its transitions.
//!
//! [`AuthState::apply`] is the only way state changes. It never performs I/O:
//! work that must happen as a consequence is returned as [`Effect`]s for the
//! driver to run. Profile resolutions come back tagged with the [`Ticket`]
//! they were started under and are dropped if the ticket is stale.

use crate::backend::{AuthEvent, AuthEventKind};
use crate::gate::{self, GateInput, Verdict};
use crate::identity::Identity;
use crate::profile::Profile;
use crate::resolver::Resolution;
use onluyen_core::UserId;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Identifies the identity and epoch a resolution was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub user_id: UserId,
    pub epoch: u64,
}

/// Something that happened to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Result of the initial stored-session lookup.
    InitialSession(Option<Identity>),
    /// The initial-determination deadline passed.
    SafetyTimeout,
    /// A push notification from the auth service.
    Auth(AuthEvent),
    /// A profile resolution finished.
    Resolved {
        ticket: Ticket,
        resolution: Resolution,
    },
    /// Local sign-out was requested.
    SignOutRequested,
    /// A password-recovery redirect was observed.
    RecoveryStarted,
    /// The new password was saved.
    RecoveryFinished,
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Resolve the profile for `identity`, reconciling any role intent first
    /// when `reconcile` is set.
    Resolve {
        ticket: Ticket,
        identity: Identity,
        reconcile: bool,
    },
    /// End the session on the auth service.
    RemoteSignOut,
    /// Drop any recorded role intent.
    ClearIntent,
}

/// Observable engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthSnapshot {
    pub identity: Option<Identity>,
    pub profile: Option<Profile>,
    pub verdict: Verdict,
    pub initial_done: bool,
    pub recovery_in_progress: bool,
    pub last_resolution: Option<Resolution>,
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self {
            identity: None,
            profile: None,
            verdict: Verdict::Loading,
            initial_done: false,
            recovery_in_progress: false,
            last_resolution: None,
        }
    }
}

impl AuthSnapshot {
    /// Id of the current identity.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.identity.as_ref().map(Identity::id)
    }

    /// Returns true when the verdict rests on identity metadata alone.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.initial_done && self.identity.is_some() && self.profile.is_none()
    }
}

/// Engine state.
#[derive(Debug, Default)]
pub struct AuthState {
    identity: Option<Identity>,
    profile: Option<Profile>,
    initial_done: bool,
    initial_session_seen: bool,
    recovery_in_progress: bool,
    last_resolution: Option<Resolution>,
    epoch: u64,
}

impl AuthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for work started now, if an identity is held.
    #[must_use]
    pub fn ticket(&self) -> Option<Ticket> {
        self.identity.as_ref().map(|identity| Ticket {
            user_id: identity.id(),
            epoch: self.epoch,
        })
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    #[must_use]
    pub fn is_initial_done(&self) -> bool {
        self.initial_done
    }

    /// Current verdict.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        gate::evaluate(&GateInput::from_parts(
            self.identity.as_ref(),
            self.profile.as_ref(),
            self.initial_done,
        ))
    }

    /// Builds the observable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            identity: self.identity.clone(),
            profile: self.profile.clone(),
            verdict: self.verdict(),
            initial_done: self.initial_done,
            recovery_in_progress: self.recovery_in_progress,
            last_resolution: self.last_resolution.clone(),
        }
    }

    /// Effect that re-resolves the current identity's profile.
    #[must_use]
    pub fn refresh(&self) -> Option<Effect> {
        let identity = self.identity.clone()?;
        let ticket = self.ticket()?;
        Some(Effect::Resolve {
            ticket,
            identity,
            reconcile: false,
        })
    }

    /// Applies an input and returns the effects it calls for.
    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::InitialSession(identity) => self.initial_session(identity),
            Input::SafetyTimeout => {
                if !self.initial_done {
                    warn!("initial session determination timed out");
                    self.initial_done = true;
                }
                Vec::new()
            }
            Input::Auth(event) => self.auth_event(event),
            Input::Resolved { ticket, resolution } => {
                self.resolved(ticket, resolution);
                Vec::new()
            }
            Input::SignOutRequested => {
                self.clear_session();
                vec![Effect::ClearIntent, Effect::RemoteSignOut]
            }
            Input::RecoveryStarted => {
                self.recovery_in_progress = true;
                Vec::new()
            }
            Input::RecoveryFinished => {
                self.recovery_in_progress = false;
                Vec::new()
            }
        }
    }

    fn initial_session(&mut self, identity: Option<Identity>) -> Vec<Effect> {
        if std::mem::replace(&mut self.initial_session_seen, true) {
            return Vec::new();
        }
        // An auth event already moved the session on; the lookup is stale.
        if self.epoch != 0 {
            debug!("initial session superseded by auth event");
            return Vec::new();
        }
        match identity {
            Some(identity) => self.adopt(identity, true),
            None => {
                self.initial_done = true;
                Vec::new()
            }
        }
    }

    fn auth_event(&mut self, event: AuthEvent) -> Vec<Effect> {
        debug!(kind = ?event.kind, "auth event");
        match (event.kind, event.identity) {
            (AuthEventKind::SignedOut, _) => {
                self.clear_session();
                vec![Effect::ClearIntent]
            }
            (_, None) => {
                self.clear_session();
                Vec::new()
            }
            (kind, Some(identity)) => {
                if kind == AuthEventKind::PasswordRecovery {
                    self.recovery_in_progress = true;
                }
                self.adopt(identity, kind == AuthEventKind::SignedIn)
            }
        }
    }

    fn adopt(&mut self, identity: Identity, reconcile: bool) -> Vec<Effect> {
        let same = self.identity.as_ref().map(Identity::id) == Some(identity.id());
        if !same {
            self.epoch += 1;
            self.profile = None;
            self.last_resolution = None;
        }
        self.identity = Some(identity.clone());
        let ticket = Ticket {
            user_id: identity.id(),
            epoch: self.epoch,
        };
        vec![Effect::Resolve {
            ticket,
            identity,
            reconcile,
        }]
    }

    fn resolved(&mut self, ticket: Ticket, resolution: Resolution) {
        if self.ticket() != Some(ticket) {
            debug!(user_id = %ticket.user_id, epoch = ticket.epoch, "discarding stale resolution");
            return;
        }
        match &resolution {
            Resolution::Found { profile } => self.profile = Some(profile.clone()),
            Resolution::NotFound | Resolution::Denied { .. } => self.profile = None,
            // Keep the last good row through transient failures.
            Resolution::Failed { .. } => {}
        }
        self.last_resolution = Some(resolution);
        if !self.initial_done {
            info!("initial session determination complete");
            self.initial_done = true;
        }
    }

    fn clear_session(&mut self) {
        self.epoch += 1;
        self.identity = None;
        self.profile = None;
        self.last_resolution = None;
        self.recovery_in_progress = false;
        self.initial_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::role_metadata;
    use crate::profile::NewProfile;
    use crate::role::{AccountStatus, Role};
    use chrono::Utc;

    fn identity(role: Option<Role>) -> Identity {
        let identity = Identity::new(Some("user@example.com".to_string()));
        match role {
            Some(role) => identity.with_metadata(role_metadata(role)),
            None => identity,
        }
    }

    fn found(identity: &Identity, role: Role, status: AccountStatus) -> Resolution {
        Resolution::Found {
            profile: NewProfile {
                role,
                status,
                ..NewProfile::from_identity(identity)
            }
            .into_profile(Utc::now()),
        }
    }

    fn ticket_of(effects: &[Effect]) -> Ticket {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Resolve { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .expect("resolve effect")
    }

    #[test]
    fn starts_loading() {
        assert_eq!(AuthState::new().verdict(), Verdict::Loading);
    }

    #[test]
    fn no_stored_session_is_unauthenticated() {
        let mut state = AuthState::new();
        assert!(state.apply(Input::InitialSession(None)).is_empty());
        assert_eq!(state.verdict(), Verdict::Unauthenticated);
    }

    #[test]
    fn stored_session_stays_loading_until_resolved() {
        let user = identity(None);
        let mut state = AuthState::new();

        let effects = state.apply(Input::InitialSession(Some(user.clone())));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Resolve { reconcile: true, .. }]
        ));
        assert_eq!(state.verdict(), Verdict::Loading);

        let ticket = ticket_of(&effects);
        state.apply(Input::Resolved {
            ticket,
            resolution: found(&user, Role::Student, AccountStatus::Active),
        });
        assert_eq!(state.verdict(), Verdict::Authorized(Role::Student));
    }

    #[test]
    fn safety_timeout_ends_loading_and_late_result_still_applies() {
        let user = identity(Some(Role::Teacher));
        let mut state = AuthState::new();
        let effects = state.apply(Input::InitialSession(Some(user.clone())));

        state.apply(Input::SafetyTimeout);
        assert_eq!(state.verdict(), Verdict::AwaitingApproval);

        state.apply(Input::Resolved {
            ticket: ticket_of(&effects),
            resolution: found(&user, Role::Teacher, AccountStatus::Active),
        });
        assert_eq!(state.verdict(), Verdict::Authorized(Role::Teacher));
    }

    #[test]
    fn sign_out_during_fetch_discards_late_result() {
        let user = identity(None);
        let mut state = AuthState::new();
        let effects = state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::SignedIn,
            Some(user.clone()),
        )));

        let effects_out = state.apply(Input::SignOutRequested);
        assert_eq!(effects_out, vec![Effect::ClearIntent, Effect::RemoteSignOut]);

        state.apply(Input::Resolved {
            ticket: ticket_of(&effects),
            resolution: found(&user, Role::Admin, AccountStatus::Active),
        });
        assert_eq!(state.verdict(), Verdict::Unauthenticated);
        assert!(state.profile().is_none());
    }

    #[test]
    fn result_for_previous_identity_is_discarded() {
        let first = identity(None);
        let second = identity(None);
        let mut state = AuthState::new();
        let stale = state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::SignedIn,
            Some(first.clone()),
        )));
        let current = state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::SignedIn,
            Some(second.clone()),
        )));

        state.apply(Input::Resolved {
            ticket: ticket_of(&current),
            resolution: found(&second, Role::Student, AccountStatus::Active),
        });
        state.apply(Input::Resolved {
            ticket: ticket_of(&stale),
            resolution: found(&first, Role::Admin, AccountStatus::Active),
        });

        assert_eq!(state.profile().map(|p| p.id), Some(second.id()));
        assert_eq!(state.verdict(), Verdict::Authorized(Role::Student));
    }

    #[test]
    fn overlapping_resolutions_for_same_identity_last_completion_wins() {
        let user = identity(None);
        let mut state = AuthState::new();
        let signed_in = state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::SignedIn,
            Some(user.clone()),
        )));
        let refreshed = state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::TokenRefreshed,
            Some(user.clone()),
        )));
        assert_eq!(ticket_of(&signed_in), ticket_of(&refreshed));

        state.apply(Input::Resolved {
            ticket: ticket_of(&refreshed),
            resolution: found(&user, Role::Teacher, AccountStatus::Pending),
        });
        state.apply(Input::Resolved {
            ticket: ticket_of(&signed_in),
            resolution: found(&user, Role::Teacher, AccountStatus::Active),
        });
        assert_eq!(state.verdict(), Verdict::Authorized(Role::Teacher));
    }

    #[test]
    fn only_sign_in_reconciles_intent() {
        let user = identity(None);
        let mut state = AuthState::new();
        for (kind, expected) in [
            (AuthEventKind::SignedIn, true),
            (AuthEventKind::TokenRefreshed, false),
            (AuthEventKind::UserUpdated, false),
        ] {
            let effects = state.apply(Input::Auth(AuthEvent::new(kind, Some(user.clone()))));
            assert!(matches!(
                effects.as_slice(),
                [Effect::Resolve { reconcile, .. }] if *reconcile == expected
            ));
        }
    }

    #[test]
    fn signed_out_event_clears_everything() {
        let user = identity(None);
        let mut state = AuthState::new();
        let effects = state.apply(Input::InitialSession(Some(user.clone())));
        state.apply(Input::Resolved {
            ticket: ticket_of(&effects),
            resolution: found(&user, Role::Student, AccountStatus::Active),
        });

        let effects = state.apply(Input::Auth(AuthEvent::new(AuthEventKind::SignedOut, None)));

        assert_eq!(effects, vec![Effect::ClearIntent]);
        assert!(state.identity().is_none());
        assert!(state.profile().is_none());
        assert_eq!(state.verdict(), Verdict::Unauthenticated);
    }

    #[test]
    fn initial_lookup_after_auth_event_is_ignored() {
        let user = identity(None);
        let mut state = AuthState::new();
        state.apply(Input::Auth(AuthEvent::new(AuthEventKind::SignedOut, None)));

        let effects = state.apply(Input::InitialSession(Some(user)));

        assert!(effects.is_empty());
        assert!(state.identity().is_none());
    }

    #[test]
    fn denied_resolution_falls_back_to_metadata() {
        let user = identity(Some(Role::Teacher));
        let mut state = AuthState::new();
        let effects = state.apply(Input::InitialSession(Some(user)));
        state.apply(Input::Resolved {
            ticket: ticket_of(&effects),
            resolution: Resolution::Denied {
                reason: "policy".to_string(),
            },
        });

        let snapshot = state.snapshot();
        assert!(snapshot.is_fallback());
        assert_eq!(snapshot.verdict, Verdict::AwaitingApproval);
        assert!(snapshot.last_resolution.as_ref().is_some_and(Resolution::is_denied));
    }

    #[test]
    fn transient_failure_keeps_last_profile() {
        let user = identity(None);
        let mut state = AuthState::new();
        let effects = state.apply(Input::InitialSession(Some(user.clone())));
        let ticket = ticket_of(&effects);
        state.apply(Input::Resolved {
            ticket,
            resolution: found(&user, Role::Teacher, AccountStatus::Active),
        });

        state.apply(Input::Resolved {
            ticket,
            resolution: Resolution::Failed {
                reason: "timeout".to_string(),
            },
        });

        assert_eq!(state.verdict(), Verdict::Authorized(Role::Teacher));
    }

    #[test]
    fn password_recovery_sets_flag_until_finished() {
        let user = identity(None);
        let mut state = AuthState::new();
        state.apply(Input::Auth(AuthEvent::new(
            AuthEventKind::PasswordRecovery,
            Some(user),
        )));
        assert!(state.snapshot().recovery_in_progress);

        state.apply(Input::RecoveryFinished);
        assert!(!state.snapshot().recovery_in_progress);
    }

    #[test]
    fn refresh_requires_identity() {
        let mut state = AuthState::new();
        assert!(state.refresh().is_none());

        let user = identity(None);
        state.apply(Input::InitialSession(Some(user)));
        assert!(matches!(
            state.refresh(),
            Some(Effect::Resolve { reconcile: false, .. })
        ));
    }
}
