//! In-memory auth service and profile store.
//!
//! One [`MemoryBackend`] plays both collaborators over shared state, so
//! sign-ins, profile rows and change notifications stay consistent with each
//! other. Faults can be switched on per operation through [`Faults`], and
//! profile reads can be held open or answered late to stage races.

use crate::backend::{
    AuthEvent, AuthEventKind, AuthEventStream, AuthService, ChangeEvent, ChangeStream,
    ProfileStore, SignUpOutcome,
};
use crate::error::{AuthServiceError, StoreError};
use crate::identity::{Identity, Metadata};
use crate::profile::{NewProfile, Profile, ProfilePatch};
use crate::role::{AccountStatus, Role};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use onluyen_core::UserId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Table name the backend serves change notifications for.
pub const PROFILES_TABLE: &str = "profiles";

/// Code issued by [`MemoryBackend::send_one_time_code`].
pub const ONE_TIME_CODE: &str = "246810";

const EVENT_CAPACITY: usize = 256;

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetches: usize,
    pub inserts: usize,
    pub updates: usize,
    pub lists: usize,
    pub claims: usize,
    pub sign_outs: usize,
    pub metadata_updates: usize,
}

#[derive(Debug, Default)]
struct FaultFlags {
    deny_reads: bool,
    unavailable: bool,
    hide_next_read: bool,
    deny_inserts: bool,
    reject_updates: bool,
    fail_claim: bool,
    fail_sign_out: bool,
    fail_metadata: bool,
    fail_oauth: bool,
    require_confirmation: bool,
}

struct Account {
    identity: Identity,
    password: String,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    session: Option<Identity>,
    profiles: Vec<Profile>,
    pending_oauth: Option<Metadata>,
    pending_codes: HashMap<String, Metadata>,
    recovery_requests: Vec<String>,
    faults: FaultFlags,
    calls: CallCounts,
    fetch_latency: VecDeque<Duration>,
    list_latency: VecDeque<Duration>,
}

struct Shared {
    state: Mutex<State>,
    auth_events: broadcast::Sender<AuthEvent>,
    changes: broadcast::Sender<ChangeEvent>,
    reads_paused: watch::Sender<bool>,
    session_stalled: watch::Sender<bool>,
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend with no session.
    #[must_use]
    pub fn new() -> Self {
        let (auth_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (changes, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                auth_events,
                changes,
                reads_paused: watch::Sender::new(false),
                session_stalled: watch::Sender::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, kind: AuthEventKind, identity: Option<Identity>) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.shared.auth_events.send(AuthEvent::new(kind, identity));
    }

    fn publish(&self, change: ChangeEvent) {
        let _ = self.shared.changes.send(change);
    }

    /// Fault switches.
    #[must_use]
    pub fn faults(&self) -> Faults<'_> {
        Faults { backend: self }
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Creates an account without signing in.
    pub fn register(&self, email: &str, password: &str, metadata: Metadata) -> Identity {
        let identity = Identity::new(Some(email.to_string())).with_metadata(metadata);
        self.state().accounts.insert(
            email.to_lowercase(),
            Account {
                identity: identity.clone(),
                password: password.to_string(),
            },
        );
        identity
    }

    /// Sets the stored session without notifying, as if it survived a restart.
    pub fn restore_session(&self, identity: Option<Identity>) {
        self.state().session = identity;
    }

    /// Returns the current session identity.
    #[must_use]
    pub fn session(&self) -> Option<Identity> {
        self.state().session.clone()
    }

    /// Pushes an arbitrary auth event.
    pub fn push_event(&self, kind: AuthEventKind, identity: Option<Identity>) {
        self.emit(kind, identity);
    }

    /// Renews the session token for the current identity.
    pub fn refresh_token(&self) {
        let session = self.session();
        if session.is_some() {
            self.emit(AuthEventKind::TokenRefreshed, session);
        }
    }

    /// Completes a pending redirect sign-in for `email`.
    ///
    /// New accounts receive the metadata recorded when the redirect started;
    /// existing accounts keep theirs.
    pub fn complete_oauth(&self, email: &str) -> Identity {
        let identity = {
            let mut state = self.state();
            let metadata = state.pending_oauth.take().unwrap_or_default();
            let identity = state
                .accounts
                .entry(email.to_lowercase())
                .or_insert_with(|| Account {
                    identity: Identity::new(Some(email.to_string())).with_metadata(metadata),
                    password: String::new(),
                })
                .identity
                .clone();
            state.session = Some(identity.clone());
            identity
        };
        self.emit(AuthEventKind::SignedIn, Some(identity.clone()));
        identity
    }

    /// Follows a password-recovery link for `email`.
    pub fn follow_recovery_link(&self, email: &str) -> Option<Identity> {
        let identity = {
            let mut state = self.state();
            let identity = state.accounts.get(&email.to_lowercase())?.identity.clone();
            state.session = Some(identity.clone());
            identity
        };
        self.emit(AuthEventKind::PasswordRecovery, Some(identity.clone()));
        Some(identity)
    }

    /// Addresses that asked for a recovery link.
    #[must_use]
    pub fn recovery_requests(&self) -> Vec<String> {
        self.state().recovery_requests.clone()
    }

    /// Writes a profile row directly, without a change notification.
    pub fn seed_profile(&self, identity: &Identity, role: Role, status: AccountStatus) -> Profile {
        let profile = NewProfile {
            role,
            status,
            ..NewProfile::from_identity(identity)
        }
        .into_profile(Utc::now());
        let mut state = self.state();
        state.profiles.retain(|p| p.id != profile.id);
        state.profiles.push(profile.clone());
        profile
    }

    /// Applies a change as another administrator would, notifying subscribers.
    pub fn admin_update(&self, id: UserId, patch: &ProfilePatch) -> Option<Profile> {
        let updated = {
            let mut state = self.state();
            let row = state.profiles.iter_mut().find(|p| p.id == id)?;
            row.apply(patch);
            row.clone()
        };
        self.publish(ChangeEvent::Update(updated.clone()));
        Some(updated)
    }

    /// Removes a row, notifying subscribers.
    pub fn admin_delete(&self, id: UserId) -> bool {
        let removed = {
            let mut state = self.state();
            let before = state.profiles.len();
            state.profiles.retain(|p| p.id != id);
            state.profiles.len() != before
        };
        if removed {
            self.publish(ChangeEvent::Delete { id });
        }
        removed
    }

    /// Pushes a raw change notification without touching the rows.
    pub fn push_change(&self, change: ChangeEvent) {
        self.publish(change);
    }

    /// Reads a row directly.
    #[must_use]
    pub fn profile(&self, id: UserId) -> Option<Profile> {
        self.state().profiles.iter().find(|p| p.id == id).cloned()
    }

    /// Number of rows.
    #[must_use]
    pub fn profile_count(&self) -> usize {
        self.state().profiles.len()
    }

    /// Holds every profile read until [`resume_reads`](Self::resume_reads).
    pub fn pause_reads(&self) {
        self.shared.reads_paused.send_replace(true);
    }

    /// Releases held profile reads.
    pub fn resume_reads(&self) {
        self.shared.reads_paused.send_replace(false);
    }

    /// Delays the answers of the next profile reads, one entry per call.
    ///
    /// The row is read when the call arrives; only the reply is late.
    pub fn delay_fetch_replies(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state().fetch_latency.extend(delays);
    }

    /// Delays the answers of the next listings, one entry per call.
    pub fn delay_list_replies(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state().list_latency.extend(delays);
    }

    /// Makes session lookups hang until released.
    pub fn stall_session(&self, stalled: bool) {
        self.shared.session_stalled.send_replace(stalled);
    }

    fn sign_in_session(&self, identity: &Identity) {
        self.state().session = Some(identity.clone());
        self.emit(AuthEventKind::SignedIn, Some(identity.clone()));
    }
}

/// Fault switches for a [`MemoryBackend`].
pub struct Faults<'a> {
    backend: &'a MemoryBackend,
}

impl Faults<'_> {
    fn set(&self, f: impl FnOnce(&mut FaultFlags)) -> &Self {
        f(&mut self.backend.state().faults);
        self
    }

    /// Profile reads are rejected by access policy.
    pub fn deny_reads(&self, on: bool) -> &Self {
        self.set(|flags| flags.deny_reads = on)
    }

    /// Profile reads fail transiently.
    pub fn unavailable(&self, on: bool) -> &Self {
        self.set(|flags| flags.unavailable = on)
    }

    /// The next profile read reports no row even if one exists.
    pub fn hide_next_read(&self, on: bool) -> &Self {
        self.set(|flags| flags.hide_next_read = on)
    }

    /// Profile inserts are rejected by access policy.
    pub fn deny_inserts(&self, on: bool) -> &Self {
        self.set(|flags| flags.deny_inserts = on)
    }

    /// Profile updates are rejected.
    pub fn reject_updates(&self, on: bool) -> &Self {
        self.set(|flags| flags.reject_updates = on)
    }

    /// The teacher claim routine fails.
    pub fn fail_claim(&self, on: bool) -> &Self {
        self.set(|flags| flags.fail_claim = on)
    }

    /// Remote sign-out fails.
    pub fn fail_sign_out(&self, on: bool) -> &Self {
        self.set(|flags| flags.fail_sign_out = on)
    }

    /// Metadata updates fail.
    pub fn fail_metadata(&self, on: bool) -> &Self {
        self.set(|flags| flags.fail_metadata = on)
    }

    /// Redirect sign-in cannot start.
    pub fn fail_oauth(&self, on: bool) -> &Self {
        self.set(|flags| flags.fail_oauth = on)
    }

    /// Signups wait for email confirmation instead of signing in.
    pub fn require_confirmation(&self, on: bool) -> &Self {
        self.set(|flags| flags.require_confirmation = on)
    }
}

#[async_trait]
impl AuthService for MemoryBackend {
    async fn current_session(&self) -> Result<Option<Identity>, AuthServiceError> {
        let mut stalled = self.shared.session_stalled.subscribe();
        // Sender lives in self, so this only errors if the backend is gone.
        let _ = stalled.wait_for(|stalled| !*stalled).await;
        Ok(self.session())
    }

    fn subscribe(&self) -> AuthEventStream {
        BroadcastStream::new(self.shared.auth_events.subscribe())
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed()
    }

    async fn sign_out(&self) -> Result<(), AuthServiceError> {
        {
            let mut state = self.state();
            state.calls.sign_outs += 1;
            if state.faults.fail_sign_out {
                return Err(AuthServiceError::Unavailable {
                    reason: "sign-out request timed out".to_string(),
                });
            }
            state.session = None;
        }
        self.emit(AuthEventKind::SignedOut, None);
        Ok(())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, AuthServiceError> {
        let identity = {
            let state = self.state();
            match state.accounts.get(&email.to_lowercase()) {
                Some(account) if account.password == password && !password.is_empty() => {
                    account.identity.clone()
                }
                _ => return Err(AuthServiceError::InvalidCredentials),
            }
        };
        self.sign_in_session(&identity);
        Ok(identity)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> Result<SignUpOutcome, AuthServiceError> {
        let confirm = {
            let state = self.state();
            if state.accounts.contains_key(&email.to_lowercase()) {
                return Err(AuthServiceError::Rejected {
                    reason: "user already registered".to_string(),
                });
            }
            state.faults.require_confirmation
        };
        let identity = self.register(email, password, metadata);
        if confirm {
            return Ok(SignUpOutcome::ConfirmationRequired);
        }
        self.sign_in_session(&identity);
        Ok(SignUpOutcome::SignedIn(identity))
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
        metadata: Metadata,
    ) -> Result<String, AuthServiceError> {
        let mut state = self.state();
        if state.faults.fail_oauth {
            return Err(AuthServiceError::ProviderError {
                provider: provider.to_string(),
                reason: "provider is not enabled".to_string(),
            });
        }
        state.pending_oauth = Some(metadata);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to)
            .finish();
        Ok(format!("https://auth.invalid/authorize?{query}"))
    }

    async fn send_one_time_code(
        &self,
        destination: &str,
        metadata: Metadata,
    ) -> Result<(), AuthServiceError> {
        debug!(%destination, "issuing one-time code");
        self.state()
            .pending_codes
            .insert(destination.to_lowercase(), metadata);
        Ok(())
    }

    async fn verify_one_time_code(
        &self,
        destination: &str,
        code: &str,
    ) -> Result<Identity, AuthServiceError> {
        let identity = {
            let mut state = self.state();
            let key = destination.to_lowercase();
            if code != ONE_TIME_CODE || !state.pending_codes.contains_key(&key) {
                return Err(AuthServiceError::InvalidCredentials);
            }
            let metadata = state.pending_codes.remove(&key).unwrap_or_default();
            state
                .accounts
                .entry(key)
                .or_insert_with(|| Account {
                    identity: Identity::new(Some(destination.to_string())).with_metadata(metadata),
                    password: String::new(),
                })
                .identity
                .clone()
        };
        self.sign_in_session(&identity);
        Ok(identity)
    }

    async fn update_user_metadata(&self, fields: Metadata) -> Result<Identity, AuthServiceError> {
        let identity = {
            let mut state = self.state();
            state.calls.metadata_updates += 1;
            if state.faults.fail_metadata {
                return Err(AuthServiceError::Unavailable {
                    reason: "metadata update timed out".to_string(),
                });
            }
            let Some(mut identity) = state.session.clone() else {
                return Err(AuthServiceError::NotAuthenticated);
            };
            identity.merge_metadata(fields);
            if let Some(email) = identity.email() {
                if let Some(account) = state.accounts.get_mut(&email.to_lowercase()) {
                    account.identity = identity.clone();
                }
            }
            state.session = Some(identity.clone());
            identity
        };
        self.emit(AuthEventKind::UserUpdated, Some(identity.clone()));
        Ok(identity)
    }

    async fn reset_password_for(
        &self,
        email: &str,
        _redirect_to: &str,
    ) -> Result<(), AuthServiceError> {
        self.state().recovery_requests.push(email.to_string());
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn fetch(&self, id: UserId) -> Result<Option<Profile>, StoreError> {
        let mut paused = self.shared.reads_paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;

        let (row, latency) = {
            let mut state = self.state();
            state.calls.fetches += 1;
            let latency = state.fetch_latency.pop_front();
            let row = if state.faults.deny_reads {
                Err(StoreError::Denied {
                    reason: "row-level policy rejected select on profiles".to_string(),
                })
            } else if state.faults.unavailable {
                Err(StoreError::Unavailable {
                    reason: "connection reset".to_string(),
                })
            } else if std::mem::take(&mut state.faults.hide_next_read) {
                Ok(None)
            } else {
                Ok(state.profiles.iter().find(|p| p.id == id).cloned())
            };
            (row, latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        row
    }

    async fn insert(&self, profile: NewProfile) -> Result<(), StoreError> {
        let row = {
            let mut state = self.state();
            state.calls.inserts += 1;
            if state.faults.deny_inserts {
                return Err(StoreError::Denied {
                    reason: "row-level policy rejected insert on profiles".to_string(),
                });
            }
            if state.profiles.iter().any(|p| p.id == profile.id) {
                return Err(StoreError::Conflict { id: profile.id });
            }
            let row = profile.into_profile(Utc::now());
            state.profiles.push(row.clone());
            row
        };
        self.publish(ChangeEvent::Insert(row));
        Ok(())
    }

    async fn update(&self, id: UserId, patch: ProfilePatch) -> Result<(), StoreError> {
        let row = {
            let mut state = self.state();
            state.calls.updates += 1;
            if state.faults.reject_updates {
                return Err(StoreError::Rejected {
                    reason: "update violates row-level policy".to_string(),
                });
            }
            let Some(row) = state.profiles.iter_mut().find(|p| p.id == id) else {
                return Err(StoreError::Rejected {
                    reason: format!("no profile {id}"),
                });
            };
            row.apply(&patch);
            row.clone()
        };
        self.publish(ChangeEvent::Update(row));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Profile>, StoreError> {
        let (rows, latency) = {
            let mut state = self.state();
            state.calls.lists += 1;
            let latency = state.list_latency.pop_front();
            if state.faults.deny_reads {
                return Err(StoreError::Denied {
                    reason: "row-level policy rejected select on profiles".to_string(),
                });
            }
            let mut rows: Vec<Profile> = state.profiles.iter().rev().cloned().collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            (rows, latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(rows)
    }

    async fn claim_teacher_role(&self) -> Result<(), StoreError> {
        let change = {
            let mut state = self.state();
            state.calls.claims += 1;
            if state.faults.fail_claim {
                return Err(StoreError::Rejected {
                    reason: "function claim_teacher_role() does not exist".to_string(),
                });
            }
            let Some(identity) = state.session.clone() else {
                return Err(StoreError::Denied {
                    reason: "claim requires an authenticated caller".to_string(),
                });
            };
            let patch = ProfilePatch {
                role: Some(Role::Teacher),
                status: Some(AccountStatus::Pending),
                ..ProfilePatch::default()
            };
            match state.profiles.iter_mut().find(|p| p.id == identity.id()) {
                Some(row) => {
                    row.apply(&patch);
                    ChangeEvent::Update(row.clone())
                }
                None => {
                    let row = NewProfile {
                        role: Role::Teacher,
                        status: AccountStatus::Pending,
                        ..NewProfile::from_identity(&identity)
                    }
                    .into_profile(Utc::now());
                    state.profiles.push(row.clone());
                    ChangeEvent::Insert(row)
                }
            }
        };
        self.publish(change);
        Ok(())
    }

    async fn subscribe(&self, table: &str) -> Result<ChangeStream, StoreError> {
        if table != PROFILES_TABLE {
            return Err(StoreError::Rejected {
                reason: format!("unknown table '{table}'"),
            });
        }
        Ok(BroadcastStream::new(self.shared.changes.subscribe())
            .filter_map(|change| futures::future::ready(change.ok()))
            .boxed())
    }
}
