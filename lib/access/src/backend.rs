//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to the network directly. Everything it needs from
//! the hosted auth service and the profile table goes through these traits, so
//! a fresh in-memory backend can stand in for the real one in every test.

use crate::error::{AuthServiceError, StoreError};
use crate::identity::{Identity, Metadata};
use crate::profile::{NewProfile, Profile, ProfilePatch};
use crate::role::Role;
use async_trait::async_trait;
use futures::stream::BoxStream;
use onluyen_core::UserId;
use serde::{Deserialize, Serialize};

/// Kinds of auth-state notifications pushed by the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    /// A new session was established.
    SignedIn,
    /// The session ended.
    SignedOut,
    /// The access token was renewed for the same identity.
    TokenRefreshed,
    /// Identity fields (such as metadata) changed.
    UserUpdated,
    /// The user followed a password-recovery link.
    PasswordRecovery,
}

/// An auth-state notification.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    /// What happened.
    pub kind: AuthEventKind,
    /// The identity after the event, if any.
    pub identity: Option<Identity>,
}

impl AuthEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(kind: AuthEventKind, identity: Option<Identity>) -> Self {
        Self { kind, identity }
    }
}

/// Push channel of auth events.
pub type AuthEventStream = BoxStream<'static, AuthEvent>;

/// Result of a signup request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    /// The service issued a session immediately.
    SignedIn(Identity),
    /// The user must confirm their email before signing in.
    ConfirmationRequired,
}

/// The hosted authentication service.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Returns the identity of the stored session, if any.
    async fn current_session(&self) -> Result<Option<Identity>, AuthServiceError>;

    /// Subscribes to auth-state notifications for the rest of the process.
    fn subscribe(&self) -> AuthEventStream;

    /// Ends the current session on the server.
    async fn sign_out(&self) -> Result<(), AuthServiceError>;

    /// Signs in with email and password.
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, AuthServiceError>;

    /// Registers a new account carrying the given metadata.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> Result<SignUpOutcome, AuthServiceError>;

    /// Starts a redirect-based sign-in and returns the provider URL.
    ///
    /// The metadata is only applied when the provider creates a new account;
    /// existing accounts keep whatever they had.
    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
        metadata: Metadata,
    ) -> Result<String, AuthServiceError>;

    /// Sends a one-time code to an email address or phone number.
    async fn send_one_time_code(
        &self,
        destination: &str,
        metadata: Metadata,
    ) -> Result<(), AuthServiceError>;

    /// Verifies a one-time code and signs in.
    async fn verify_one_time_code(
        &self,
        destination: &str,
        code: &str,
    ) -> Result<Identity, AuthServiceError>;

    /// Merges fields into the current identity's metadata.
    async fn update_user_metadata(&self, fields: Metadata) -> Result<Identity, AuthServiceError>;

    /// Sends a password-recovery link.
    async fn reset_password_for(&self, email: &str, redirect_to: &str)
    -> Result<(), AuthServiceError>;
}

/// A row-level change on the profile table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A row was created.
    Insert(Profile),
    /// A row was modified; carries the new row.
    Update(Profile),
    /// A row was removed.
    Delete { id: UserId },
}

impl ChangeEvent {
    /// Id of the affected row.
    #[must_use]
    pub fn id(&self) -> UserId {
        match self {
            Self::Insert(p) | Self::Update(p) => p.id,
            Self::Delete { id } => *id,
        }
    }
}

/// Push channel of profile changes.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// The profile record store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Reads a row by id. `Ok(None)` means the row does not exist.
    async fn fetch(&self, id: UserId) -> Result<Option<Profile>, StoreError>;

    /// Inserts a new row.
    async fn insert(&self, profile: NewProfile) -> Result<(), StoreError>;

    /// Updates a row by id.
    async fn update(&self, id: UserId, patch: ProfilePatch) -> Result<(), StoreError>;

    /// Lists every row, newest first.
    async fn list(&self) -> Result<Vec<Profile>, StoreError>;

    /// Server-side routine that turns the calling identity into a pending
    /// teacher, bypassing the policy that forbids self-service role changes.
    async fn claim_teacher_role(&self) -> Result<(), StoreError>;

    /// Subscribes to row changes on a table.
    async fn subscribe(&self, table: &str) -> Result<ChangeStream, StoreError>;
}

/// Process-local holder for a role chosen before a redirect sign-in.
pub trait IntentStore: Send + Sync {
    /// Records the chosen role, replacing any previous one.
    fn put(&self, role: Role);

    /// Reads and clears the recorded role in one step.
    fn take(&self) -> Option<Role>;

    /// Reads the recorded role without clearing it.
    fn peek(&self) -> Option<Role>;

    /// Clears any recorded role.
    fn clear(&self);
}
