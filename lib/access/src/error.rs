//! Error types for the access crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `AuthServiceError`: failures reported by the external auth service
//! - `StoreError`: failures reported by the profile store
//! - `EngineError`: the engine loop is gone or has nothing to act on
//! - `SignInError`: sign-in helpers that add profile checks on top of auth
//! - `RosterError`: administrative roster operations

use crate::role::Role;
use onluyen_core::UserId;
use std::fmt;

/// Errors from the external auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthServiceError {
    /// Email/password (or code) did not match.
    InvalidCredentials,
    /// No authenticated identity for an operation that needs one.
    NotAuthenticated,
    /// The identity provider refused or failed the request.
    ProviderError { provider: String, reason: String },
    /// Network or timeout failure.
    Unavailable { reason: String },
    /// The service rejected the request.
    Rejected { reason: String },
}

impl fmt::Display for AuthServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "invalid login credentials"),
            Self::NotAuthenticated => write!(f, "no authenticated identity"),
            Self::ProviderError { provider, reason } => {
                write!(f, "identity provider '{provider}' error: {reason}")
            }
            Self::Unavailable { reason } => write!(f, "auth service unavailable: {reason}"),
            Self::Rejected { reason } => write!(f, "auth service rejected request: {reason}"),
        }
    }
}

impl std::error::Error for AuthServiceError {}

/// Errors from the profile store.
///
/// `Denied` is an access-policy rejection and must never be read as a missing
/// row: the remedy is operator configuration, not record creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Access policy rejected the operation.
    Denied { reason: String },
    /// A row with this id already exists.
    Conflict { id: UserId },
    /// Network or timeout failure.
    Unavailable { reason: String },
    /// The store rejected the operation for another reason.
    Rejected { reason: String },
}

impl StoreError {
    /// Returns true for access-policy rejections.
    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { reason } => write!(f, "access denied by policy: {reason}"),
            Self::Conflict { id } => write!(f, "profile already exists: {id}"),
            Self::Unavailable { reason } => write!(f, "profile store unavailable: {reason}"),
            Self::Rejected { reason } => write!(f, "profile store rejected request: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the engine handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine loop has shut down.
    Stopped,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "auth engine has stopped"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Errors from engine sign-in helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInError {
    /// The auth service failed the request.
    Auth(AuthServiceError),
    /// Credentials were accepted but the profile is blocked.
    Blocked { user_id: UserId },
}

impl fmt::Display for SignInError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "sign-in failed: {e}"),
            Self::Blocked { user_id } => write!(f, "account {user_id} is blocked"),
        }
    }
}

impl std::error::Error for SignInError {}

impl From<AuthServiceError> for SignInError {
    fn from(e: AuthServiceError) -> Self {
        Self::Auth(e)
    }
}

/// Errors from roster operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    /// The current verdict is not an authorized administrator.
    NotAdmin,
    /// Administrators may not block or re-role themselves.
    SelfTarget { id: UserId },
    /// Role change to a role the roster does not hand out.
    UnsupportedRole { role: Role },
    /// The store failed the operation.
    Store(StoreError),
}

impl fmt::Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAdmin => write!(f, "administrator access required"),
            Self::SelfTarget { id } => {
                write!(f, "administrators cannot change their own account: {id}")
            }
            Self::UnsupportedRole { role } => write!(f, "cannot assign role '{role}'"),
            Self::Store(e) => write!(f, "roster store error: {e}"),
        }
    }
}

impl std::error::Error for RosterError {}

impl From<StoreError> for RosterError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
