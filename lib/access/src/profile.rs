//! Durable application profile, one row per identity.

use crate::identity::Identity;
use crate::role::{AccountStatus, Role};
use chrono::{DateTime, Utc};
use onluyen_core::UserId;
use serde::{Deserialize, Serialize};

/// Application-level record for a user.
///
/// Created lazily on first authentication and never deleted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Same id as the owning identity.
    pub id: UserId,
    /// Contact email copied from the identity.
    pub email: Option<String>,
    /// Application role.
    pub role: Role,
    /// Approval status.
    pub status: AccountStatus,
    /// Name shown in the UI.
    pub full_name: Option<String>,
    /// Avatar reference.
    pub avatar_url: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Status after applying role rules (see [`AccountStatus::effective_for`]).
    #[must_use]
    pub fn effective_status(&self) -> AccountStatus {
        self.status.effective_for(self.role)
    }

    /// Applies a patch in place.
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(role) = patch.role {
            self.role = role;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(name) = &patch.full_name {
            self.full_name = Some(name.clone());
        }
        if let Some(avatar) = &patch.avatar_url {
            self.avatar_url = Some(avatar.clone());
        }
    }
}

/// Row written when a profile is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProfile {
    /// Id of the identity the row belongs to.
    pub id: UserId,
    /// Contact email.
    pub email: Option<String>,
    /// Role taken from identity metadata.
    pub role: Role,
    /// Initial status for that role.
    pub status: AccountStatus,
    /// Display name.
    pub full_name: Option<String>,
    /// Avatar reference.
    pub avatar_url: Option<String>,
}

impl NewProfile {
    /// Derives a row from the best metadata the identity carries.
    ///
    /// Role defaults to student; teachers start pending, everyone else active.
    #[must_use]
    pub fn from_identity(identity: &Identity) -> Self {
        let role = identity.requested_role().unwrap_or_default();
        Self {
            id: identity.id(),
            email: identity.email().map(str::to_string),
            role,
            status: role.initial_status(),
            full_name: identity.display_name(),
            avatar_url: identity.avatar_url().map(str::to_string),
        }
    }

    /// Materialises the row as the store would persist it.
    #[must_use]
    pub fn into_profile(self, created_at: DateTime<Utc>) -> Profile {
        Profile {
            id: self.id,
            email: self.email,
            role: self.role,
            status: self.status,
            full_name: self.full_name,
            avatar_url: self.avatar_url,
            created_at,
        }
    }
}

/// Partial update of a profile row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfilePatch {
    /// Patch that only changes status.
    #[must_use]
    pub fn status(status: AccountStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that only changes role.
    #[must_use]
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    /// Returns true if the patch touches administrator-only fields.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.role.is_some() || self.status.is_some()
    }
}
