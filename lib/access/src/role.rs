//! Application roles and account status.
//!
//! Roles decide which tools a user reaches; status decides whether they reach
//! them yet. Only teachers go through manual approval, so `Pending` is
//! meaningful for the teacher role alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Application role stored on a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only learning content.
    #[default]
    Student,
    /// Grading and authoring tools, gated behind approval.
    Teacher,
    /// Platform administration.
    Admin,
}

impl Role {
    /// Returns the wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Admin => "admin",
        }
    }

    /// Returns true if this role has admin privileges.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Returns true if accounts with this role need approval before use.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Teacher)
    }

    /// Status assigned to a freshly created profile with this role.
    #[must_use]
    pub fn initial_status(&self) -> AccountStatus {
        if self.requires_approval() {
            AccountStatus::Pending
        } else {
            AccountStatus::Active
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role or status name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// What was being parsed ("role" or "status").
    pub kind: &'static str,
    /// The rejected value.
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            "admin" => Ok(Self::Admin),
            _ => Err(UnknownVariant {
                kind: "role",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Full access for the role.
    Active,
    /// Waiting for an administrator to approve the account.
    Pending,
    /// Access revoked by an administrator.
    Blocked,
}

impl AccountStatus {
    /// Returns the wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Blocked => "blocked",
        }
    }

    /// Status as it applies to the given role.
    ///
    /// `Pending` only holds for teachers; every other role reads as `Active`
    /// unless explicitly blocked.
    #[must_use]
    pub fn effective_for(self, role: Role) -> Self {
        match self {
            Self::Pending if !role.requires_approval() => Self::Active,
            other => other,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            _ => Err(UnknownVariant {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}
