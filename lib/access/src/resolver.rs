//! Profile resolution.
//!
//! Turns an identity into its profile row, creating the row from identity
//! metadata when it is missing. Never fails past its boundary: every outcome,
//! including store failures, comes back as a [`Resolution`].

use crate::backend::ProfileStore;
use crate::error::StoreError;
use crate::identity::Identity;
use crate::profile::{NewProfile, Profile};
use onluyen_core::UserId;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of resolving a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    /// The profile row.
    Found { profile: Profile },
    /// No row, and creating one did not succeed.
    NotFound,
    /// Access policy rejected the read.
    Denied { reason: String },
    /// Transient failure; retry with a manual refresh.
    Failed { reason: String },
}

impl Resolution {
    /// Returns the resolved profile, if any.
    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Found { profile } => Some(profile),
            _ => None,
        }
    }

    /// Returns true for an access-policy rejection.
    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// Resolves profiles against a store.
#[derive(Clone)]
pub struct ProfileResolver {
    store: Arc<dyn ProfileStore>,
}

impl ProfileResolver {
    /// Creates a resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Resolves the profile for an identity.
    ///
    /// A missing row is created once from identity metadata and read back
    /// once; if creation fails the caller sees `NotFound` rather than a retry
    /// loop. Safe to call repeatedly.
    #[instrument(skip(self, identity), fields(user_id = %identity.id()))]
    pub async fn resolve(&self, identity: &Identity) -> Resolution {
        match self.read(identity.id()).await {
            Resolution::NotFound => {}
            other => return other,
        }

        let row = NewProfile::from_identity(identity);
        info!(role = %row.role, status = %row.status, "profile missing, creating default");

        match self.store.insert(row).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                debug!("profile created concurrently, reading it back");
            }
            Err(e) => {
                warn!(error = %e, "profile creation failed");
                return Resolution::NotFound;
            }
        }

        self.read(identity.id()).await
    }

    async fn read(&self, id: UserId) -> Resolution {
        match self.store.fetch(id).await {
            Ok(Some(profile)) => Resolution::Found { profile },
            Ok(None) => Resolution::NotFound,
            Err(StoreError::Denied { reason }) => {
                error!(%reason, "profile read denied by access policy");
                Resolution::Denied { reason }
            }
            Err(e) => {
                warn!(error = %e, "profile read failed");
                Resolution::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
