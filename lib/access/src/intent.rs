//! Role intent carried across redirect-based sign-in.
//!
//! A role chosen before leaving for the identity provider is recorded locally
//! and reconciled once the session comes back. The marker is consumed by the
//! first reconciliation attempt whatever its outcome.
//!
//! Profile reads that may race a claim take a turn from the bridge first, so a
//! read never starts while a claim for the same session is still in flight.

use crate::backend::{AuthService, IntentStore, ProfileStore};
use crate::identity::{Identity, role_metadata};
use crate::role::Role;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Process-local intent marker.
#[derive(Debug, Default)]
pub struct MemoryIntentStore {
    slot: Mutex<Option<Role>>,
}

impl MemoryIntentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut Option<Role>) -> T) -> T {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut slot)
    }
}

impl IntentStore for MemoryIntentStore {
    fn put(&self, role: Role) {
        self.with_slot(|slot| *slot = Some(role));
    }

    fn take(&self) -> Option<Role> {
        self.with_slot(Option::take)
    }

    fn peek(&self) -> Option<Role> {
        self.with_slot(|slot| *slot)
    }

    fn clear(&self) {
        self.with_slot(|slot| *slot = None);
    }
}

/// What a reconciliation attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No intent was recorded.
    NoIntent,
    /// The intent names a role that is not reconciled after sign-in.
    Skipped(Role),
    /// The profile already holds the intended role.
    AlreadyHeld(Role),
    /// The server-side claim routine applied the role.
    Claimed,
    /// The claim failed; the role was written to identity metadata instead.
    MetadataFallback,
    /// Both the claim and the fallback failed.
    Failed { reason: String },
}

/// Reconciles a recorded role intent with the profile store.
#[derive(Clone)]
pub struct RoleIntentBridge {
    intents: Arc<dyn IntentStore>,
    auth: Arc<dyn AuthService>,
    store: Arc<dyn ProfileStore>,
    turns: Arc<AsyncMutex<()>>,
}

impl RoleIntentBridge {
    /// Creates a bridge.
    #[must_use]
    pub fn new(
        intents: Arc<dyn IntentStore>,
        auth: Arc<dyn AuthService>,
        store: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            intents,
            auth,
            store,
            turns: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Waits until no other holder is reconciling or reading.
    ///
    /// Turns are granted in request order and shared by every clone.
    pub async fn turn(&self) -> AsyncMutexGuard<'_, ()> {
        self.turns.lock().await
    }

    /// Records the role chosen before a redirect sign-in.
    pub fn record(&self, role: Role) {
        self.intents.put(role);
    }

    /// Drops any recorded intent.
    pub fn clear(&self) {
        self.intents.clear();
    }

    /// Applies a recorded teacher intent to the signed-in identity.
    ///
    /// The claim routine is tried first. If it fails, the role is written to
    /// identity metadata so the gate's fallback still holds the account at
    /// approval. Administrators are never demoted by an intent.
    #[instrument(skip(self, identity), fields(user_id = %identity.id()))]
    pub async fn reconcile(&self, identity: &Identity) -> ReconcileOutcome {
        let Some(intended) = self.intents.take() else {
            return ReconcileOutcome::NoIntent;
        };
        if intended != Role::Teacher {
            debug!(role = %intended, "intent needs no reconciliation");
            return ReconcileOutcome::Skipped(intended);
        }

        let current = match self.store.fetch(identity.id()).await {
            Ok(profile) => profile.map(|p| p.role),
            Err(e) => {
                debug!(error = %e, "profile unreadable before claim");
                None
            }
        };
        match current {
            Some(role) if role == intended => return ReconcileOutcome::AlreadyHeld(role),
            Some(Role::Admin) => {
                info!("ignoring teacher intent for administrator");
                return ReconcileOutcome::Skipped(intended);
            }
            _ => {}
        }

        match self.store.claim_teacher_role().await {
            Ok(()) => {
                info!(previous = ?current, "teacher role claimed, awaiting approval");
                ReconcileOutcome::Claimed
            }
            Err(claim_err) => {
                warn!(error = %claim_err, "teacher claim failed, writing role to metadata");
                match self.auth.update_user_metadata(role_metadata(intended)).await {
                    Ok(_) => ReconcileOutcome::MetadataFallback,
                    Err(e) => {
                        warn!(error = %e, "metadata fallback failed");
                        ReconcileOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        }
    }
}
