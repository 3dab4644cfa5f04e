//! Live profile roster for administrators.
//!
//! A [`RosterHandle`] holds a local copy of the profile table, keeps it in
//! sync with the store's change stream and applies administrative mutations
//! optimistically. The subscription lives exactly as long as both the handle
//! and the administrator verdict: dropping the handle or losing the verdict
//! releases it.

use crate::backend::{ChangeEvent, ChangeStream, ProfileStore};
use crate::error::RosterError;
use crate::profile::{Profile, ProfilePatch};
use crate::role::{AccountStatus, Role};
use crate::state::AuthSnapshot;
use futures::StreamExt;
use onluyen_core::{Result, UserId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Local copy of the profile table, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterSnapshot {
    profiles: Vec<Profile>,
}

/// Counts shown on the administrator dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RosterStats {
    pub total: usize,
    pub teachers: usize,
    pub students: usize,
    pub admins: usize,
    pub pending_teachers: usize,
    pub blocked: usize,
}

impl RosterSnapshot {
    /// Creates a snapshot from rows in store order.
    #[must_use]
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    #[must_use]
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: UserId) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    fn position(&self, id: UserId) -> Option<usize> {
        self.profiles.iter().position(|p| p.id == id)
    }

    /// Applies a change notification. Returns true if the snapshot changed.
    ///
    /// Inserts for a known id replace the row instead of duplicating it, and
    /// updates for an unknown id are ignored, so replays and out-of-order
    /// delivery converge.
    pub fn apply(&mut self, change: &ChangeEvent) -> bool {
        match change {
            ChangeEvent::Insert(row) => match self.position(row.id) {
                Some(i) => replace(&mut self.profiles[i], row),
                None => {
                    self.profiles.insert(0, row.clone());
                    true
                }
            },
            ChangeEvent::Update(row) => match self.position(row.id) {
                Some(i) => replace(&mut self.profiles[i], row),
                None => {
                    debug!(id = %row.id, "update for unknown row ignored");
                    false
                }
            },
            ChangeEvent::Delete { id } => match self.position(*id) {
                Some(i) => {
                    self.profiles.remove(i);
                    true
                }
                None => false,
            },
        }
    }

    /// Applies a patch to one row. Returns true if the snapshot changed.
    pub fn patch(&mut self, id: UserId, patch: &ProfilePatch) -> bool {
        let Some(row) = self.profiles.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        let before = row.clone();
        row.apply(patch);
        *row != before
    }

    /// Dashboard counts.
    #[must_use]
    pub fn stats(&self) -> RosterStats {
        self.profiles
            .iter()
            .fold(RosterStats::default(), |mut stats, p| {
                stats.total += 1;
                match p.role {
                    Role::Teacher => stats.teachers += 1,
                    Role::Student => stats.students += 1,
                    Role::Admin => stats.admins += 1,
                }
                match p.effective_status() {
                    AccountStatus::Pending => stats.pending_teachers += 1,
                    AccountStatus::Blocked => stats.blocked += 1,
                    AccountStatus::Active => {}
                }
                stats
            })
    }

    /// Rows matching a role and a case-insensitive name or email search.
    #[must_use]
    pub fn filter(&self, role: Option<Role>, search: &str) -> Vec<&Profile> {
        let needle = search.trim().to_lowercase();
        self.profiles
            .iter()
            .filter(|p| role.is_none_or(|role| p.role == role))
            .filter(|p| {
                needle.is_empty()
                    || [p.full_name.as_deref(), p.email.as_deref()]
                        .into_iter()
                        .flatten()
                        .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Teachers waiting for approval.
    #[must_use]
    pub fn pending_teachers(&self) -> Vec<&Profile> {
        self.profiles
            .iter()
            .filter(|p| p.role == Role::Teacher && p.effective_status() == AccountStatus::Pending)
            .collect()
    }
}

fn replace(slot: &mut Profile, row: &Profile) -> bool {
    if slot == row {
        return false;
    }
    *slot = row.clone();
    true
}

struct Shared {
    store: Arc<dyn ProfileStore>,
    admin_id: UserId,
    state: watch::Sender<RosterSnapshot>,
    journal: Mutex<Journal>,
}

/// Changes applied while at least one reload is reading the table.
#[derive(Default)]
struct Journal {
    reloads: usize,
    changes: Vec<ChangeEvent>,
}

impl Shared {
    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, change: ChangeEvent) {
        let mut journal = self.journal();
        self.state.send_if_modified(|s| s.apply(&change));
        if journal.reloads > 0 {
            journal.changes.push(change);
        }
    }
}

/// A reload in progress. Changes applied while it is open are replayed onto
/// the rows it publishes.
struct ReloadWindow<'a> {
    shared: &'a Shared,
    from: usize,
}

impl<'a> ReloadWindow<'a> {
    fn open(shared: &'a Shared) -> Self {
        let mut journal = shared.journal();
        journal.reloads += 1;
        Self {
            shared,
            from: journal.changes.len(),
        }
    }

    fn publish(&self, rows: Vec<Profile>) {
        let journal = self.shared.journal();
        let mut snapshot = RosterSnapshot::new(rows);
        let mut replayed = 0;
        for change in journal.changes.iter().skip(self.from) {
            snapshot.apply(change);
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, "replayed changes received during reload");
        }
        self.shared.state.send_replace(snapshot);
    }
}

impl Drop for ReloadWindow<'_> {
    fn drop(&mut self) {
        let mut journal = self.shared.journal();
        journal.reloads -= 1;
        if journal.reloads == 0 {
            journal.changes.clear();
        }
    }
}

/// Administrator view of the profile table.
///
/// Dropping the handle cancels the change subscription.
pub struct RosterHandle {
    shared: Arc<Shared>,
    listener: JoinHandle<()>,
}

impl RosterHandle {
    /// Loads the roster and subscribes to changes.
    ///
    /// The subscription is opened before the initial load so no change can
    /// fall between the two.
    ///
    /// # Errors
    ///
    /// Returns an error if the verdict is not an authorized administrator or
    /// the store cannot be read.
    #[instrument(skip(store, auth))]
    pub async fn open(
        store: Arc<dyn ProfileStore>,
        table: &str,
        auth: watch::Receiver<AuthSnapshot>,
    ) -> Result<Self, RosterError> {
        let admin_id = {
            let snapshot = auth.borrow();
            match snapshot.user_id() {
                Some(id) if snapshot.verdict.is_admin() => id,
                _ => return Err(RosterError::NotAdmin.into()),
            }
        };

        let changes = store.subscribe(table).await.map_err(RosterError::Store)?;
        let rows = store.list().await.map_err(RosterError::Store)?;
        info!(rows = rows.len(), "roster loaded");

        let shared = Arc::new(Shared {
            store,
            admin_id,
            state: watch::Sender::new(RosterSnapshot::new(rows)),
            journal: Mutex::default(),
        });
        let listener = tokio::spawn(listen(shared.clone(), changes, auth));
        Ok(Self { shared, listener })
    }

    /// Current roster.
    #[must_use]
    pub fn snapshot(&self) -> RosterSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Subscribes to roster changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RosterSnapshot> {
        self.shared.state.subscribe()
    }

    /// Returns true while the change subscription is active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.listener.is_finished()
    }

    /// Approves a pending account.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the update.
    pub async fn approve(&self, id: UserId) -> Result<(), RosterError> {
        self.mutate(id, ProfilePatch::status(AccountStatus::Active))
            .await
    }

    /// Blocks an account.
    ///
    /// # Errors
    ///
    /// Returns an error for the administrator's own row or if the store
    /// rejects the update.
    pub async fn block(&self, id: UserId) -> Result<(), RosterError> {
        self.guard_self(id)?;
        self.mutate(id, ProfilePatch::status(AccountStatus::Blocked))
            .await
    }

    /// Lifts a block.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the update.
    pub async fn unblock(&self, id: UserId) -> Result<(), RosterError> {
        self.mutate(id, ProfilePatch::status(AccountStatus::Active))
            .await
    }

    /// Switches an account between student and teacher.
    ///
    /// # Errors
    ///
    /// Returns an error for the administrator's own row, for the admin role,
    /// or if the store rejects the update.
    pub async fn change_role(&self, id: UserId, role: Role) -> Result<(), RosterError> {
        self.guard_self(id)?;
        if role.is_admin() {
            return Err(RosterError::UnsupportedRole { role }.into());
        }
        self.mutate(id, ProfilePatch::role(role)).await
    }

    /// Replaces the local copy with a fresh full read.
    ///
    /// Changes that arrive while the read is in flight are applied on top of
    /// the fresh rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn reload(&self) -> Result<(), RosterError> {
        let window = ReloadWindow::open(&self.shared);
        let rows = self.shared.store.list().await.map_err(RosterError::Store)?;
        window.publish(rows);
        Ok(())
    }

    fn guard_self(&self, id: UserId) -> Result<(), RosterError> {
        if id == self.shared.admin_id {
            return Err(RosterError::SelfTarget { id }.into());
        }
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn mutate(&self, id: UserId, patch: ProfilePatch) -> Result<(), RosterError> {
        self.shared.state.send_if_modified(|s| s.patch(id, &patch));

        match self.shared.store.update(id, patch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "roster update rejected, reloading");
                if let Err(reload) = self.reload().await {
                    warn!(error = %reload, "roster reload failed");
                }
                Err(RosterError::Store(e).into())
            }
        }
    }
}

impl Drop for RosterHandle {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    shared: Arc<Shared>,
    mut changes: ChangeStream,
    mut auth: watch::Receiver<AuthSnapshot>,
) {
    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(change) => shared.apply(change),
                None => {
                    warn!("roster change stream closed");
                    break;
                }
            },
            () = admin_verdict_lost(&mut auth) => {
                info!("administrator verdict lost, releasing roster subscription");
                break;
            }
        }
    }
}

async fn admin_verdict_lost(auth: &mut watch::Receiver<AuthSnapshot>) {
    // A closed channel means the engine is gone, which also ends access.
    let _ = auth.wait_for(|s| !s.verdict.is_admin()).await;
}
