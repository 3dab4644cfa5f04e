//! The auth engine.
//!
//! A single task owns [`AuthState`] and is the only writer. Auth events,
//! finished profile resolutions and caller commands are all funnelled into it
//! and applied in arrival order; observers read [`AuthSnapshot`]s from a watch
//! channel that only ticks when the snapshot actually changes.

use crate::backend::{AuthEventStream, AuthService, IntentStore, ProfileStore, SignUpOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, RosterError, SignInError};
use crate::fragment::{AuthRedirectError, RedirectFragment};
use crate::gate::{self, Verdict};
use crate::identity::{FULL_NAME_KEY, Identity, Metadata, email_local_part, role_metadata};
use crate::intent::RoleIntentBridge;
use crate::resolver::{ProfileResolver, Resolution};
use crate::role::{AccountStatus, Role};
use crate::roster::RosterHandle;
use crate::state::{AuthSnapshot, AuthState, Effect, Input, Ticket};
use futures::StreamExt;
use onluyen_core::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

type RefreshReply = oneshot::Sender<Option<Resolution>>;

enum Command {
    Input(Input),
    Resolved {
        ticket: Ticket,
        resolution: Resolution,
        reply: Option<RefreshReply>,
    },
    Refresh {
        reply: RefreshReply,
    },
    SignOut {
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a running auth engine.
///
/// Dropping the handle stops the engine once in-flight work drains.
pub struct AuthEngine {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<AuthSnapshot>,
    auth: Arc<dyn AuthService>,
    store: Arc<dyn ProfileStore>,
    bridge: RoleIntentBridge,
    config: EngineConfig,
    task: JoinHandle<()>,
}

impl AuthEngine {
    /// Starts the engine.
    ///
    /// Subscribes to auth events, then looks up the stored session. The
    /// verdict stays `Loading` until that lookup and its profile resolution
    /// finish, or until the configured safety timeout passes.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(
        config: EngineConfig,
        auth: Arc<dyn AuthService>,
        store: Arc<dyn ProfileStore>,
        intents: Arc<dyn IntentStore>,
    ) -> Self {
        let (commands, inbox) = mpsc::channel(config.command_buffer());
        let (publisher, snapshots) = watch::channel(AuthSnapshot::default());
        let bridge = RoleIntentBridge::new(intents, auth.clone(), store.clone());

        // Subscribe before the lookup so no event can fall between the two.
        let events = auth.subscribe();

        let weak = commands.downgrade();
        let lookup_auth = auth.clone();
        let lookup = tokio::spawn(async move {
            let identity = match lookup_auth.current_session().await {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(error = %e, "stored session lookup failed");
                    None
                }
            };
            if let Some(tx) = weak.upgrade() {
                let _ = tx
                    .send(Command::Input(Input::InitialSession(identity)))
                    .await;
            }
        });

        let weak = commands.downgrade();
        let timeout = config.safety_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Input(Input::SafetyTimeout)).await;
            }
        });

        let driver = Driver {
            state: AuthState::new(),
            publisher,
            commands: commands.downgrade(),
            resolver: ProfileResolver::new(store.clone()),
            bridge: bridge.clone(),
            auth: auth.clone(),
            startup: vec![lookup, timer],
        };
        let task = tokio::spawn(driver.run(inbox, events));
        info!(?timeout, "auth engine started");

        Self {
            commands,
            snapshots,
            auth,
            store,
            bridge,
            config,
            task,
        }
    }

    /// Subscribes to snapshot changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshots.clone()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Returns the current verdict.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.snapshots.borrow().verdict
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// View to redirect to from `current_view`, if any.
    #[must_use]
    pub fn redirect_for(&self, current_view: &str) -> Option<String> {
        let snapshot = self.snapshots.borrow();
        gate::redirect_target(
            snapshot.verdict,
            current_view,
            snapshot.recovery_in_progress,
            self.config.landing(),
        )
    }

    /// Waits until a snapshot satisfies `predicate` and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine stops first.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&AuthSnapshot) -> bool,
    ) -> Result<AuthSnapshot, EngineError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok((*snapshot).clone())
    }

    /// Waits for the initial determination to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine stops first.
    pub async fn ready(&self) -> Result<AuthSnapshot, EngineError> {
        self.wait_until(|s| s.initial_done).await
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(())
    }

    /// Re-resolves the current identity's profile.
    ///
    /// Returns `None` without an identity. The result is applied to the state
    /// unless the identity changed while it was in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Option<Resolution>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Refresh { reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::Stopped)?)
    }

    /// Signs out.
    ///
    /// Local state is cleared before this returns. The remote sign-out runs in
    /// the background; its failure is logged and does not restore the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::SignOut { done }).await?;
        rx.await.map_err(|_| EngineError::Stopped)?;
        Ok(())
    }

    /// Records the role chosen before a redirect sign-in.
    pub fn record_intent(&self, role: Role) {
        self.bridge.record(role);
    }

    /// Starts a redirect sign-in, recording `role` as the intent.
    ///
    /// The intent is cleared again if the redirect cannot be started.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth service refuses to start the flow.
    #[instrument(skip(self))]
    pub async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
        role: Role,
    ) -> Result<String, SignInError> {
        self.bridge.record(role);
        match self
            .auth
            .sign_in_with_oauth(provider, redirect_to, role_metadata(role))
            .await
        {
            Ok(url) => Ok(url),
            Err(e) => {
                self.bridge.clear();
                Err(SignInError::Auth(e).into())
            }
        }
    }

    /// Signs in with email and password.
    ///
    /// Blocked accounts are signed straight back out.
    ///
    /// # Errors
    ///
    /// Returns an error for bad credentials or a blocked account.
    #[instrument(skip(self, password))]
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, SignInError> {
        let identity = self
            .auth
            .sign_in_with_password(email, password)
            .await
            .map_err(SignInError::Auth)?;

        if let Ok(Some(profile)) = self.store.fetch(identity.id()).await {
            if profile.status == AccountStatus::Blocked {
                warn!(user_id = %identity.id(), "blocked account signed in, ending session");
                if let Err(e) = self.sign_out().await {
                    warn!(error = %e, "could not end blocked session");
                }
                return Err(SignInError::Blocked {
                    user_id: identity.id(),
                }
                .into());
            }
        }
        Ok(identity)
    }

    /// Registers an account for `role`.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth service rejects the signup.
    #[instrument(skip(self, password))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<SignUpOutcome, SignInError> {
        let outcome = self
            .auth
            .sign_up(email, password, signup_metadata(email, role))
            .await
            .map_err(SignInError::Auth)?;
        Ok(outcome)
    }

    /// Sends a one-time sign-in code, recording `role` as the intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the code cannot be sent.
    #[instrument(skip(self))]
    pub async fn send_one_time_code(
        &self,
        destination: &str,
        role: Role,
    ) -> Result<(), SignInError> {
        self.bridge.record(role);
        if let Err(e) = self
            .auth
            .send_one_time_code(destination, signup_metadata(destination, role))
            .await
        {
            self.bridge.clear();
            return Err(SignInError::Auth(e).into());
        }
        Ok(())
    }

    /// Verifies a one-time code.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is wrong or expired.
    #[instrument(skip(self, code))]
    pub async fn verify_one_time_code(
        &self,
        destination: &str,
        code: &str,
    ) -> Result<Identity, SignInError> {
        let identity = self
            .auth
            .verify_one_time_code(destination, code)
            .await
            .map_err(SignInError::Auth)?;
        Ok(identity)
    }

    /// Requests a password-recovery link.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth service refuses the request.
    #[instrument(skip(self))]
    pub async fn reset_password(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), SignInError> {
        self.auth
            .reset_password_for(email, redirect_to)
            .await
            .map_err(SignInError::Auth)?;
        Ok(())
    }

    /// Inspects the fragment the provider redirected back with.
    ///
    /// Marks a password recovery as in progress when the fragment says so and
    /// returns any provider error for display.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn observe_redirect(
        &self,
        fragment: &str,
    ) -> Result<Option<AuthRedirectError>, EngineError> {
        let fragment = RedirectFragment::parse(fragment);
        if fragment.is_recovery() {
            self.send(Command::Input(Input::RecoveryStarted)).await?;
        }
        Ok(fragment.auth_error())
    }

    /// Ends the password-recovery state after the new password is saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn finish_password_recovery(&self) -> Result<(), EngineError> {
        self.send(Command::Input(Input::RecoveryFinished)).await
    }

    /// Opens the live roster. Requires an authorized administrator.
    ///
    /// # Errors
    ///
    /// Returns an error without an administrator verdict or if the store
    /// cannot be read.
    pub async fn roster(&self) -> Result<RosterHandle, RosterError> {
        RosterHandle::open(
            self.store.clone(),
            self.config.profiles_table(),
            self.subscribe(),
        )
        .await
    }

    /// Stops the engine and waits for its task to finish.
    pub async fn shutdown(self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("auth engine already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "auth engine task ended abnormally");
        }
    }
}

fn signup_metadata(email: &str, role: Role) -> Metadata {
    let mut metadata = role_metadata(role);
    if let Some(name) = email_local_part(email) {
        metadata.insert(FULL_NAME_KEY.to_string(), Value::String(name));
    }
    metadata
}

struct Driver {
    state: AuthState,
    publisher: watch::Sender<AuthSnapshot>,
    commands: mpsc::WeakSender<Command>,
    resolver: ProfileResolver,
    bridge: RoleIntentBridge,
    auth: Arc<dyn AuthService>,
    startup: Vec<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>, mut events: AuthEventStream) {
        let mut events_open = true;
        loop {
            // Events delivered before a command was sent are applied first.
            tokio::select! {
                biased;
                event = events.next(), if events_open => match event {
                    Some(event) => self.step(Input::Auth(event)),
                    None => {
                        warn!("auth event stream closed");
                        events_open = false;
                    }
                },
                command = inbox.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
            }
        }
        for task in &self.startup {
            task.abort();
        }
        info!("auth engine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Input(input) => self.step(input),
            Command::Resolved {
                ticket,
                resolution,
                reply,
            } => {
                self.step(Input::Resolved {
                    ticket,
                    resolution: resolution.clone(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Some(resolution));
                }
            }
            Command::Refresh { reply } => match self.state.refresh() {
                Some(effect) => self.execute(effect, Some(reply)),
                None => {
                    let _ = reply.send(None);
                }
            },
            Command::SignOut { done } => {
                self.step(Input::SignOutRequested);
                let _ = done.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn step(&mut self, input: Input) {
        let effects = self.state.apply(input);
        self.publish();
        for effect in effects {
            self.execute(effect, None);
        }
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.publisher.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if next.verdict.is_admin() && next.is_fallback() {
                warn!(
                    user_id = ?next.user_id(),
                    "administrator access granted from identity metadata without a profile"
                );
            }
            debug!(verdict = %next.verdict, "auth state changed");
            *current = next;
            true
        });
    }

    fn execute(&self, effect: Effect, reply: Option<RefreshReply>) {
        match effect {
            Effect::Resolve {
                ticket,
                identity,
                reconcile,
            } => {
                let Some(tx) = self.commands.upgrade() else {
                    return;
                };
                let resolver = self.resolver.clone();
                let bridge = self.bridge.clone();
                tokio::spawn(async move {
                    // Held until the result is queued so completions arrive in turn order.
                    let _turn = bridge.turn().await;
                    if reconcile {
                        let outcome = bridge.reconcile(&identity).await;
                        debug!(?outcome, "role intent reconciled");
                    }
                    let resolution = resolver.resolve(&identity).await;
                    let _ = tx
                        .send(Command::Resolved {
                            ticket,
                            resolution,
                            reply,
                        })
                        .await;
                });
            }
            Effect::RemoteSignOut => {
                let auth = self.auth.clone();
                tokio::spawn(async move {
                    if let Err(e) = auth.sign_out().await {
                        warn!(error = %e, "remote sign-out failed, local session already cleared");
                    }
                });
            }
            Effect::ClearIntent => self.bridge.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthEventKind;
    use crate::intent::MemoryIntentStore;
    use crate::memory::MemoryBackend;
    use crate::profile::ProfilePatch;
    use std::time::Duration;

    struct Harness {
        backend: MemoryBackend,
        intents: Arc<MemoryIntentStore>,
        engine: AuthEngine,
    }

    fn start(backend: &MemoryBackend) -> Harness {
        let intents = Arc::new(MemoryIntentStore::new());
        let engine = AuthEngine::start(
            EngineConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            intents.clone(),
        );
        Harness {
            backend: backend.clone(),
            intents,
            engine,
        }
    }

    async fn verdict_becomes(engine: &AuthEngine, verdict: Verdict) -> AuthSnapshot {
        tokio::time::timeout(
            Duration::from_secs(2),
            engine.wait_until(|s| s.verdict == verdict),
        )
        .await
        .expect("verdict in time")
        .expect("engine running")
    }

    #[tokio::test]
    async fn no_stored_session_is_unauthenticated() {
        let h = start(&MemoryBackend::new());

        let snapshot = h.engine.ready().await.expect("ready");

        assert_eq!(snapshot.verdict, Verdict::Unauthenticated);
        assert_eq!(h.engine.redirect_for("dashboard"), Some("login".to_string()));
    }

    #[tokio::test]
    async fn stored_session_resolves_profile() {
        let backend = MemoryBackend::new();
        let user = backend.register("hs@example.com", "pw", role_metadata(Role::Student));
        backend.seed_profile(&user, Role::Student, AccountStatus::Active);
        backend.restore_session(Some(user.clone()));

        let h = start(&backend);
        let snapshot = h.engine.ready().await.expect("ready");

        assert_eq!(snapshot.verdict, Verdict::Authorized(Role::Student));
        assert_eq!(snapshot.user_id(), Some(user.id()));
        assert_eq!(h.engine.redirect_for("login"), Some("home".to_string()));
    }

    #[tokio::test]
    async fn teacher_signup_waits_for_approval_then_refresh_authorizes() {
        let backend = MemoryBackend::new();
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        let outcome = h
            .engine
            .sign_up("co.lan@school.vn", "secret", Role::Teacher)
            .await
            .expect("sign up");
        let SignUpOutcome::SignedIn(user) = outcome else {
            panic!("expected immediate session");
        };
        let snapshot = h
            .engine
            .wait_until(|s| s.profile.is_some())
            .await
            .expect("profile created");
        assert_eq!(snapshot.verdict, Verdict::AwaitingApproval);
        let profile = snapshot.profile.expect("profile");
        assert_eq!(profile.full_name.as_deref(), Some("co.lan"));

        backend.admin_update(user.id(), &ProfilePatch::status(AccountStatus::Active));
        let resolution = h.engine.refresh().await.expect("refresh");

        assert!(resolution.is_some_and(|r| r.profile().is_some()));
        assert_eq!(h.engine.verdict(), Verdict::Authorized(Role::Teacher));
    }

    #[tokio::test]
    async fn oauth_teacher_intent_claims_role_on_student_account() {
        let backend = MemoryBackend::new();
        let user = backend.register("gv@example.com", "", role_metadata(Role::Student));
        backend.seed_profile(&user, Role::Student, AccountStatus::Active);
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        let url = h
            .engine
            .sign_in_with_oauth("google", "https://app.invalid/", Role::Teacher)
            .await
            .expect("redirect url");
        assert!(url.contains("provider=google"));
        assert_eq!(h.intents.peek(), Some(Role::Teacher));

        backend.complete_oauth("gv@example.com");
        verdict_becomes(&h.engine, Verdict::AwaitingApproval).await;

        let row = backend.profile(user.id()).expect("row");
        assert_eq!(row.role, Role::Teacher);
        assert_eq!(row.status, AccountStatus::Pending);
        assert_eq!(h.intents.peek(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_event_during_claim_does_not_restore_student_role() {
        let backend = MemoryBackend::new();
        let user = backend.register("gv2@example.com", "", role_metadata(Role::Student));
        backend.seed_profile(&user, Role::Student, AccountStatus::Active);
        backend.restore_session(Some(user.clone()));
        backend.delay_fetch_replies([Duration::from_millis(50), Duration::from_millis(200)]);
        let intents = Arc::new(MemoryIntentStore::new());
        intents.put(Role::Teacher);

        let engine = AuthEngine::start(
            EngineConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            intents,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.push_event(AuthEventKind::SignedIn, Some(user.clone()));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let row = backend.profile(user.id()).expect("row");
        assert_eq!((row.role, row.status), (Role::Teacher, AccountStatus::Pending));
        let snapshot = engine.snapshot();
        let held = snapshot.profile.expect("profile");
        assert_eq!((held.role, held.status), (Role::Teacher, AccountStatus::Pending));
        assert_eq!(snapshot.verdict, Verdict::AwaitingApproval);
    }

    #[tokio::test]
    async fn failed_oauth_start_clears_intent() {
        let backend = MemoryBackend::new();
        backend.faults().fail_oauth(true);
        let h = start(&backend);

        let err = h
            .engine
            .sign_in_with_oauth("github", "https://app.invalid/", Role::Teacher)
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), SignInError::Auth(_)));
        assert_eq!(h.intents.peek(), None);
    }

    #[tokio::test]
    async fn sign_out_while_fetch_outstanding_stays_signed_out() {
        let backend = MemoryBackend::new();
        let user = backend.register("a@example.com", "pw", Metadata::new());
        backend.seed_profile(&user, Role::Admin, AccountStatus::Active);
        backend.restore_session(Some(user));
        backend.pause_reads();

        let h = start(&backend);
        h.engine.sign_out().await.expect("sign out");
        assert_eq!(h.engine.verdict(), Verdict::Unauthenticated);

        backend.resume_reads();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.verdict, Verdict::Unauthenticated);
        assert!(snapshot.identity.is_none());
        assert!(snapshot.profile.is_none());
    }

    #[tokio::test]
    async fn failed_remote_sign_out_still_clears_locally() {
        let backend = MemoryBackend::new();
        let user = backend.register("a@example.com", "pw", Metadata::new());
        backend.restore_session(Some(user));
        backend.faults().fail_sign_out(true);
        let h = start(&backend);
        h.engine.ready().await.expect("ready");
        h.engine.record_intent(Role::Teacher);

        h.engine.sign_out().await.expect("sign out");

        assert_eq!(h.engine.verdict(), Verdict::Unauthenticated);
        assert_eq!(h.intents.peek(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timeout_releases_loading_and_late_session_still_applies() {
        let backend = MemoryBackend::new();
        let user = backend.register("slow@example.com", "pw", Metadata::new());
        backend.seed_profile(&user, Role::Student, AccountStatus::Active);
        backend.restore_session(Some(user));
        backend.stall_session(true);

        let h = start(&backend);
        let snapshot = h.engine.ready().await.expect("ready");
        assert_eq!(snapshot.verdict, Verdict::Unauthenticated);

        backend.stall_session(false);
        let snapshot = h
            .engine
            .wait_until(|s| s.verdict == Verdict::Authorized(Role::Student))
            .await
            .expect("late session");
        assert!(snapshot.initial_done);
    }

    #[tokio::test]
    async fn blocked_account_is_signed_back_out() {
        let backend = MemoryBackend::new();
        let user = backend.register("bad@example.com", "pw", Metadata::new());
        backend.seed_profile(&user, Role::Student, AccountStatus::Blocked);
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        let err = h
            .engine
            .sign_in_with_password("bad@example.com", "pw")
            .await
            .unwrap_err();

        assert_eq!(
            err.current_context(),
            &SignInError::Blocked { user_id: user.id() }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.verdict, Verdict::Unauthenticated);
        assert!(snapshot.identity.is_none());
        assert!(backend.session().is_none());
    }

    #[tokio::test]
    async fn admin_without_readable_profile_is_authorized_from_metadata() {
        let backend = MemoryBackend::new();
        let user = backend.register("root@example.com", "pw", role_metadata(Role::Admin));
        backend.restore_session(Some(user));
        backend.faults().deny_reads(true);

        let h = start(&backend);
        let snapshot = h.engine.ready().await.expect("ready");

        assert_eq!(snapshot.verdict, Verdict::Authorized(Role::Admin));
        assert!(snapshot.is_fallback());
        assert!(snapshot.last_resolution.is_some_and(|r| r.is_denied()));
    }

    #[tokio::test]
    async fn recovery_redirect_routes_to_password_view() {
        let backend = MemoryBackend::new();
        backend.register("r@example.com", "pw", Metadata::new());
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        let error = h
            .engine
            .observe_redirect("#access_token=abc&type=recovery")
            .await
            .expect("observe");
        assert!(error.is_none());
        backend.follow_recovery_link("r@example.com");
        verdict_becomes(&h.engine, Verdict::Authorized(Role::Student)).await;

        assert!(h.engine.snapshot().recovery_in_progress);
        assert_eq!(
            h.engine.redirect_for("login"),
            Some("update-password".to_string())
        );
        assert_eq!(h.engine.redirect_for("update-password"), None);

        h.engine.finish_password_recovery().await.expect("finish");
        h.engine
            .wait_until(|s| !s.recovery_in_progress)
            .await
            .expect("recovery finished");
        assert_eq!(h.engine.redirect_for("login"), Some("home".to_string()));
    }

    #[tokio::test]
    async fn expired_link_is_reported() {
        let h = start(&MemoryBackend::new());

        let error = h
            .engine
            .observe_redirect("#error=access_denied&error_code=otp_expired")
            .await
            .expect("observe");

        assert_eq!(error, Some(AuthRedirectError::LinkExpired));
    }

    #[tokio::test]
    async fn unchanged_refresh_does_not_notify() {
        let backend = MemoryBackend::new();
        let user = backend.register("s@example.com", "pw", Metadata::new());
        backend.seed_profile(&user, Role::Student, AccountStatus::Active);
        backend.restore_session(Some(user));
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        let mut rx = h.engine.subscribe();
        let _ = rx.borrow_and_update();
        h.engine.refresh().await.expect("refresh");

        assert!(!rx.has_changed().expect("engine running"));
    }

    #[tokio::test]
    async fn refresh_without_identity_returns_none() {
        let h = start(&MemoryBackend::new());
        h.engine.ready().await.expect("ready");

        assert_eq!(h.engine.refresh().await.expect("refresh"), None);
    }

    #[tokio::test]
    async fn one_time_code_sign_in_reaches_gate() {
        let backend = MemoryBackend::new();
        let h = start(&backend);
        h.engine.ready().await.expect("ready");

        h.engine
            .send_one_time_code("hv@example.com", Role::Student)
            .await
            .expect("send");
        h.engine
            .verify_one_time_code("hv@example.com", crate::memory::ONE_TIME_CODE)
            .await
            .expect("verify");

        let snapshot = h
            .engine
            .wait_until(|s| s.profile.is_some())
            .await
            .expect("profile resolved");
        assert_eq!(snapshot.verdict, Verdict::Authorized(Role::Student));
        assert_eq!(snapshot.profile.map(|p| p.role), Some(Role::Student));
    }

    #[tokio::test]
    async fn shutdown_stops_engine() {
        let h = start(&MemoryBackend::new());
        let rx = h.engine.subscribe();

        h.engine.shutdown().await;

        assert!(rx.has_changed().is_err());
    }
}
