//! Identity and authorization reconciliation for OnLuyen.
//!
//! This crate provides:
//! - The auth engine (`AuthEngine`) that owns session, profile and verdict state
//! - Profile resolution with create-on-absence (`ProfileResolver`)
//! - The authorization gate (`Verdict`, `evaluate`, `redirect_target`)
//! - Role intent reconciliation for redirect sign-in (`RoleIntentBridge`)
//! - The live administrator roster (`RosterHandle`)
//! - Collaborator traits for the auth service and profile store, plus an
//!   in-memory implementation of both
//!
//! # Approval Model
//!
//! Students are active from signup. Teachers start pending and need an
//! administrator to approve them. When the profile cannot be read, the gate
//! falls back to the role in identity metadata and still holds teachers at
//! approval.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use onluyen_access::{
//!     AuthEngine, EngineConfig, MemoryBackend, MemoryIntentStore, Role, Verdict,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let backend = MemoryBackend::new();
//! let engine = AuthEngine::start(
//!     EngineConfig::default(),
//!     Arc::new(backend.clone()),
//!     Arc::new(backend.clone()),
//!     Arc::new(MemoryIntentStore::new()),
//! );
//! engine.ready().await.unwrap();
//!
//! engine
//!     .sign_up("co.lan@school.vn", "secret", Role::Teacher)
//!     .await
//!     .unwrap();
//! let snapshot = engine.wait_until(|s| s.profile.is_some()).await.unwrap();
//!
//! assert_eq!(snapshot.verdict, Verdict::AwaitingApproval);
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod gate;
pub mod identity;
pub mod intent;
pub mod memory;
pub mod profile;
pub mod resolver;
pub mod role;
pub mod roster;
pub mod state;

// Re-export main types at crate root
pub use backend::{
    AuthEvent, AuthEventKind, AuthService, ChangeEvent, IntentStore, ProfileStore, SignUpOutcome,
};
pub use config::{EngineConfig, LandingConfig};
pub use engine::AuthEngine;
pub use error::{AuthServiceError, EngineError, RosterError, SignInError, StoreError};
pub use fragment::{AuthRedirectError, RedirectFragment};
pub use gate::{GateInput, Verdict, evaluate, redirect_target};
pub use identity::{Identity, Metadata};
pub use intent::{MemoryIntentStore, ReconcileOutcome, RoleIntentBridge};
pub use memory::MemoryBackend;
pub use profile::{NewProfile, Profile, ProfilePatch};
pub use resolver::{ProfileResolver, Resolution};
pub use role::{AccountStatus, Role};
pub use roster::{RosterHandle, RosterSnapshot, RosterStats};
pub use state::AuthSnapshot;
