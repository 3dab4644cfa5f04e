//! Engine configuration.
//!
//! Loaded via the `config` crate from environment variables
//! (`ONLUYEN__SAFETY_TIMEOUT_MS`, `ONLUYEN__LANDING__ADMIN_VIEW`, ...).
//! Every field has a default so an empty environment yields a working setup.

use serde::Deserialize;
use std::time::Duration;

/// Configuration for the auth engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How long the initial session lookup may take before the loading state
    /// is released anyway, in milliseconds.
    #[serde(default = "default_safety_timeout_ms")]
    safety_timeout_ms: u64,
    /// Table the roster subscribes to.
    #[serde(default = "default_profiles_table")]
    profiles_table: String,
    /// Capacity of the engine command channel.
    #[serde(default = "default_command_buffer")]
    command_buffer: usize,
    /// Landing views for redirects.
    #[serde(default)]
    landing: LandingConfig,
}

fn default_safety_timeout_ms() -> u64 {
    5_000
}

fn default_profiles_table() -> String {
    "profiles".to_string()
}

fn default_command_buffer() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safety_timeout_ms: default_safety_timeout_ms(),
            profiles_table: default_profiles_table(),
            command_buffer: default_command_buffer(),
            landing: LandingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `ONLUYEN__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("ONLUYEN")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("landing.pre_auth_views")
                    .with_list_parse_key("landing.public_views")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Overrides the safety timeout.
    #[must_use]
    pub fn with_safety_timeout(mut self, timeout: Duration) -> Self {
        self.safety_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the safety timeout.
    #[must_use]
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_timeout_ms)
    }

    /// Returns the profile table name.
    #[must_use]
    pub fn profiles_table(&self) -> &str {
        &self.profiles_table
    }

    /// Returns the command channel capacity (never zero).
    #[must_use]
    pub fn command_buffer(&self) -> usize {
        self.command_buffer.max(1)
    }

    /// Returns the landing configuration.
    #[must_use]
    pub fn landing(&self) -> &LandingConfig {
        &self.landing
    }
}

/// Named views used by the redirect tie-break.
#[derive(Debug, Clone, Deserialize)]
pub struct LandingConfig {
    /// Where unauthenticated users are sent.
    #[serde(default = "default_sign_in")]
    pub sign_in: String,
    /// Landing for authenticated non-admins.
    #[serde(default = "default_view")]
    pub default_view: String,
    /// Landing for administrators.
    #[serde(default = "default_admin_view")]
    pub admin_view: String,
    /// Views that only make sense before authentication.
    #[serde(default = "default_pre_auth_views")]
    pub pre_auth_views: Vec<String>,
    /// Views reachable without authentication.
    #[serde(default = "default_public_views")]
    pub public_views: Vec<String>,
    /// Where a password recovery is completed.
    #[serde(default = "default_recovery_view")]
    pub recovery_view: String,
}

fn default_sign_in() -> String {
    "login".to_string()
}

fn default_view() -> String {
    "home".to_string()
}

fn default_admin_view() -> String {
    "admin-dashboard".to_string()
}

fn default_pre_auth_views() -> Vec<String> {
    vec!["login".to_string(), "admin-login".to_string()]
}

fn default_public_views() -> Vec<String> {
    vec![
        "login".to_string(),
        "admin-login".to_string(),
        "update-password".to_string(),
    ]
}

fn default_recovery_view() -> String {
    "update-password".to_string()
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            sign_in: default_sign_in(),
            default_view: default_view(),
            admin_view: default_admin_view(),
            pre_auth_views: default_pre_auth_views(),
            public_views: default_public_views(),
            recovery_view: default_recovery_view(),
        }
    }
}

impl LandingConfig {
    /// Returns true if the view is a sign-in style page.
    #[must_use]
    pub fn is_pre_auth(&self, view: &str) -> bool {
        self.pre_auth_views.iter().any(|v| v == view)
    }

    /// Returns true if the view is reachable without authentication.
    #[must_use]
    pub fn is_public(&self, view: &str) -> bool {
        self.public_views.iter().any(|v| v == view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn from_env_with(vars: &[(&str, &str)]) -> Result<EngineConfig, config::ConfigError> {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in vars {
            // SAFETY: tests touching the process environment hold ENV_MUTEX.
            unsafe { std::env::set_var(key, value) };
        }
        let loaded = EngineConfig::from_env();
        for (key, _) in vars {
            // SAFETY: as above.
            unsafe { std::env::remove_var(key) };
        }
        loaded
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.safety_timeout(), Duration::from_secs(5));
        assert_eq!(config.profiles_table(), "profiles");
        assert_eq!(config.command_buffer(), 64);
        assert_eq!(config.landing().admin_view, "admin-dashboard");
        assert_eq!(config.landing().default_view, "home");
        assert!(config.landing().is_pre_auth("admin-login"));
        assert!(config.landing().is_public("update-password"));
        assert!(!config.landing().is_pre_auth("update-password"));
        assert_eq!(config.landing().recovery_view, "update-password");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"safety_timeout_ms": 2000, "landing": {"admin_view": "console"}}"#,
        )
        .expect("deserialize");
        assert_eq!(config.safety_timeout(), Duration::from_secs(2));
        assert_eq!(config.landing().admin_view, "console");
        assert_eq!(config.landing().sign_in, "login");
        assert_eq!(config.profiles_table(), "profiles");
    }

    #[test]
    fn zero_command_buffer_is_clamped() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"command_buffer": 0}"#).expect("deserialize");
        assert_eq!(config.command_buffer(), 1);
    }

    #[test]
    fn environment_overrides_nested_and_list_keys() {
        let config = from_env_with(&[
            ("ONLUYEN__SAFETY_TIMEOUT_MS", "1500"),
            ("ONLUYEN__LANDING__PRE_AUTH_VIEWS", "a,b"),
            ("ONLUYEN__LANDING__ADMIN_VIEW", "console"),
        ])
        .expect("load");

        assert_eq!(config.safety_timeout(), Duration::from_millis(1500));
        assert_eq!(config.landing().pre_auth_views, ["a", "b"]);
        assert_eq!(config.landing().admin_view, "console");
        assert_eq!(config.landing().sign_in, "login");
        assert_eq!(config.command_buffer(), 64);
    }

    #[test]
    fn unparsable_environment_value_is_an_error() {
        let result = from_env_with(&[("ONLUYEN__SAFETY_TIMEOUT_MS", "soon")]);
        assert!(result.is_err());
    }

    #[test]
    fn timeout_override() {
        let config = EngineConfig::default().with_safety_timeout(Duration::from_millis(250));
        assert_eq!(config.safety_timeout(), Duration::from_millis(250));
    }
}
