//! Authenticated identity as issued by the external auth service.
//!
//! The engine only reads identities. The free-form metadata bag is written at
//! signup (or by the role-intent fallback) and is the only place a requested
//! role can be found before a profile row exists.

use crate::role::Role;
use chrono::{DateTime, Utc};
use onluyen_core::UserId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the role chosen at signup.
pub const ROLE_KEY: &str = "role";
/// Metadata key holding the user's full name.
pub const FULL_NAME_KEY: &str = "full_name";
/// Metadata key holding an avatar reference.
pub const AVATAR_URL_KEY: &str = "avatar_url";

/// Free-form metadata attached to an identity.
pub type Metadata = Map<String, Value>;

/// Builds a metadata bag carrying a requested role.
#[must_use]
pub fn role_metadata(role: Role) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(ROLE_KEY.to_string(), Value::String(role.as_str().to_string()));
    metadata
}

/// Handle for an authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Identifier shared with the profile row.
    id: UserId,
    /// Email address, if the sign-in method provided one.
    email: Option<String>,
    /// Metadata supplied at signup.
    metadata: Metadata,
    /// When the identity was created by the auth service.
    created_at: DateTime<Utc>,
}

impl Identity {
    /// Creates an identity with a fresh id and empty metadata.
    #[must_use]
    pub fn new(email: Option<String>) -> Self {
        Self {
            id: UserId::new(),
            email,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Reconstitutes an identity from auth service data.
    #[must_use]
    pub fn with_all_fields(
        id: UserId,
        email: Option<String>,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            email,
            metadata,
            created_at,
        }
    }

    /// Replaces the metadata bag.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the identity id.
    #[must_use]
    pub fn id(&self) -> UserId {
        self.id
    }

    /// Returns the email address, if any.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Returns the raw metadata bag.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns when the identity was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Role requested through metadata, if present and recognised.
    #[must_use]
    pub fn requested_role(&self) -> Option<Role> {
        self.metadata_str(ROLE_KEY)?.parse().ok()
    }

    /// Full name from metadata.
    #[must_use]
    pub fn full_name(&self) -> Option<&str> {
        self.metadata_str(FULL_NAME_KEY)
    }

    /// Avatar reference from metadata.
    #[must_use]
    pub fn avatar_url(&self) -> Option<&str> {
        self.metadata_str(AVATAR_URL_KEY)
    }

    /// Best display name: metadata full name, else the email local part.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.full_name()
            .map(str::to_string)
            .or_else(|| self.email.as_deref().and_then(email_local_part))
    }

    /// Merges fields into the metadata bag, overwriting existing keys.
    pub fn merge_metadata(&mut self, fields: Metadata) {
        self.metadata.extend(fields);
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Returns the part of an email address before `@`.
#[must_use]
pub fn email_local_part(email: &str) -> Option<String> {
    email
        .split('@')
        .next()
        .filter(|local| !local.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn requested_role_reads_metadata() {
        let identity = Identity::new(None).with_metadata(role_metadata(Role::Teacher));
        assert_eq!(identity.requested_role(), Some(Role::Teacher));
    }

    #[test]
    fn unknown_or_blank_role_is_ignored() {
        let identity = Identity::new(None).with_metadata(metadata(json!({"role": "wizard"})));
        assert_eq!(identity.requested_role(), None);

        let identity = Identity::new(None).with_metadata(metadata(json!({"role": "  "})));
        assert_eq!(identity.requested_role(), None);

        let identity = Identity::new(None).with_metadata(metadata(json!({"role": 3})));
        assert_eq!(identity.requested_role(), None);
    }

    #[test]
    fn display_name_prefers_full_name() {
        let identity = Identity::new(Some("lan@example.com".to_string()))
            .with_metadata(metadata(json!({"full_name": "Nguyen Lan"})));
        assert_eq!(identity.display_name().as_deref(), Some("Nguyen Lan"));
    }

    #[test]
    fn display_name_falls_back_to_email_local_part() {
        let identity = Identity::new(Some("lan@example.com".to_string()));
        assert_eq!(identity.display_name().as_deref(), Some("lan"));

        let identity = Identity::new(None);
        assert_eq!(identity.display_name(), None);
    }

    #[test]
    fn merge_metadata_overwrites_keys() {
        let mut identity = Identity::new(None).with_metadata(role_metadata(Role::Student));
        identity.merge_metadata(role_metadata(Role::Teacher));
        assert_eq!(identity.requested_role(), Some(Role::Teacher));
    }
}
