//! Parsing of provider-delivered URL fragments.
//!
//! After a redirect the auth provider reports outcomes in the URL fragment:
//! `#error=access_denied&error_code=otp_expired&error_description=...` on
//! failure, `#access_token=...&type=recovery` when a password-recovery link
//! was followed. Displaying the error is someone else's concern; the engine
//! only needs to know whether a recovery is in progress.

use std::collections::HashMap;
use std::fmt;

/// Error code the provider sends for an expired or reused email link.
const OTP_EXPIRED: &str = "otp_expired";

/// Decoded key/value pairs from a redirect fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectFragment {
    params: HashMap<String, String>,
}

impl RedirectFragment {
    /// Parses a fragment, with or without the leading `#`.
    #[must_use]
    pub fn parse(fragment: &str) -> Self {
        let raw = fragment.strip_prefix('#').unwrap_or(fragment);
        let params = url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect();
        Self { params }
    }

    /// Returns a decoded parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns true if nothing was parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Provider error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.get("error_code")
    }

    /// Human-readable provider error, if any.
    #[must_use]
    pub fn error_description(&self) -> Option<&str> {
        self.get("error_description")
    }

    /// Returns true if the fragment marks a password-recovery return.
    #[must_use]
    pub fn is_recovery(&self) -> bool {
        self.get("type") == Some("recovery")
    }

    /// Classifies the provider error, if the fragment carries one.
    #[must_use]
    pub fn auth_error(&self) -> Option<AuthRedirectError> {
        let description = self
            .error_description()
            .or_else(|| self.get("error"))
            .or_else(|| self.error_code())?;
        match self.error_code() {
            Some(OTP_EXPIRED) => Some(AuthRedirectError::LinkExpired),
            code => Some(AuthRedirectError::Provider {
                code: code.map(str::to_string),
                description: description.to_string(),
            }),
        }
    }
}

/// Error reported by the provider on redirect return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRedirectError {
    /// The verification link expired or was already used.
    LinkExpired,
    /// Any other provider error.
    Provider {
        code: Option<String>,
        description: String,
    },
}

impl fmt::Display for AuthRedirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkExpired => write!(f, "verification link has expired or is invalid"),
            Self::Provider { description, .. } => write!(f, "{description}"),
        }
    }
}

impl std::error::Error for AuthRedirectError {}
