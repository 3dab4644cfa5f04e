//! Error handling foundation for the OnLuyen platform.
//!
//! Only the `Result` alias lives here. Each crate defines its own error enums
//! and attaches layer-specific context with rootcause's `.context()`.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
