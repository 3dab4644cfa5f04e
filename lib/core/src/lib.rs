//! Core types shared by the OnLuyen crates.
//!
//! This crate provides the identifier used to key identities and profiles,
//! and the `Result` alias every layer uses to propagate errors.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, UserId};
