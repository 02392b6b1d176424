//! Core types for bkstg
//!
//! The error system lives here:
//! - [`BkstgError`] - Enumerated error types covering every failure mode of the
//!   clone, sync, location and rank engines
//! - [`ErrorContext`] - User-friendly error wrapper with suggestions and details
//! - [`user_friendly_error`] - Convert any error to the user-friendly format
//!
//! Code that must react to a failure class (retry a network error, map an
//! auth failure to `UNKNOWN`) uses [`find_bkstg_error`] or [`is_retryable`]
//! on the `anyhow::Error` it received instead of matching message strings.

pub mod error;

pub use error::{
    BkstgError, ErrorContext, classify_git_failure, find_bkstg_error, is_retryable,
    user_friendly_error,
};
