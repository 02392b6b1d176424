//! Repository synchronization.
//!
//! - [`state`]: read-only detection of a working copy's relationship to its
//!   remote ([`SyncState`]).
//! - [`operator`]: pull, push, review requests, force-sync and auto-commit,
//!   serialized per repository.

pub mod operator;
pub mod state;

pub use operator::{SyncOperator, SyncResult};
pub use state::{StateDetector, SyncState, SyncStatus};
