//! Integration test suite for bkstg
//!
//! These tests drive the real `git` binary against bare repositories reached
//! through `file://` URLs, so every sync state is produced by actual history
//! rather than the in-memory fake.
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! - **sync_workflow**: state detection, pull, push, force-sync and review requests
//! - **catalog_load**: catalog aggregation, location resolution and ranks
//! - **cli**: command-line smoke tests

#[path = "../common/mod.rs"]
mod common;

mod catalog_load;
mod cli;
mod sync_workflow;
