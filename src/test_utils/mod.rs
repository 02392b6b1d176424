//! Test utilities for bkstg
//!
//! - [`FakeVcs`]: in-memory version-control transport with fault injection,
//!   used by the clone, sync and location unit tests.
//! - [`FakeHost`]: hosting client that records review requests.
//! - [`TestGit`] / [`RemoteFixture`]: real-git fixtures for integration tests.

pub mod fake_host;
pub mod fake_vcs;
pub mod git_helper;

pub use fake_host::FakeHost;
pub use fake_vcs::FakeVcs;
pub use git_helper::{RemoteFixture, TestGit};

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call has an effect. With `level` that level is used;
/// otherwise `RUST_LOG` is honoured when set and logging stays off when not.
///
/// ```bash
/// RUST_LOG=sync=debug,location=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}
