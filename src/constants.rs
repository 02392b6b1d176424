//! Global constants used throughout the bkstg codebase.
//!
//! Timeout durations, cache defaults and naming conventions shared by the
//! clone manager, the sync layer and the location resolver.

use std::time::Duration;

/// Timeout for Git fetch operations (60 seconds).
///
/// Applies to every read-path network call. Expiry while computing sync
/// state yields `UNKNOWN`; expiry on a write path is a retryable error.
pub const GIT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for Git clone operations (120 seconds).
///
/// Sparse clones of large repositories still transfer the full commit graph,
/// so they get more headroom than a fetch.
pub const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for local Git operations that never touch the network (30 seconds).
pub const GIT_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for invocations of the hosting CLI (60 seconds).
pub const HOSTING_CLI_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout while waiting on a location resolution started by another task.
///
/// After this the waiter stops waiting and resolves the location itself.
pub const PENDING_STATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of a resolved location cache entry (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default number of location fetches allowed in flight at once.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default directory holding one working copy per source or location.
pub const DEFAULT_CLONE_DIR: &str = "~/.bkstg-clones";

/// Remote name used for every managed working copy.
pub const REMOTE_NAME: &str = "origin";

/// Prefix of branches created for review requests.
pub const REVIEW_BRANCH_PREFIX: &str = "bkstg-sync-";

/// Directory inside a clone that holds catalog entity files.
pub const CATALOGS_DIR: &str = "catalogs";

/// Directory under [`CATALOGS_DIR`] holding scorecard definitions.
pub const SCORECARDS_DIR: &str = "scorecards";

/// Sentinel score value meaning "not applicable".
pub const SCORE_NA_VALUE: f64 = -1.0;

/// Maximum accepted length of a rank formula, in bytes.
pub const MAX_FORMULA_LENGTH: usize = 10_000;

/// Maximum nesting depth of a parsed rank formula.
pub const MAX_FORMULA_DEPTH: usize = 50;

/// Maximum number of conditional rules in one rank.
pub const MAX_RANK_RULES: usize = 50;

/// Maximum accepted length of a label function, in bytes.
pub const MAX_LABEL_FUNCTION_LENGTH: usize = 20_000;

/// Maximum number of statements in a label function.
pub const MAX_LABEL_FUNCTION_STATEMENTS: usize = 100;

/// Delay before the single automatic retry of a read-only state check.
pub const STATE_CHECK_RETRY_DELAY_MS: u64 = 250;
