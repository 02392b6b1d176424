//! Error handling for bkstg
//!
//! Two layers, as everywhere else in the crate:
//! 1. [`BkstgError`] is the strongly-typed classification of every failure the
//!    sync and location engine can produce. Code that needs to react to a
//!    failure (retry it, map it to `UNKNOWN`, surface it verbatim) downcasts an
//!    [`anyhow::Error`] to this type.
//! 2. [`ErrorContext`] wraps a [`BkstgError`] with a suggestion and details for
//!    display at the CLI boundary. [`user_friendly_error`] builds one from any
//!    error.
//!
//! # Classification of Git failures
//!
//! The Git client reports every failure as a non-zero exit code plus free-form
//! stderr. [`classify_git_failure`] turns that into one of:
//! - [`BkstgError::AuthenticationFailed`]: fatal to the operation, never retried
//! - [`BkstgError::NetworkError`]: retryable
//! - [`BkstgError::GitCommandError`]: everything else
//!
//! Timeouts are raised directly as [`BkstgError::Timeout`] by the command
//! builder and are retryable as well.

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for bkstg operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BkstgError {
    /// A Git command returned a non-zero exit code that is not an
    /// authentication or network failure.
    #[error("Git operation failed: {operation}")]
    GitCommandError {
        /// The git operation that failed (e.g., "fetch", "push")
        operation: String,
        /// The error output from the git command
        stderr: String,
    },

    /// The `git` executable could not be located.
    #[error("Git is not installed or not found in PATH")]
    GitNotFound,

    /// Credentials are missing or were rejected by the remote.
    #[error("Authentication failed for {url}")]
    AuthenticationFailed {
        /// Remote URL or hosting repository that rejected the credentials
        url: String,
        /// Raw output from the client
        detail: String,
    },

    /// The remote could not be reached.
    #[error("Network error during {operation}: {reason}")]
    NetworkError {
        /// Operation that was attempted
        operation: String,
        /// Raw reason reported by the client
        reason: String,
    },

    /// A network or process call exceeded its deadline.
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// Creating a working copy failed for a reason other than auth or network.
    #[error("Failed to clone repository: {url}")]
    CloneFailed {
        /// Remote URL
        url: String,
        /// Raw reason
        reason: String,
    },

    /// A working copy exists on disk but is not a usable Git repository.
    #[error("Working copy at {path} is corrupt: {reason}")]
    CorruptClone {
        /// Path of the broken working copy
        path: String,
        /// What validation found
        reason: String,
    },

    /// An operation that needs a working copy was invoked before one existed.
    #[error("Source '{source_name}' has not been cloned yet")]
    NotCloned {
        /// Configured source name
        source_name: String,
    },

    /// No configured source has this name.
    #[error("Source '{name}' is not configured")]
    SourceNotFound {
        /// Name that was requested
        name: String,
        /// Closest configured name, if any
        suggestion: Option<String>,
    },

    /// Local and remote histories diverged, so a pull cannot fast-forward.
    #[error("Cannot fast-forward '{source_name}': local and remote histories have diverged")]
    PullConflict {
        /// Configured source name
        source_name: String,
    },

    /// The repository is not in a state that permits the requested operation.
    #[error("Cannot {operation} while source is {state}")]
    InvalidSyncState {
        /// Operation that was refused
        operation: String,
        /// Rendered sync state at the time of the call
        state: String,
    },

    /// Review requests are disabled for the current state by configuration.
    #[error("Review requests are not allowed from state {state} under policy '{policy}'")]
    ReviewRequestNotAllowed {
        /// Rendered sync state
        state: String,
        /// Active policy name
        policy: String,
    },

    /// The hosting CLI reported a failure.
    #[error("Hosting operation '{operation}' failed: {reason}")]
    HostingError {
        /// Operation (e.g., "pr create")
        operation: String,
        /// Raw reason
        reason: String,
    },

    /// The caller cancelled a long-running operation.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description
        message: String,
    },

    /// A rank formula failed to parse.
    #[error("Invalid formula at position {position}: {message}")]
    FormulaParse {
        /// The formula source
        formula: String,
        /// Byte offset where parsing failed
        position: usize,
        /// Description
        message: String,
    },

    /// A rank definition is structurally invalid.
    #[error("Invalid rank definition '{rank_id}': {reason}")]
    InvalidRankDefinition {
        /// Rank identifier
        rank_id: String,
        /// Description
        reason: String,
    },

    /// No loaded scorecard (or rank within it) has this identifier.
    #[error("Scorecard '{id}' not found")]
    ScorecardNotFound {
        /// Requested identifier
        id: String,
    },

    /// Generic error.
    #[error("{message}")]
    Other {
        /// Generic error message
        message: String,
    },
}

impl BkstgError {
    /// Whether an automatic retry could plausibly succeed.
    ///
    /// Only network failures and timeouts qualify. Authentication failures
    /// are surfaced verbatim and never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. })
    }

    /// Whether this error reflects missing or rejected credentials.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

/// Returns true when an [`anyhow::Error`] wraps a retryable [`BkstgError`].
#[must_use]
pub fn is_retryable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<BkstgError>().is_some_and(BkstgError::is_retryable)
    })
}

/// Finds the first [`BkstgError`] anywhere in an error chain.
#[must_use]
pub fn find_bkstg_error(error: &anyhow::Error) -> Option<&BkstgError> {
    error.chain().find_map(|cause| cause.downcast_ref::<BkstgError>())
}

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "permission denied (publickey)",
    "terminal prompts disabled",
    "invalid username or password",
    "access denied",
    "http basic: access denied",
    "requested url returned error: 403",
    "requested url returned error: 401",
];

const NETWORK_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "connection refused",
    "unable to access",
    "network is unreachable",
    "operation timed out",
    "failed to connect",
    "the remote end hung up unexpectedly",
    "early eof",
];

/// Classifies a failed Git invocation by inspecting its stderr.
#[must_use]
pub fn classify_git_failure(operation: &str, url: Option<&str>, stderr: &str) -> BkstgError {
    let lowered = stderr.to_lowercase();
    if AUTH_MARKERS.iter().any(|m| lowered.contains(m)) {
        return BkstgError::AuthenticationFailed {
            url: url.unwrap_or("remote").to_string(),
            detail: stderr.trim().to_string(),
        };
    }
    if NETWORK_MARKERS.iter().any(|m| lowered.contains(m)) {
        return BkstgError::NetworkError {
            operation: operation.to_string(),
            reason: stderr.trim().to_string(),
        };
    }
    if operation == "clone" {
        return BkstgError::CloneFailed {
            url: url.unwrap_or("unknown").to_string(),
            reason: stderr.trim().to_string(),
        };
    }
    BkstgError::GitCommandError {
        operation: operation.to_string(),
        stderr: stderr.trim().to_string(),
    }
}

/// Error with user-facing suggestion and details.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying bkstg error
    pub error: BkstgError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: BkstgError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add additional details explaining the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr: error in red, details in yellow and the
    /// suggestion in green.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into an [`ErrorContext`] with actionable suggestions.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(bkstg_error) = find_bkstg_error(&error) {
        let ctx = create_error_context(bkstg_error.clone());
        // Keep the outer context messages; they name the source being processed.
        if ctx.details.is_none() && error.chain().count() > 1 {
            return ctx.with_details(error.to_string());
        }
        return ctx;
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(BkstgError::Other {
                    message: io_error.to_string(),
                })
                .with_suggestion("Check ownership and permissions of the clone directory")
                .with_details("bkstg could not read or write a file it manages");
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(BkstgError::Other {
                    message: io_error.to_string(),
                })
                .with_suggestion("Check that the file or directory exists and the path is correct");
            }
            _ => {}
        }
    }

    if let Some(yaml_error) = error.downcast_ref::<serde_yaml::Error>() {
        return ErrorContext::new(BkstgError::ConfigError {
            message: yaml_error.to_string(),
        })
        .with_suggestion("Check the YAML syntax: indentation, quoting and list markers");
    }

    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(std::string::ToString::to_string).collect();
    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }

    ErrorContext::new(BkstgError::Other {
        message,
    })
}

fn create_error_context(error: BkstgError) -> ErrorContext {
    match &error {
        BkstgError::GitNotFound => ErrorContext::new(error)
            .with_suggestion("Install git from https://git-scm.com/ or your package manager (e.g., 'brew install git', 'apt install git')"),

        BkstgError::AuthenticationFailed { detail, .. } => {
            let detail = detail.clone();
            ErrorContext::new(error)
                .with_suggestion("Run 'gh auth login' or configure git credentials / SSH keys for this host")
                .with_details(detail)
        }

        BkstgError::NetworkError { .. } | BkstgError::Timeout { .. } => ErrorContext::new(error)
            .with_suggestion("Check your network connection and retry the operation")
            .with_details("Network failures are safe to retry; no local state was changed"),

        BkstgError::CloneFailed { url, reason } => {
            let suggestion = format!("Verify the repository {url} exists and the branch is correct");
            let reason = reason.clone();
            ErrorContext::new(error).with_suggestion(suggestion).with_details(reason)
        }

        BkstgError::CorruptClone { .. } => ErrorContext::new(error)
            .with_suggestion("Run 'bkstg force-sync <source> --yes' to rebuild the working copy"),

        BkstgError::NotCloned { .. } => ErrorContext::new(error)
            .with_suggestion("Run 'bkstg refresh' or 'bkstg load' to create the working copy"),

        BkstgError::SourceNotFound { suggestion, .. } => match suggestion {
            Some(name) => {
                let hint = format!("Did you mean '{name}'?");
                ErrorContext::new(error).with_suggestion(hint)
            }
            None => ErrorContext::new(error)
                .with_suggestion("Run 'bkstg sources' to list configured sources"),
        },

        BkstgError::PullConflict { source_name } => {
            let hint = format!(
                "Open a review request with 'bkstg review-request {source_name}' or discard local work with 'bkstg force-sync {source_name} --yes'"
            );
            ErrorContext::new(error).with_suggestion(hint)
        }

        BkstgError::InvalidSyncState { .. } | BkstgError::ReviewRequestNotAllowed { .. } => {
            ErrorContext::new(error)
                .with_suggestion("Run 'bkstg sources' to see the current state of each source")
        }

        BkstgError::GitCommandError { stderr, .. } => {
            let stderr = stderr.clone();
            ErrorContext::new(error)
                .with_suggestion("Try running the git command manually in the working copy for more details")
                .with_details(stderr)
        }

        BkstgError::FormulaParse { formula, .. } => {
            let formula = formula.clone();
            ErrorContext::new(error)
                .with_suggestion("Formulas support + - * /, comparisons, in/not in, and/or/not, 'x if cond else y', entity.<attribute> and min/max/abs/avg/sum/round/len/sqrt/floor/ceil/pow/str")
                .with_details(formula)
        }

        _ => ErrorContext::new(error),
    }
}
