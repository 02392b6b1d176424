//! Command-line interface for bkstg.
//!
//! Each command lives in its own module with a clap `Args` struct and an
//! `execute` method taking the [`CommandContext`] built from the global
//! options.
//!
//! # Available Commands
//!
//! ## Sources
//! - `sources` - Show the sync state of every synchronized source
//! - `refresh` - Fetch every cloned source
//!
//! ## Synchronization
//! - `pull` - Fast-forward a source to its remote
//! - `push` - Commit pending changes and publish local commits
//! - `force-sync` - Discard local changes and match the remote
//! - `review-request` - Publish local work on a new branch and open a review request
//! - `review-requests` - List open review requests created by bkstg
//!
//! ## Catalog
//! - `load` - Load the aggregated catalog and summarize it
//! - `rank` - Evaluate one rank of a scorecard for given score values
//!
//! # Global Options
//!
//! - `--verbose` - Enable debug output
//! - `--quiet` - Suppress all output except errors
//! - `--config` - Path to the configuration file
//!
//! ```bash
//! bkstg sources
//! bkstg push platform
//! bkstg review-request platform --title "Update ownership"
//! bkstg rank quality overall test_coverage=85 doc_quality=70
//! ```

pub mod common;
mod load;
mod rank;
mod review;
mod sources;
mod sync;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use common::CommandContext;

/// Runtime configuration derived from the global flags.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Log level used when `RUST_LOG` is not set; `None` logs errors only.
    pub log_level: Option<String>,

    /// Explicit configuration file.
    pub config_path: Option<PathBuf>,
}

impl CliConfig {
    /// Create a new CLI configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter directive for the tracing subscriber.
    #[must_use]
    pub fn filter_directive(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "error".to_string())
    }
}

#[derive(Parser)]
#[command(
    name = "bkstg",
    about = "Git-backed software catalog - sync sources, resolve locations, rate entities",
    version,
    author,
    long_about = "bkstg keeps local working copies of catalog repositories in sync with their remotes, \
                  resolves Location entities into one catalog and evaluates scorecard ranks."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = "BKSTG_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sync state of every synchronized source
    Sources(sources::SourcesCommand),

    /// Fetch every cloned source
    Refresh(sources::RefreshCommand),

    /// Fast-forward a source to its remote
    Pull(sync::PullCommand),

    /// Commit pending changes and publish local commits
    Push(sync::PushCommand),

    /// Discard local changes and match the remote
    ForceSync(sync::ForceSyncCommand),

    /// Publish local work on a new branch and open a review request
    ReviewRequest(review::ReviewRequestCommand),

    /// List open review requests created by bkstg
    ReviewRequests(review::ReviewRequestsCommand),

    /// Load the aggregated catalog
    Load(load::LoadCommand),

    /// Evaluate one rank of a scorecard
    Rank(rank::RankCommand),
}

impl Cli {
    /// Runs the selected command.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        self.execute_with_config(config).await
    }

    /// Runtime configuration implied by the global flags.
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            Some("debug".to_string())
        } else if self.quiet {
            None
        } else {
            Some("info".to_string())
        };

        CliConfig {
            log_level,
            config_path: self.config.clone(),
        }
    }

    /// Runs the selected command with an explicit configuration.
    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        let ctx = CommandContext::load(config.config_path.as_deref(), self.quiet).await?;

        match self.command {
            Commands::Sources(cmd) => cmd.execute(&ctx).await,
            Commands::Refresh(cmd) => cmd.execute(&ctx).await,
            Commands::Pull(cmd) => cmd.execute(&ctx).await,
            Commands::Push(cmd) => cmd.execute(&ctx).await,
            Commands::ForceSync(cmd) => cmd.execute(&ctx).await,
            Commands::ReviewRequest(cmd) => cmd.execute(&ctx).await,
            Commands::ReviewRequests(cmd) => cmd.execute(&ctx).await,
            Commands::Load(cmd) => cmd.execute(&ctx).await,
            Commands::Rank(cmd) => cmd.execute(&ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_config_log_levels() {
        let verbose = Cli::try_parse_from(["bkstg", "-v", "sources"]).unwrap();
        assert_eq!(verbose.build_config().filter_directive(), "debug");

        let quiet = Cli::try_parse_from(["bkstg", "--quiet", "sources"]).unwrap();
        assert_eq!(quiet.build_config().filter_directive(), "error");

        let default = Cli::try_parse_from(["bkstg", "sources"]).unwrap();
        assert_eq!(default.build_config().log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["bkstg", "-v", "-q", "sources"]).is_err());
    }

    #[test]
    fn test_force_sync_requires_source() {
        assert!(Cli::try_parse_from(["bkstg", "force-sync"]).is_err());
        let cli = Cli::try_parse_from(["bkstg", "force-sync", "platform", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::ForceSync(ref c) if c.yes && c.source == "platform"));
    }

    #[test]
    fn test_rank_collects_scores() {
        let cli =
            Cli::try_parse_from(["bkstg", "rank", "quality", "overall", "a=1", "b=2.5"]).unwrap();
        let Commands::Rank(cmd) = cli.command else {
            panic!("expected rank command");
        };
        assert_eq!(cmd.scores.len(), 2);
        assert_eq!(cmd.scores[1], ("b".to_string(), 2.5));
    }

    #[test]
    fn test_config_path_from_flag() {
        let cli = Cli::try_parse_from(["bkstg", "--config", "/tmp/bkstg.yaml", "load"]).unwrap();
        assert_eq!(cli.build_config().config_path, Some(PathBuf::from("/tmp/bkstg.yaml")));
    }
}
