//! `pull`, `push` and `force-sync` commands.

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use super::common::CommandContext;

/// Fast-forward a source to its remote.
#[derive(Debug, Args)]
pub struct PullCommand {
    /// Configured source name
    pub source: String,
}

impl PullCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let result = ctx.engine.pull(&self.source).await?;
        ctx.report(&result);
        Ok(())
    }
}

/// Commit pending changes and publish local commits.
#[derive(Debug, Args)]
pub struct PushCommand {
    /// Configured source name
    pub source: String,
}

impl PushCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let result = ctx.engine.push(&self.source).await?;
        ctx.report(&result);
        Ok(())
    }
}

/// Discard every local commit and change, then match the remote.
#[derive(Debug, Args)]
pub struct ForceSyncCommand {
    /// Configured source name
    pub source: String,

    /// Confirm that local commits and changes will be lost
    #[arg(long)]
    pub yes: bool,
}

impl ForceSyncCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        if !self.yes {
            bail!(
                "force-sync discards all local commits and changes in '{}'; re-run with --yes to confirm",
                self.source
            );
        }
        let result = ctx.engine.force_sync(&self.source).await?;
        ctx.say(format!("{} {}", "!".yellow().bold(), result.message));
        ctx.report(&result);
        Ok(())
    }
}
