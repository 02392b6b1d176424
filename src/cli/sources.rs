//! `sources` and `refresh` commands.

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use super::common::{CommandContext, paint_state};

/// Show the sync state of every synchronized source.
#[derive(Debug, Args)]
pub struct SourcesCommand {
    /// Compare against the last fetched remote state instead of fetching
    #[arg(long)]
    pub no_fetch: bool,

    /// Output format
    #[arg(long, default_value = "table", value_parser = ["table", "json"])]
    pub format: String,
}

impl SourcesCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let statuses = ctx.engine.list_sources(!self.no_fetch).await;

        if self.format == "json" {
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            return Ok(());
        }

        if statuses.is_empty() {
            ctx.say("No synchronized sources configured".dimmed());
            return Ok(());
        }

        let width = statuses.iter().map(|s| s.source_name.len()).max().unwrap_or(0).max(6);
        println!("{:<width$}  {:<16}  {}", "SOURCE".bold(), "STATE".bold(), "STATUS".bold());
        for status in &statuses {
            println!(
                "{:<width$}  {:<16}  {}",
                status.source_name,
                paint_state(status.state),
                status.message
            );
            for path in &status.conflicts {
                println!("{:<width$}  {}", "", format!("conflict: {path}").red());
            }
        }
        Ok(())
    }
}

/// Fetch every cloned source without touching working copies.
#[derive(Debug, Args)]
pub struct RefreshCommand {}

impl RefreshCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let results = ctx.engine.refresh_all().await;
        let mut failed = 0usize;
        for (name, result) in &results {
            match result {
                Ok(()) => ctx.say(format!("{} {}", "✓".green(), name)),
                Err(e) => {
                    failed += 1;
                    eprintln!("{} {}: {e:#}", "✗".red(), name);
                }
            }
        }
        if failed > 0 {
            bail!("{failed} of {} source(s) failed to refresh", results.len());
        }
        Ok(())
    }
}
