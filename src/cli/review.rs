//! Review request commands.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::common::CommandContext;

/// Publish local work on a fresh branch and open a review request.
#[derive(Debug, Args)]
pub struct ReviewRequestCommand {
    /// Configured source name
    pub source: String,

    /// Review request title
    #[arg(long, short)]
    pub title: String,

    /// Review request description
    #[arg(long, short, default_value = "")]
    pub body: String,
}

impl ReviewRequestCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let request = ctx.engine.create_review_request(&self.source, &self.title, &self.body).await?;
        ctx.say(format!(
            "{} Opened review request from {} into {}",
            "✓".green(),
            request.head.cyan(),
            request.base.cyan()
        ));
        println!("{}", request.url);
        Ok(())
    }
}

/// List open review requests that bkstg created for a source.
#[derive(Debug, Args)]
pub struct ReviewRequestsCommand {
    /// Configured source name
    pub source: String,
}

impl ReviewRequestsCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let requests = ctx.engine.list_review_requests(&self.source).await?;
        if requests.is_empty() {
            ctx.say("No open review requests".dimmed());
            return Ok(());
        }
        for request in requests {
            let number = request.number.map_or_else(String::new, |n| format!("#{n} "));
            println!("{}{}  {}  {}", number.bold(), request.title, request.head.cyan(), request.url.dimmed());
        }
        Ok(())
    }
}
