//! `rank` command: evaluate a rank for ad-hoc score values.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::collections::HashMap;

use super::common::CommandContext;
use crate::scorecard::RankOutcome;

/// Evaluate one rank of a scorecard.
#[derive(Debug, Args)]
pub struct RankCommand {
    /// Scorecard identifier
    pub scorecard: String,

    /// Rank identifier within the scorecard
    pub rank: String,

    /// Score values as `score_id=value`
    #[arg(value_name = "SCORE=VALUE", value_parser = parse_score)]
    pub scores: Vec<(String, f64)>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_score(raw: &str) -> Result<(String, f64), String> {
    let (id, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SCORE=VALUE, got '{raw}'"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing score id in '{raw}'"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value.trim()))?;
    Ok((id.to_string(), value))
}

impl RankCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let scores: HashMap<String, f64> = self.scores.into_iter().collect();
        let result = ctx.engine.evaluate_rank(&self.scorecard, &self.rank, &scores).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        let rendered = match &result.outcome {
            RankOutcome::Rated { .. } | RankOutcome::Labelled { .. } => {
                result.outcome.to_string().green().bold()
            }
            RankOutcome::Unratable { .. } => result.outcome.to_string().yellow(),
        };
        println!("{}/{}: {rendered}", result.scorecard_id, result.rank_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("test_coverage=85").unwrap(), ("test_coverage".to_string(), 85.0));
        assert_eq!(parse_score(" a = -1.5 ").unwrap(), ("a".to_string(), -1.5));
        assert!(parse_score("a").is_err());
        assert!(parse_score("=3").is_err());
        assert!(parse_score("a=high").is_err());
    }
}
