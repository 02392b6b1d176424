//! `load` command: aggregate the catalog and summarize it.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::common::CommandContext;
use crate::catalog::EntityId;
use crate::engine::CatalogLoad;
use crate::location::LocationWarning;
use crate::scorecard::RankResult;

/// Load the aggregated catalog.
#[derive(Debug, Args)]
pub struct LoadCommand {
    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct EntityRow<'a> {
    id: EntityId,
    kind: &'a str,
    origin: &'a PathBuf,
}

#[derive(Debug, Serialize)]
struct SourceErrorRow<'a> {
    source: &'a str,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct LoadReport<'a> {
    entities: Vec<EntityRow<'a>>,
    ranks: &'a BTreeMap<EntityId, Vec<RankResult>>,
    scorecards: Vec<&'a str>,
    warnings: &'a [LocationWarning],
    source_errors: Vec<SourceErrorRow<'a>>,
}

impl<'a> LoadReport<'a> {
    fn new(load: &'a CatalogLoad) -> Self {
        Self {
            entities: load
                .entities
                .iter()
                .map(|s| EntityRow {
                    id: s.entity.id(),
                    kind: &s.entity.kind,
                    origin: &s.origin,
                })
                .collect(),
            ranks: &load.ranks,
            scorecards: load.scorecards.iter().map(|c| c.id()).collect(),
            warnings: &load.warnings,
            source_errors: load
                .source_errors
                .iter()
                .map(|(source, reason)| SourceErrorRow {
                    source,
                    reason,
                })
                .collect(),
        }
    }
}

impl LoadCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let load = ctx.engine.load_catalog().await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&LoadReport::new(&load))?);
            return Ok(());
        }

        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for sourced in &load.entities {
            *by_kind.entry(sourced.entity.kind.as_str()).or_default() += 1;
        }
        println!("{} {} entities", "Loaded".bold(), load.entities.len());
        for (kind, count) in &by_kind {
            println!("  {kind:<16} {count}");
        }

        if !load.ranks.is_empty() {
            println!("\n{}", "Ranks".bold());
            for (entity_id, results) in &load.ranks {
                for result in results {
                    let outcome = match result.outcome.label() {
                        Some(_) => result.outcome.to_string().green(),
                        None => result.outcome.to_string().yellow(),
                    };
                    println!("  {entity_id}  {}/{}  {outcome}", result.scorecard_id, result.rank_id);
                }
            }
        }

        for warning in &load.warnings {
            eprintln!("{}: {warning}", "warning".yellow());
        }
        for (source, reason) in &load.source_errors {
            eprintln!("{}: source '{source}' skipped: {reason}", "error".red());
        }
        Ok(())
    }
}
