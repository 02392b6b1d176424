//! Shared plumbing for CLI commands.

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use std::path::Path;

use crate::config::BkstgConfig;
use crate::engine::Engine;
use crate::sync::{SyncResult, SyncState};

/// Everything a command needs: the loaded configuration wrapped in an
/// [`Engine`], plus output preferences.
#[derive(Debug)]
pub struct CommandContext {
    /// Engine over the loaded configuration
    pub engine: Engine,
    /// Suppress informational output
    pub quiet: bool,
}

impl CommandContext {
    /// Loads the configuration (explicit path, `BKSTG_CONFIG`, project,
    /// user, defaults) and builds the engine.
    pub async fn load(config_path: Option<&Path>, quiet: bool) -> Result<Self> {
        let project_dir = std::env::current_dir().context("Failed to determine current directory")?;
        let config = BkstgConfig::load(&project_dir, config_path).await?;
        Ok(Self::new(Engine::from_config(config)?, quiet))
    }

    /// Wraps an existing engine.
    #[must_use]
    pub const fn new(engine: Engine, quiet: bool) -> Self {
        Self {
            engine,
            quiet,
        }
    }

    /// Prints a line unless `--quiet` was given.
    pub fn say(&self, line: impl std::fmt::Display) {
        if !self.quiet {
            println!("{line}");
        }
    }

    /// Prints the outcome of a sync operation.
    pub fn report(&self, result: &SyncResult) {
        self.say(format!(
            "{} {}: {} [{}]",
            "✓".green(),
            result.source_name.bold(),
            result.message,
            paint_state(result.state)
        ));
    }
}

/// Colors a sync state by how much attention it needs.
#[must_use]
pub fn paint_state(state: SyncState) -> ColoredString {
    let text = state.to_string();
    match state {
        SyncState::Synced => text.green(),
        SyncState::LocalAhead(_) | SyncState::RemoteAhead(_) => text.yellow(),
        SyncState::Diverged | SyncState::Conflict => text.red(),
        SyncState::NotCloned | SyncState::Unknown => text.dimmed(),
    }
}
