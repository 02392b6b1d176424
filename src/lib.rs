//! bkstg - sync and location-resolution engine for a Git-backed software catalog
//!
//! The catalog lives in ordinary Git repositories. bkstg keeps a sparse local
//! working copy of each configured repository, tells the user how it relates
//! to its remote, moves changes in both directions, follows `Location`
//! entities across repositories and rates entities against scorecards.
//!
//! # Architecture Overview
//!
//! ```text
//!   cli ──► engine ──┬──► sync (state detector, operator) ──┐
//!                    ├──► location (resolver, cache, fetch) ─┼──► clone ──► git (VcsTransport)
//!                    └──► scorecard (formula, thresholds)    │
//!                                                hosting ◄───┘
//! ```
//!
//! - [`clone`] owns the clone directory: deterministic layout, staged atomic
//!   creation, corruption recovery and per-clone locking.
//! - [`sync`] classifies each working copy into a [`sync::SyncState`] and
//!   performs pull, push, force-sync and review requests.
//! - [`location`] walks the graph of `Location` entities with cycle
//!   detection, bounded parallelism and a TTL cache.
//! - [`scorecard`] parses rank formulas into a safe expression tree and maps
//!   values to labels through descending thresholds.
//! - [`engine`] ties the above to a loaded [`config::BkstgConfig`].
//!
//! Every process bkstg spawns goes through two capability traits,
//! [`git::VcsTransport`] and [`hosting::HostingClient`], so the engines can
//! be tested against in-memory fakes.
//!
//! # Configuration (bkstg.yaml)
//!
//! ```yaml
//! version: 1
//! sources:
//!   - name: platform
//!     type: github
//!     owner: acme
//!     repo: platform-catalog
//!     branch: main
//! settings:
//!   cache_ttl: 300
//!   max_workers: 5
//!   clone_dir: ~/.bkstg-clones
//!   review_request_policy: ahead_or_diverged
//! ```

pub mod catalog;
pub mod cli;
pub mod clone;
pub mod config;
pub mod constants;
pub mod core;
pub mod engine;
pub mod git;
pub mod hosting;
pub mod location;
pub mod scorecard;
pub mod sync;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
