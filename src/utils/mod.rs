//! Cross-platform utilities shared across bkstg.

pub mod fs;
pub mod keyed_lock;
pub mod platform;

pub use fs::{atomic_write, ensure_dir, normalize_path};
pub use keyed_lock::KeyedLocks;
pub use platform::{command_exists, get_git_command, resolve_path};
