//! PostgreSQL backup orchestration on top of WAL-E and Google Cloud Storage.
//!
//! Daily base backups with count-based retention, weekly copies of a chosen daily
//! backup, and restores to the latest backup or to a point in time.

pub mod backup;
pub mod config;
pub mod context;
pub mod cron;
pub mod daemon;
pub mod notify;
pub mod restore;
pub mod tools;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::Context;
pub use utils::errors::BackupError;
pub use utils::Result;
