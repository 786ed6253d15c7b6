//! Error types for backup orchestration.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed WAL segment id {0:?}: expected 24 hex characters")]
    MalformedWalId(String),

    #[error("Could not parse catalog line {line:?}: {reason}")]
    CatalogParse { line: String, reason: String },

    #[error("Backup catalog unavailable for branch {branch} of host {host}: {reason}")]
    CatalogUnavailable {
        branch: String,
        host: String,
        reason: String,
    },

    #[error("No daily backup found for the weekday {0}")]
    NoBackupForWeekday(NaiveDate),

    #[error("Got an empty list of files in backup dir {0}")]
    EmptyBackupListing(String),

    #[error("Directory {0} already exists, rename/move it or use --force")]
    DataDirConflict(PathBuf),

    #[error("No backups found before {0} in any branch")]
    NoBackupBeforeDate(DateTime<Utc>),

    #[error("Failed to detect recovery.done in {pgdata} even after {minutes} minutes, check PostgreSQL logs, recovery may still be running")]
    RecoveryTimeout { pgdata: PathBuf, minutes: u64 },

    #[error("{program} exited with {}: {stderr}", describe_exit(.exit_code))]
    SubprocessFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Executable or credentials not found at {0}")]
    ToolMissing(PathBuf),

    #[error("Could not copy {object}: copied {copied} of {total} files before the failure: {source}")]
    CopyAborted {
        object: String,
        copied: usize,
        total: usize,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Notification error: {0}")]
    Notify(#[from] reqwest::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}
