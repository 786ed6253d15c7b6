//! Base backups: catalog, retention, WAL ranges and branch copies.
//!
//! Backups live under `<gs_prefix><host>/<branch>/` in WAL-E's layout:
//! `basebackups_005/<name>...` for base backups and `wal_005/<segment>.lzo` for WAL.

pub mod branch_copy;
pub mod catalog;
pub mod retention;
pub mod wal;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::Context;
use crate::utils::{BackupError, Result};
use retention::DeletionPlan;

const BASE_BACKUP_DIR: &str = "basebackups_005";
const WAL_DIR: &str = "wal_005";

/// A retention lineage with its own remote prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Daily,
    Weekly,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Daily => "daily",
            Branch::Weekly => "weekly",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Branch {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Branch::Daily),
            "weekly" => Ok(Branch::Weekly),
            other => Err(BackupError::InvalidRequest(format!("unknown branch {other:?}"))),
        }
    }
}

/// Remote object paths for every host and branch under one storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: String,
}

impl StorageLayout {
    pub fn new(gs_prefix: &str) -> Self {
        Self {
            root: gs_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Everything stored for `host`
    pub fn host_prefix(&self, host: &str) -> String {
        format!("{}/{}", self.root, host)
    }

    /// WAL-E `--gs-prefix` for a branch of a host
    pub fn branch_prefix(&self, host: &str, branch: Branch) -> String {
        format!("{}/{}/{}", self.root, host, branch)
    }

    pub fn base_backup_prefix(&self, host: &str, branch: Branch) -> String {
        format!("{}/{}/", self.branch_prefix(host, branch), BASE_BACKUP_DIR)
    }

    pub fn wal_prefix(&self, host: &str, branch: Branch) -> String {
        format!("{}/{}/", self.branch_prefix(host, branch), WAL_DIR)
    }

    /// Rewrite an object path of `src` into the same path under `dest`.
    /// Only the `<host>/<branch>/` segment is replaced.
    pub fn rebranch(&self, object: &str, host: &str, src: Branch, dest: Branch) -> Option<String> {
        let from = format!("{}/", self.branch_prefix(host, src));
        object
            .strip_prefix(&from)
            .map(|rest| format!("{}/{}", self.branch_prefix(host, dest), rest))
    }
}

/// Push a base backup of the configured data directory to the daily branch.
/// Returns the new backup's name.
pub async fn push_backup(ctx: &Context) -> Result<String> {
    let host = &ctx.config.wale.host;
    info!(branch = %Branch::Daily, host = %host, "Doing backup");

    let name = ctx.wale().backup_push(Branch::Daily, host).await?;
    info!(backup = %name, "Backup push finished");
    Ok(name)
}

/// Outcome of a retention run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionSummary {
    pub branch: Branch,
    pub host: String,
    pub plan: DeletionPlan,
}

impl fmt::Display for DeletionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.plan {
            DeletionPlan::Skip { available, keep } => write!(
                f,
                "Deletion: Number of backups ({available}) is not more than {keep} for host {}, branch {}",
                self.host, self.branch
            ),
            DeletionPlan::Retain { keep, delete } => write!(
                f,
                "Deletion: Deleted the oldest {delete} backups, retained {keep} for host {}, branch {}",
                self.host, self.branch
            ),
            DeletionPlan::Everything { delete } => write!(
                f,
                "Deletion: Deleted all {delete} backups for host {}, branch {}",
                self.host, self.branch
            ),
        }
    }
}

/// Keep the newest `keep` backups of `branch` for the configured host.
pub async fn delete_backups(ctx: &Context, branch: Branch, keep: usize) -> Result<DeletionSummary> {
    let host = ctx.config.wale.host.clone();
    info!(branch = %branch, host = %host, keep, "Deleting backups");

    let records = catalog::list_backups(ctx, branch, &host, false).await?;
    let plan = retention::select_for_deletion(&records, keep);

    if plan.should_delete() {
        let kept: Vec<&str> = retention::retained(&records, keep)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        info!(branch = %branch, ?kept, "Retaining backups");
        ctx.wale().delete(branch, &host, &plan).await?;
    } else {
        info!(branch = %branch, "Delete skipped, not enough backups");
    }

    Ok(DeletionSummary { branch, host, plan })
}

/// Total stored size of every backup of `host`, as reported by the storage CLI.
pub async fn total_size(ctx: &Context, host: &str) -> Result<String> {
    info!(host = %host, "Getting size of backups");
    ctx.storage().total_size(host).await
}
