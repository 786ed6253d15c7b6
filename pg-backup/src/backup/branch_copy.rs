//! Copy one daily backup, with the WAL it needs, into another branch.

use std::fmt;

use chrono::{NaiveDate, TimeZone};
use futures_util::stream::{self, StreamExt};
use tracing::{error, info};

use super::catalog::{self, BackupRecord};
use super::retention::select_for_weekday;
use super::wal::wal_range;
use super::Branch;
use crate::context::Context;
use crate::utils::{BackupError, Result};

/// Result of a successful branch copy
#[derive(Debug, Clone)]
pub struct CopySummary {
    pub backup: String,
    pub src: Branch,
    pub dest: Branch,
    /// Destination paths of every copied object
    pub files: Vec<String>,
}

impl fmt::Display for CopySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backup: Copied {} backup {} and corresponding wal files to {}, no. of files : {}",
            self.src,
            self.backup,
            self.dest,
            self.files.len()
        )
    }
}

/// Archived WAL objects `record` depends on.
pub fn wal_objects(ctx: &Context, record: &BackupRecord, branch: Branch, host: &str) -> Result<Vec<String>> {
    let detail = record.detail.as_ref().ok_or_else(|| {
        BackupError::InvalidRequest(format!("backup {} has no WAL detail", record.name))
    })?;
    let start = detail.wal_start_id()?;
    let end = detail.wal_end_id()?;
    let prefix = ctx.layout().wal_prefix(host, branch);

    let files: Vec<String> = wal_range(start, end, ctx.config.wal.segment_max)
        .iter()
        .map(|wal| format!("{}{}", prefix, wal.file_name()))
        .collect();
    info!(wal_start = %start, wal_end = %end, count = files.len(), "Got WAL files");
    Ok(files)
}

/// Every stored object of base backup `name`. An empty listing means the catalog
/// and storage disagree.
pub async fn base_backup_objects(ctx: &Context, name: &str, branch: Branch, host: &str) -> Result<Vec<String>> {
    let prefix = format!("{}{}", ctx.layout().base_backup_prefix(host, branch), name);
    let files = ctx.storage().list_recursive(&prefix).await?;
    if files.is_empty() {
        return Err(BackupError::EmptyBackupListing(prefix));
    }
    info!(count = files.len(), "Got base files");
    Ok(files)
}

/// Copy the latest `src` backup taken on calendar day `day` (in `tz`) into `dest`.
pub async fn copy_to_branch<Tz: TimeZone + Sync>(
    ctx: &Context,
    day: NaiveDate,
    tz: &Tz,
    src: Branch,
    dest: Branch,
) -> Result<CopySummary> {
    if src == dest {
        return Err(BackupError::InvalidRequest(format!(
            "source and destination branch are both {src}"
        )));
    }
    let host = ctx.config.wale.host.clone();
    info!(day = %day, src = %src, dest = %dest, "Starting copy backup");

    let records = catalog::list_backups(ctx, src, &host, true).await?;
    let record = select_for_weekday(&records, day, tz)
        .ok_or(BackupError::NoBackupForWeekday(day))?;
    info!(backup = %record.name, "Got backup for day {}", day);

    let base_files = base_backup_objects(ctx, &record.name, src, &host).await?;
    let mut objects = wal_objects(ctx, record, src, &host)?;
    objects.extend(base_files);

    let layout = ctx.layout();
    let pairs = objects
        .into_iter()
        .map(|object| {
            let target = layout.rebranch(&object, &host, src, dest).ok_or_else(|| {
                BackupError::InvalidRequest(format!("{object} is outside the {src} branch"))
            })?;
            Ok((object, target))
        })
        .collect::<Result<Vec<_>>>()?;

    let files = copy_all(ctx, pairs).await?;
    Ok(CopySummary {
        backup: record.name.clone(),
        src,
        dest,
        files,
    })
}

/// Copy every `(source, destination)` pair with bounded concurrency. The first failure
/// aborts the remaining copies.
async fn copy_all(ctx: &Context, pairs: Vec<(String, String)>) -> Result<Vec<String>> {
    let total = pairs.len();
    let limit = ctx.config.storage.copy_concurrency;
    info!(total, limit, "Starting copying files");

    let storage = ctx.storage();
    let storage = &storage;
    let mut copies = stream::iter(pairs)
        .map(|(src, dest)| async move {
            match storage.copy(&src, &dest).await {
                Ok(()) => Ok(dest),
                Err(e) => Err((src, e)),
            }
        })
        .buffer_unordered(limit);

    let mut copied = Vec::with_capacity(total);
    while let Some(result) = copies.next().await {
        match result {
            Ok(dest) => copied.push(dest),
            Err((object, source)) => {
                error!(object = %object, copied = copied.len(), total, "Copy failed, aborting");
                return Err(BackupError::CopyAborted {
                    object,
                    copied: copied.len(),
                    total,
                    source: Box::new(source),
                });
            }
        }
    }

    Ok(copied)
}
