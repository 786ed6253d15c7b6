//! Backup catalog as reported by `wal-e backup-list`.
//!
//! The listing is tab separated with a header row:
//! `name  last_modified  expanded_size_bytes  wal_segment_backup_start
//!  wal_segment_offset_backup_start  wal_segment_backup_stop  wal_segment_offset_backup_stop`.
//! The detail columns are only filled in with `--detail`.

use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tracing::info;

use super::wal::WalId;
use super::Branch;
use crate::context::Context;
use crate::utils::{BackupError, Result};

/// One base backup known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub detail: Option<BackupDetail>,
}

/// Columns only present in a detailed listing. Kept as the catalog printed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDetail {
    pub expanded_size_bytes: String,
    pub wal_start: String,
    pub wal_start_offset: String,
    pub wal_end: String,
    pub wal_end_offset: String,
}

impl BackupDetail {
    pub fn wal_start_id(&self) -> Result<WalId> {
        self.wal_start.parse()
    }

    pub fn wal_end_id(&self) -> Result<WalId> {
        self.wal_end.parse()
    }
}

impl BackupRecord {
    pub fn new(name: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_modified,
            detail: None,
        }
    }
}

impl fmt::Display for BackupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}",
            self.name,
            self.last_modified.with_timezone(&Local).to_rfc2822()
        )?;
        if let Some(d) = &self.detail {
            write!(
                f,
                "\t{}\t{}\t{}\t{}\t{}",
                d.expanded_size_bytes, d.wal_start, d.wal_start_offset, d.wal_end, d.wal_end_offset
            )?;
        }
        Ok(())
    }
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Catalog timestamps are RFC 3339; offset-less values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_line(line: &str, detailed: bool) -> Result<BackupRecord> {
    let parse_error = |reason: &str| BackupError::CatalogParse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let columns: Vec<&str> = line.split('\t').map(str::trim).collect();
    let name = columns.first().copied().unwrap_or_default();
    if name.is_empty() {
        return Err(parse_error("missing backup name"));
    }
    let last_modified = columns
        .get(1)
        .and_then(|v| parse_timestamp(v))
        .ok_or_else(|| parse_error("unparsable last_modified"))?;

    let detail = if detailed {
        if columns.len() < 7 || columns[3].is_empty() || columns[5].is_empty() {
            return Err(parse_error("missing detail columns"));
        }
        Some(BackupDetail {
            expanded_size_bytes: columns[2].to_string(),
            wal_start: columns[3].to_string(),
            wal_start_offset: columns[4].to_string(),
            wal_end: columns[5].to_string(),
            wal_end_offset: columns[6].to_string(),
        })
    } else {
        None
    };

    Ok(BackupRecord {
        name: name.to_string(),
        last_modified,
        detail,
    })
}

/// Parse a `backup-list` listing in catalog order.
///
/// Output without a header row means WAL-E produced nothing usable. Any unparsable
/// record fails the whole listing.
pub fn parse_catalog(output: &str, detailed: bool) -> std::result::Result<Vec<BackupRecord>, CatalogFault> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    if lines.next().is_none() {
        return Err(CatalogFault::NoHeader);
    }
    lines
        .map(|l| parse_line(l, detailed))
        .collect::<Result<Vec<_>>>()
        .map_err(CatalogFault::Record)
}

/// Why a listing could not be turned into records
#[derive(Debug)]
pub enum CatalogFault {
    NoHeader,
    Record(BackupError),
}

/// Query the catalog of `branch` for `host`.
pub async fn list_backups(ctx: &Context, branch: Branch, host: &str, detailed: bool) -> Result<Vec<BackupRecord>> {
    info!(branch = %branch, host = %host, detailed, "Getting backups");
    let unavailable = |reason: String| BackupError::CatalogUnavailable {
        branch: branch.to_string(),
        host: host.to_string(),
        reason,
    };

    let output = match ctx.wale().backup_list(branch, host, detailed).await {
        Ok(output) => output,
        Err(e @ BackupError::SubprocessFailed { .. }) => return Err(unavailable(e.to_string())),
        Err(e) => return Err(e),
    };

    let records = match parse_catalog(&output, detailed) {
        Ok(records) => records,
        Err(CatalogFault::NoHeader) => return Err(unavailable("empty backup-list output".to_string())),
        Err(CatalogFault::Record(e)) => return Err(e),
    };

    info!(branch = %branch, count = records.len(), "Got backup list");
    Ok(records)
}

/// Operator-facing listing
pub fn render_listing(branch: Branch, host: &str, records: &[BackupRecord]) -> String {
    let mut out = format!(
        "Got {} backups as on {} for HOST {}\n",
        branch,
        Local::now().to_rfc2822(),
        host
    );
    for record in records {
        out.push('\n');
        out.push_str(&record.to_string());
    }
    out
}
