//! `recovery.conf` for archive recovery from WAL-E.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::backup::Branch;
use crate::context::Context;
use crate::utils::Result;

pub const RECOVERY_CONF: &str = "recovery.conf";
/// PostgreSQL renames `recovery.conf` to this once recovery has finished.
pub const RECOVERY_DONE: &str = "recovery.done";

/// Body of `recovery.conf`.
///
/// With a target time, recovery stops there and the server is promoted.
pub fn recovery_conf(restore_command: &str, target: Option<DateTime<Utc>>) -> String {
    let mut conf = format!("{restore_command}\n");
    if let Some(target) = target {
        conf.push_str("recovery_target_action = promote\n");
        conf.push_str(&format!(
            "recovery_target_time = '{}'\n",
            target.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    conf
}

/// Write `recovery.conf` into `pgdata`, clear a stale completion marker and hand the
/// directory to the database user.
pub async fn configure(
    ctx: &Context,
    pgdata: &Path,
    branch: Branch,
    host: &str,
    target: Option<DateTime<Utc>>,
) -> Result<PathBuf> {
    let path = pgdata.join(RECOVERY_CONF);
    let conf = recovery_conf(&ctx.wale().restore_command(branch, host), target);
    tokio::fs::write(&path, conf).await?;
    info!("Wrote {}", path.display());

    match tokio::fs::remove_file(pgdata.join(RECOVERY_DONE)).await {
        Ok(()) => info!("Removed stale {}", RECOVERY_DONE),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    ctx.service().chown(pgdata).await?;
    Ok(path)
}
