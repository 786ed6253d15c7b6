//! Restore the local instance from a base backup plus archived WAL.
//!
//! A restore is destructive and strictly sequential:
//!
//! ```text
//! Idle -> ServiceStopped -> DataDirChecked -> BaseBackupFetched -> RecoveryConfigured
//!      -> ServiceStarted -> Polling -> Completed | TimedOut
//! ```
//!
//! Any step error moves the session to `Failed` and records which step failed. Nothing
//! is rolled back; an existing data directory is only ever renamed aside.

pub mod log_tail;
pub mod recovery;
pub mod wait;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::backup::catalog;
use crate::backup::retention::{select_for_date, DATE_RESTORE_BRANCHES};
use crate::backup::Branch;
use crate::context::Context;
use crate::utils::{BackupError, Result};
use log_tail::LogFollower;
use recovery::RECOVERY_DONE;
use wait::{poll_until, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    ServiceStopped,
    DataDirChecked,
    BaseBackupFetched,
    RecoveryConfigured,
    ServiceStarted,
    Polling,
    Completed,
    TimedOut,
    Failed,
}

/// Which base backup to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseBackup {
    Latest,
    Named(String),
}

impl BaseBackup {
    pub fn as_str(&self) -> &str {
        match self {
            BaseBackup::Latest => "LATEST",
            BaseBackup::Named(name) => name,
        }
    }
}

impl fmt::Display for BaseBackup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseBackup {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(BackupError::InvalidRequest("empty base backup name".to_string())),
            "LATEST" => Ok(BaseBackup::Latest),
            name => Ok(BaseBackup::Named(name.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub branch: Branch,
    pub host: String,
    pub base_backup: BaseBackup,
    /// Move an existing data directory aside instead of refusing
    pub force: bool,
    pub recovery_target_time: Option<DateTime<Utc>>,
}

impl RestoreRequest {
    /// Weekly restores always replay all archived WAL.
    pub fn recovery_target(&self) -> Option<DateTime<Utc>> {
        match self.branch {
            Branch::Weekly => None,
            Branch::Daily => self.recovery_target_time,
        }
    }
}

/// Progress of one restore. Lives for a single invocation.
#[derive(Debug)]
pub struct RestoreSession {
    state: RestoreState,
    history: Vec<RestoreState>,
    pending: Option<RestoreState>,
    failed_step: Option<RestoreState>,
    pub pgdata: PathBuf,
    pub recovery_conf: Option<PathBuf>,
    pub moved_aside: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    poll_interval: Duration,
    timeout: Duration,
}

impl RestoreSession {
    pub fn new(pgdata: impl Into<PathBuf>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            state: RestoreState::Idle,
            history: vec![RestoreState::Idle],
            pending: None,
            failed_step: None,
            pgdata: pgdata.into(),
            recovery_conf: None,
            moved_aside: None,
            started_at: Utc::now(),
            deadline: None,
            poll_interval,
            timeout,
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[RestoreState] {
        &self.history
    }

    /// The step that was being attempted when the session failed
    pub fn failed_step(&self) -> Option<RestoreState> {
        self.failed_step
    }

    pub fn reached(&self, state: RestoreState) -> bool {
        self.history.contains(&state)
    }

    fn begin(&mut self, next: RestoreState) {
        self.pending = Some(next);
    }

    fn complete(&mut self) {
        if let Some(next) = self.pending.take() {
            self.enter(next);
        }
    }

    fn enter(&mut self, state: RestoreState) {
        info!(state = ?state, "Restore state");
        self.state = state;
        self.history.push(state);
    }

    fn fail(&mut self) {
        self.failed_step = self.pending.take();
        self.enter(RestoreState::Failed);
    }
}

/// What an operator is told after a completed restore
#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub request: RestoreRequest,
    pub pgdata: PathBuf,
    pub moved_aside: Option<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Restore: Restored {} from base backup {} of host {}, branch {}",
            self.pgdata.display(),
            self.request.base_backup,
            self.request.host,
            self.request.branch
        )?;
        if let Some(target) = self.request.recovery_target() {
            write!(f, " with recovery target {}", target.to_rfc3339_opts(SecondsFormat::Secs, true))?;
        }
        if let Some(aside) = &self.moved_aside {
            write!(f, ", previous data moved to {}", aside.display())?;
        }
        write!(f, ", done at {}", self.finished_at.with_timezone(&Local).to_rfc2822())
    }
}

/// Restore the configured data directory according to `request`.
pub async fn restore(ctx: &Context, request: &RestoreRequest) -> Result<RestoreSummary> {
    let cfg = &ctx.config.restore;
    let mut session = RestoreSession::new(&ctx.config.wale.pgdata, cfg.poll_interval(), cfg.timeout());
    run(ctx, request, &mut session).await?;

    Ok(RestoreSummary {
        request: request.clone(),
        pgdata: session.pgdata.clone(),
        moved_aside: session.moved_aside.clone(),
        finished_at: Utc::now(),
    })
}

/// Drive `session` through every step. On error the session is left in `Failed` or
/// `TimedOut` with its history intact.
pub async fn run(ctx: &Context, request: &RestoreRequest, session: &mut RestoreSession) -> Result<()> {
    info!(
        branch = %request.branch,
        host = %request.host,
        backup = %request.base_backup,
        force = request.force,
        "Starting restore"
    );

    let result = drive(ctx, request, session).await;
    if let Err(e) = &result {
        if session.state() != RestoreState::TimedOut {
            session.fail();
        }
        error!(
            failed_step = ?session.failed_step(),
            history = ?session.history(),
            "Restore failed: {}",
            e
        );
    }
    result
}

async fn drive(ctx: &Context, request: &RestoreRequest, session: &mut RestoreSession) -> Result<()> {
    let pgdata = session.pgdata.clone();

    session.begin(RestoreState::ServiceStopped);
    ctx.service().stop().await?;
    session.complete();

    session.begin(RestoreState::DataDirChecked);
    session.moved_aside = guard_data_dir(&pgdata, request.force).await?;
    session.complete();

    session.begin(RestoreState::BaseBackupFetched);
    ctx.wale()
        .backup_fetch(request.branch, &request.host, &pgdata, request.base_backup.as_str())
        .await?;
    session.complete();

    session.begin(RestoreState::RecoveryConfigured);
    let conf = recovery::configure(
        ctx,
        &pgdata,
        request.branch,
        &request.host,
        request.recovery_target(),
    )
    .await?;
    session.recovery_conf = Some(conf);
    session.complete();

    session.begin(RestoreState::ServiceStarted);
    ctx.service().start().await?;
    session.complete();

    await_recovery(ctx, session).await
}

/// Refuse, or move aside, an existing data directory. Never deletes it.
async fn guard_data_dir(pgdata: &Path, force: bool) -> Result<Option<PathBuf>> {
    match tokio::fs::metadata(pgdata).await {
        Ok(_) if force => {
            let aside = aside_path(pgdata, Local::now());
            tokio::fs::rename(pgdata, &aside).await?;
            warn!("Moved existing {} to {}", pgdata.display(), aside.display());
            Ok(Some(aside))
        }
        Ok(_) => Err(BackupError::DataDirConflict(pgdata.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn aside_path(pgdata: &Path, now: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}",
        pgdata.display(),
        now.format("%Y-%m-%d_%H-%M-%S")
    ))
}

async fn await_recovery(ctx: &Context, session: &mut RestoreSession) -> Result<()> {
    let timeout = session.timeout;
    let deadline = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| Utc::now().checked_add_signed(t));
    session.deadline = deadline;
    session.enter(RestoreState::Polling);

    let marker = session.pgdata.join(RECOVERY_DONE);
    info!(
        interval_secs = session.poll_interval.as_secs_f64(),
        "Waiting for {}",
        marker.display()
    );

    let follower = ctx
        .config
        .service
        .log_dir
        .as_deref()
        .and_then(LogFollower::start);
    let marker_ref = &marker;
    let outcome = poll_until(session.poll_interval, timeout, || async move {
        tokio::fs::try_exists(marker_ref).await.unwrap_or(false)
    })
    .await;
    if let Some(follower) = follower {
        follower.stop().await;
    }

    match outcome {
        WaitOutcome::Ready => {
            session.enter(RestoreState::Completed);
            info!("Recovery finished, found {}", marker.display());
            Ok(())
        }
        WaitOutcome::TimedOut => {
            session.enter(RestoreState::TimedOut);
            Err(BackupError::RecoveryTimeout {
                pgdata: session.pgdata.clone(),
                minutes: timeout.as_secs() / 60,
            })
        }
    }
}

/// Restore to the latest backup taken at or before `target`, searching the branches
/// in [`DATE_RESTORE_BRANCHES`] order. Any existing data directory is moved aside.
pub async fn restore_from_date(ctx: &Context, target: DateTime<Utc>, host: &str) -> Result<RestoreSummary> {
    let (branch, name) = find_before_date(ctx, target, host).await?;
    let request = RestoreRequest {
        branch,
        host: host.to_string(),
        base_backup: BaseBackup::Named(name),
        force: true,
        recovery_target_time: Some(target),
    };
    restore(ctx, &request).await
}

/// First branch holding a backup at or before `target`, with that backup's name.
pub async fn find_before_date(ctx: &Context, target: DateTime<Utc>, host: &str) -> Result<(Branch, String)> {
    for branch in DATE_RESTORE_BRANCHES {
        let records = catalog::list_backups(ctx, branch, host, false).await?;
        if let Some(record) = select_for_date(&records, target) {
            info!(branch = %branch, backup = %record.name, "Found backup before {}", target);
            return Ok((branch, record.name.clone()));
        }
        info!(branch = %branch, "No backup before {}", target);
    }
    Err(BackupError::NoBackupBeforeDate(target))
}
