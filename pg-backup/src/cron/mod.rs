//! The scheduled backup run.
//!
//! Every run takes a daily backup and prunes the daily branch. On the configured weekday
//! it also copies the previous day's backup into the weekly branch and prunes that. A step
//! whose prerequisite failed is not attempted and is reported as skipped. The report goes
//! to the notifier once, whatever happened.

pub mod scheduler;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use futures_util::future::BoxFuture;
use tracing::{error, info};
use uuid::Uuid;

use crate::backup::branch_copy::copy_to_branch;
use crate::backup::retention::resolve_weekday;
use crate::backup::{delete_backups, push_backup, Branch};
use crate::config::{Config, CronConfig};
use crate::context::Context;
use crate::notify::{Field, Notification, Notifier};
use crate::tools::process::{CommandRunner, ToolIdentity};
use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronStep {
    DailyBackup,
    DailyDelete,
    WeeklyBackup,
    WeeklyDelete,
}

impl CronStep {
    pub fn title(&self) -> &'static str {
        match self {
            CronStep::DailyBackup => "Daily Backup",
            CronStep::DailyDelete => "Daily Delete",
            CronStep::WeeklyBackup => "Weekly Backup",
            CronStep::WeeklyDelete => "Weekly Delete",
        }
    }
}

impl fmt::Display for CronStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSuccess {
    pub step: CronStep,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    Failed { step: CronStep, error: String },
    /// Not attempted because `prerequisite` failed
    Skipped { step: CronStep, prerequisite: CronStep },
}

impl StepFailure {
    pub fn step(&self) -> CronStep {
        match self {
            StepFailure::Failed { step, .. } | StepFailure::Skipped { step, .. } => *step,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StepFailure::Failed { error, .. } => error.clone(),
            StepFailure::Skipped { step, prerequisite } => {
                format!("{prerequisite} failed so not doing {step}")
            }
        }
    }
}

/// Outcome of one scheduled run, in execution order
#[derive(Debug, Clone)]
pub struct CronReport {
    pub run_id: Uuid,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub successes: Vec<StepSuccess>,
    pub failures: Vec<StepFailure>,
}

impl CronReport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            host: host.into(),
            started_at: Utc::now(),
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Record a step outcome. Returns whether the step succeeded.
    pub fn record(&mut self, step: CronStep, outcome: Result<String>) -> bool {
        match outcome {
            Ok(message) => {
                info!(run_id = %self.run_id, step = %step, "{}", message);
                self.successes.push(StepSuccess { step, message });
                true
            }
            Err(e) => {
                error!(run_id = %self.run_id, step = %step, "{}", e);
                self.failures.push(StepFailure::Failed {
                    step,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    pub fn skip(&mut self, step: CronStep, prerequisite: CronStep) {
        let failure = StepFailure::Skipped { step, prerequisite };
        info!(run_id = %self.run_id, step = %step, "{}", failure.message());
        self.failures.push(failure);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn notification(&self) -> Notification {
        Notification {
            title: format!("Cron job report for *{}*", self.host),
            successes: self
                .successes
                .iter()
                .map(|s| Field::new(s.step.title(), s.message.clone()))
                .collect(),
            failures: self
                .failures
                .iter()
                .map(|f| Field::new(f.step().title(), f.message()))
                .collect(),
        }
    }
}

/// The operations a scheduled run is made of. Each returns the message reported for it.
pub trait CronTasks: Send + Sync {
    fn daily_backup(&self) -> BoxFuture<'_, Result<String>>;
    fn delete(&self, branch: Branch, keep: usize) -> BoxFuture<'_, Result<String>>;
    /// Copy the daily backup taken on `day` into the weekly branch.
    fn weekly_copy(&self, day: NaiveDate) -> BoxFuture<'_, Result<String>>;
}

impl CronTasks for Context {
    fn daily_backup(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.wale().preflight().await?;
            let name = push_backup(self).await?;
            Ok(format!(
                "Backup: Backup done for host {}, new backup {}",
                self.config.wale.host, name
            ))
        })
    }

    fn delete(&self, branch: Branch, keep: usize) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(delete_backups(self, branch, keep).await?.to_string()) })
    }

    fn weekly_copy(&self, day: NaiveDate) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let summary = copy_to_branch(self, day, &Local, Branch::Daily, Branch::Weekly).await?;
            Ok(summary.to_string())
        })
    }
}

/// Run every step due on `today` and hand the report to `notifier`.
pub async fn run_cron(
    tasks: &dyn CronTasks,
    notifier: &dyn Notifier,
    cfg: &CronConfig,
    today: NaiveDate,
    host: &str,
) -> CronReport {
    let mut report = CronReport::new(host);
    info!(run_id = %report.run_id, host = %host, "Cron task started");

    let backup = tasks.daily_backup().await;
    if report.record(CronStep::DailyBackup, backup) {
        let deleted = tasks.delete(Branch::Daily, cfg.daily).await;
        report.record(CronStep::DailyDelete, deleted);
    } else {
        report.skip(CronStep::DailyDelete, CronStep::DailyBackup);
    }

    if today.weekday().num_days_from_sunday() == cfg.weekday {
        let copied = match resolve_weekday(today, i64::from(cfg.weekday) - 1) {
            Ok(day) => {
                info!(run_id = %report.run_id, day = %day, "Weekly run due");
                tasks.weekly_copy(day).await
            }
            Err(e) => Err(e),
        };
        if report.record(CronStep::WeeklyBackup, copied) {
            let deleted = tasks.delete(Branch::Weekly, cfg.weekly).await;
            report.record(CronStep::WeeklyDelete, deleted);
        } else {
            report.skip(CronStep::WeeklyDelete, CronStep::WeeklyBackup);
        }
    }

    finish(report, notifier).await
}

/// One scheduled run from the command line. Failing to resolve the tool identity is
/// reported like any other daily backup failure instead of aborting before the notifier
/// is reached.
pub async fn run_once(
    config: Config,
    runner: Arc<dyn CommandRunner>,
    notifier: &dyn Notifier,
    today: NaiveDate,
) -> CronReport {
    let host = config.wale.host.clone();
    match ToolIdentity::resolve(&config.wale.user, config.wale.working_dir.clone()) {
        Ok(identity) => {
            let ctx = Context::new(config, runner, identity);
            run_cron(&ctx, notifier, &ctx.config.cron, today, &host).await
        }
        Err(e) => report_setup_failure(notifier, &host, e).await,
    }
}

/// Report a run that could not get as far as its first step. The daily backup carries
/// `error` and everything depending on it is skipped.
pub async fn report_setup_failure(notifier: &dyn Notifier, host: &str, error: BackupError) -> CronReport {
    let mut report = CronReport::new(host);
    error!(run_id = %report.run_id, "Cron task could not start: {}", error);
    report.record(CronStep::DailyBackup, Err(error));
    report.skip(CronStep::DailyDelete, CronStep::DailyBackup);
    finish(report, notifier).await
}

async fn finish(report: CronReport, notifier: &dyn Notifier) -> CronReport {
    if report.is_success() {
        info!(run_id = %report.run_id, "CRON job done");
    } else {
        error!(
            run_id = %report.run_id,
            failures = report.failures.len(),
            "CRON job failed"
        );
    }

    notifier.notify(&report.notification()).await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::fake::RecordingNotifier;
    use crate::tools::process::fake::ScriptedRunner;
    use std::sync::Mutex;

    impl CronReport {
        fn failure_for(&self, step: CronStep) -> Option<&StepFailure> {
            self.failures.iter().find(|f| f.step() == step)
        }
    }

    #[derive(Default)]
    struct FakeTasks {
        fail_backup: bool,
        fail_daily_delete: bool,
        fail_copy: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTasks {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn failed(what: &str) -> BackupError {
        BackupError::SubprocessFailed {
            program: what.to_string(),
            exit_code: Some(1),
            stderr: "boom".to_string(),
        }
    }

    impl CronTasks for FakeTasks {
        fn daily_backup(&self) -> BoxFuture<'_, Result<String>> {
            self.log("backup".to_string());
            let result = if self.fail_backup {
                Err(failed("wal-e"))
            } else {
                Ok("Backup: pushed".to_string())
            };
            Box::pin(async move { result })
        }

        fn delete(&self, branch: Branch, keep: usize) -> BoxFuture<'_, Result<String>> {
            self.log(format!("delete {branch} {keep}"));
            let result = if branch == Branch::Daily && self.fail_daily_delete {
                Err(failed("wal-e"))
            } else {
                Ok(format!("Deletion: {branch}"))
            };
            Box::pin(async move { result })
        }

        fn weekly_copy(&self, day: NaiveDate) -> BoxFuture<'_, Result<String>> {
            self.log(format!("copy {day}"));
            let result = if self.fail_copy {
                Err(BackupError::NoBackupForWeekday(day))
            } else {
                Ok("Backup: copied".to_string())
            };
            Box::pin(async move { result })
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    // 2024-03-13 is a Wednesday, 2024-03-16 a Saturday
    const WEDNESDAY: u32 = 13;
    const SATURDAY: u32 = 16;

    #[tokio::test]
    async fn test_backup_failure_skips_daily_delete() {
        let tasks = FakeTasks {
            fail_backup: true,
            ..Default::default()
        };
        let notifier = RecordingNotifier::default();

        let report = run_cron(&tasks, &notifier, &CronConfig::default(), date(WEDNESDAY), "db1").await;

        assert!(report.successes.is_empty());
        assert_eq!(
            report.failure_for(CronStep::DailyDelete),
            Some(&StepFailure::Skipped {
                step: CronStep::DailyDelete,
                prerequisite: CronStep::DailyBackup,
            })
        );
        assert_eq!(tasks.calls(), vec!["backup"]);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].failures.len(), 2);
        assert_eq!(sent[0].failures[1].value, "Daily Backup failed so not doing Daily Delete");
    }

    #[tokio::test]
    async fn test_weekday_run_is_daily_only() {
        let tasks = FakeTasks::default();
        let notifier = RecordingNotifier::default();

        let report = run_cron(&tasks, &notifier, &CronConfig::default(), date(WEDNESDAY), "db1").await;

        assert!(report.is_success());
        let steps: Vec<CronStep> = report.successes.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![CronStep::DailyBackup, CronStep::DailyDelete]);
        assert_eq!(tasks.calls(), vec!["backup", "delete daily 8"]);
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(notifier.sent()[0].title, "Cron job report for *db1*");
    }

    #[tokio::test]
    async fn test_weekly_day_copies_previous_day() {
        let tasks = FakeTasks::default();
        let notifier = RecordingNotifier::default();

        let report = run_cron(&tasks, &notifier, &CronConfig::default(), date(SATURDAY), "db1").await;

        assert!(report.is_success());
        assert_eq!(
            tasks.calls(),
            vec!["backup", "delete daily 8", "copy 2024-03-15", "delete weekly 12"]
        );
        assert_eq!(report.successes.len(), 4);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_copy_failure_skips_weekly_delete() {
        let tasks = FakeTasks {
            fail_copy: true,
            ..Default::default()
        };
        let notifier = RecordingNotifier::default();

        let report = run_cron(&tasks, &notifier, &CronConfig::default(), date(SATURDAY), "db1").await;

        assert_eq!(report.successes.len(), 2);
        assert!(matches!(
            report.failure_for(CronStep::WeeklyBackup),
            Some(StepFailure::Failed { .. })
        ));
        assert!(matches!(
            report.failure_for(CronStep::WeeklyDelete),
            Some(StepFailure::Skipped { prerequisite: CronStep::WeeklyBackup, .. })
        ));
        assert!(!tasks.calls().contains(&"delete weekly 12".to_string()));
    }

    #[tokio::test]
    async fn test_daily_delete_failure_does_not_block_weekly() {
        let tasks = FakeTasks {
            fail_daily_delete: true,
            ..Default::default()
        };
        let notifier = RecordingNotifier::default();

        let report = run_cron(&tasks, &notifier, &CronConfig::default(), date(SATURDAY), "db1").await;

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failure_for(CronStep::DailyDelete),
            Some(StepFailure::Failed { .. })
        ));
        assert!(tasks.calls().contains(&"delete weekly 12".to_string()));
        assert_eq!(notifier.sent()[0].successes.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Context::test_config();
        config.wale.path = dir.path().join("wal-e");
        config.wale.gs_app_creds = dir.path().join("creds.json");
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = Context::new(config, runner.clone(), ToolIdentity::default());
        let notifier = RecordingNotifier::default();

        let report = run_cron(&ctx, &notifier, &CronConfig::default(), date(WEDNESDAY), "db1").await;

        assert!(matches!(
            report.failure_for(CronStep::DailyBackup),
            Some(StepFailure::Failed { error, .. }) if error.contains("not found")
        ));
        assert!(matches!(
            report.failure_for(CronStep::DailyDelete),
            Some(StepFailure::Skipped { .. })
        ));
        assert!(runner.calls().is_empty());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].failures[0].title, "Daily Backup");
    }

    #[tokio::test]
    async fn test_unknown_run_as_user_still_notifies_once() {
        let mut config = Context::test_config();
        config.wale.user = "pg-backup-no-such-user".to_string();
        let runner = Arc::new(ScriptedRunner::new());
        let notifier = RecordingNotifier::default();

        let report = run_once(config, runner.clone(), &notifier, date(WEDNESDAY)).await;

        assert!(matches!(
            report.failure_for(CronStep::DailyBackup),
            Some(StepFailure::Failed { error, .. }) if error.contains("does not exist")
        ));
        assert!(matches!(
            report.failure_for(CronStep::DailyDelete),
            Some(StepFailure::Skipped { prerequisite: CronStep::DailyBackup, .. })
        ));
        assert!(runner.calls().is_empty());
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_still_notifies_once() {
        let notifier = RecordingNotifier::default();
        let error = BackupError::Config("User postgres does not exist".to_string());

        let report = report_setup_failure(&notifier, "db1", error).await;

        assert!(!report.is_success());
        assert!(report.successes.is_empty());
        assert_eq!(report.failures.len(), 2);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Cron job report for *db1*");
        assert!(sent[0].failures[0].value.contains("does not exist"));
        assert_eq!(sent[0].failures[1].title, "Daily Delete");
    }
}
