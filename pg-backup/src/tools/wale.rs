//! WAL-E invocations.

use std::path::Path;

use tracing::{info, warn};

use crate::backup::retention::DeletionPlan;
use crate::backup::Branch;
use crate::context::Context;
use crate::tools::process::Invocation;
use crate::utils::{BackupError, Result};

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

pub struct Wale<'a> {
    ctx: &'a Context,
}

impl<'a> Wale<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Fail early when the executable or the storage credentials are missing.
    pub async fn preflight(&self) -> Result<()> {
        let wale = &self.ctx.config.wale;
        for path in [&wale.path, &wale.gs_app_creds] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                warn!("{} not found, is WAL-E installed and configured?", path.display());
                return Err(BackupError::ToolMissing(path.clone()));
            }
        }
        Ok(())
    }

    fn invocation(&self, branch: Branch, host: &str) -> Invocation {
        let wale = &self.ctx.config.wale;
        Invocation::new(&wale.path)
            .env(CREDENTIALS_ENV, wale.gs_app_creds.to_string_lossy())
            .run_as(self.ctx.identity.clone())
            .arg("--gs-prefix")
            .arg(self.ctx.layout().branch_prefix(host, branch))
    }

    async fn run(&self, invocation: Invocation) -> Result<String> {
        let name = invocation.program_name();
        let output = self.ctx.runner.run(&invocation).await?.check(&name)?;
        Ok(output.stderr)
    }

    /// Raw `backup-list` output
    pub async fn backup_list(&self, branch: Branch, host: &str, detailed: bool) -> Result<String> {
        let mut invocation = self.invocation(branch, host).arg("backup-list");
        if detailed {
            invocation = invocation.arg("--detail");
        }
        let name = invocation.program_name();
        let output = self.ctx.runner.run(&invocation).await?.check(&name)?;
        Ok(output.stdout)
    }

    /// Upload a base backup of the configured data directory. Returns the new backup's name.
    pub async fn backup_push(&self, branch: Branch, host: &str) -> Result<String> {
        let pgdata = &self.ctx.config.wale.pgdata;
        let stderr = self
            .run(self.invocation(branch, host).arg("backup-push").arg(pgdata))
            .await?;

        let base_prefix = self.ctx.layout().base_backup_prefix(host, branch);
        match pushed_backup_name(&stderr, &base_prefix) {
            Some(name) => Ok(name),
            None => {
                warn!("backup-push did not report the uploaded backup name");
                Ok("(unknown)".to_string())
            }
        }
    }

    /// Download and extract base backup `name` (or `LATEST`) into `pgdata`.
    pub async fn backup_fetch(&self, branch: Branch, host: &str, pgdata: &Path, name: &str) -> Result<()> {
        self.run(
            self.invocation(branch, host)
                .arg("backup-fetch")
                .arg(pgdata)
                .arg(name),
        )
        .await?;
        info!(backup = %name, "backup-fetch finished, base backup extracted");
        Ok(())
    }

    /// Apply a retention decision. Skip plans never reach WAL-E.
    pub async fn delete(&self, branch: Branch, host: &str, plan: &DeletionPlan) -> Result<()> {
        let retention: Vec<String> = match plan {
            DeletionPlan::Skip { .. } => return Ok(()),
            DeletionPlan::Retain { keep, .. } => vec!["retain".to_string(), keep.to_string()],
            DeletionPlan::Everything { .. } => vec!["everything".to_string()],
        };
        self.run(
            self.invocation(branch, host)
                .args(["delete", "--confirm"])
                .args(retention),
        )
        .await?;
        Ok(())
    }

    /// `restore_command` line PostgreSQL uses to pull WAL during recovery
    pub fn restore_command(&self, branch: Branch, host: &str) -> String {
        let wale = &self.ctx.config.wale;
        format!(
            "restore_command = '{}=\"{}\" WALE_GS_PREFIX=\"{}\" {} wal-fetch %f %p'",
            CREDENTIALS_ENV,
            wale.gs_app_creds.display(),
            self.ctx.layout().branch_prefix(host, branch),
            wale.path.display()
        )
    }
}

/// WAL-E announces each uploaded part as `DETAIL: Uploading to <base prefix><name>/...`.
pub fn pushed_backup_name(stderr: &str, base_prefix: &str) -> Option<String> {
    let marker = format!("DETAIL: Uploading to {base_prefix}");
    let start = stderr.find(&marker)? + marker.len();
    let name: String = stderr[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::process::fake::ScriptedRunner;
    use std::sync::Arc;

    #[test]
    fn test_pushed_backup_name() {
        let prefix = "gs://bucket/db1/daily/basebackups_005/";
        let stderr = "INFO starting\nDETAIL: Uploading to gs://bucket/db1/daily/basebackups_005/base_00000001000009D6000000D0_00000040/tar_partitions/part_1.tar.lzo.\n";
        assert_eq!(
            pushed_backup_name(stderr, prefix).as_deref(),
            Some("base_00000001000009D6000000D0_00000040")
        );
        assert_eq!(pushed_backup_name("nothing here", prefix), None);
    }

    #[test]
    fn test_restore_command() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = Context::for_tests(runner);
        let line = ctx.wale().restore_command(Branch::Weekly, "db1");
        assert_eq!(
            line,
            "restore_command = 'GOOGLE_APPLICATION_CREDENTIALS=\"/etc/pg-backup/gsAppCreds.json\" \
             WALE_GS_PREFIX=\"gs://bucket/db1/weekly\" /usr/local/bin/wal-e wal-fetch %f %p'"
        );
    }

    #[tokio::test]
    async fn test_invocations_carry_prefix_and_credentials() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = Context::for_tests(runner.clone());

        ctx.wale().backup_list(Branch::Daily, "db1", true).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].to_string(),
            "/usr/local/bin/wal-e --gs-prefix gs://bucket/db1/daily backup-list --detail"
        );
        assert!(calls[0]
            .env
            .iter()
            .any(|(k, v)| k == CREDENTIALS_ENV && v == "/etc/pg-backup/gsAppCreds.json"));
    }

    #[tokio::test]
    async fn test_preflight_reports_missing_tool() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut config = Context::test_config();
        config.wale.path = "/nonexistent/wal-e".into();
        let ctx = Context::new(config, runner, Default::default());

        let err = ctx.wale().preflight().await.unwrap_err();
        assert!(matches!(err, BackupError::ToolMissing(p) if p.ends_with("wal-e")));
    }
}
