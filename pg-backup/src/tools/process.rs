//! Subprocess execution.
//!
//! Every external tool (WAL-E, gsutil, service control, chown) is invoked through a
//! [`CommandRunner`], so orchestration code can be driven by a scripted runner in tests.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::utils::{BackupError, Result};

/// OS identity subprocesses run under. Resolved once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolIdentity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub working_dir: Option<PathBuf>,
}

impl ToolIdentity {
    /// Look up `user` in the OS user database.
    pub fn resolve(user: &str, working_dir: Option<PathBuf>) -> Result<Self> {
        let found = nix::unistd::User::from_name(user)
            .map_err(|e| BackupError::Config(format!("Failed to look up user {user}: {e}")))?
            .ok_or_else(|| BackupError::Config(format!("User {user} does not exist")))?;

        Ok(Self {
            uid: Some(found.uid.as_raw()),
            gid: Some(found.gid.as_raw()),
            working_dir,
        })
    }
}

/// A fully described subprocess call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub identity: Option<ToolIdentity>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn run_as(mut self, identity: ToolIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Build an invocation from a configured argv such as `["service", "postgresql", "stop"]`.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| BackupError::Config("empty command".to_string()))?;
        Ok(Self::new(program).args(rest))
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`BackupError::SubprocessFailed`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BackupError::SubprocessFailed {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: stderr_tail(&self.stderr),
            })
        }
    }
}

const STDERR_TAIL_LINES: usize = 20;

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Runs subprocesses to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` and capture its output. A non-zero exit is not an error here;
    /// callers decide with [`ProcessOutput::check`].
    fn run<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<ProcessOutput>>;
}

/// Runs real processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let program = invocation.program_name();
        debug!("Running {}", invocation);

        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(identity) = &invocation.identity {
            if let Some(uid) = identity.uid {
                command.uid(uid);
            }
            if let Some(gid) = identity.gid {
                command.gid(gid);
            }
            if let Some(dir) = &identity.working_dir {
                command.current_dir(dir);
            }
        }

        let output = command.output().await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::PermissionDenied {
                warn!(
                    "No permission to run {} as the configured user, are you running this as root?",
                    program
                );
            }
            BackupError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

        let result = ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.stdout.trim().is_empty() {
            debug!(program = %program, "\n{}", result.stdout);
        }
        if !result.stderr.trim().is_empty() {
            info!(program = %program, "\n{}", result.stderr);
        }
        debug!(program = %program, exit_code = ?result.exit_code, "Process finished");

        Ok(result)
    }
}

impl CommandRunner for SystemRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<ProcessOutput>> {
        Box::pin(self.execute(invocation))
    }
}
