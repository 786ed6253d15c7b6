//! Mirror the newest PostgreSQL log into our own log while recovery runs.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Background task following one log file. Stopped by [`LogFollower::stop`], or
/// cancelled when dropped.
pub struct LogFollower {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl LogFollower {
    /// Start following the newest file in `dir`. `None` when there is nothing to follow.
    pub fn start(dir: &Path) -> Option<Self> {
        let path = match newest_log(dir) {
            Ok(Some(path)) => path,
            Ok(None) => {
                debug!("No PostgreSQL log in {}", dir.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot read PostgreSQL log dir {}: {}", dir.display(), e);
                return None;
            }
        };

        info!("Following PostgreSQL log {}", path.display());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(follow(path.clone(), cancel.clone()));
        Some(Self {
            cancel,
            handle: Some(handle),
            path,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop following and wait for the task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Log follower task failed: {}", e);
            }
        }
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Newest log by file name. PostgreSQL names its logs by timestamp.
pub fn newest_log(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if newest.as_ref().map_or(true, |n| path.file_name() > n.file_name()) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

async fn follow(path: PathBuf, cancel: CancellationToken) {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open {}: {}", path.display(), e);
            return;
        }
    };
    if let Err(e) = file.seek(SeekFrom::End(0)).await {
        warn!("Cannot seek {}: {}", path.display(), e);
        return;
    }

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
                }
            }
            Ok(_) => info!(target: "postgres", "POSTGRESQL LOG {}", line.trim_end()),
            Err(e) => {
                warn!("Stopped following {}: {}", path.display(), e);
                break;
            }
        }
    }
    debug!("Stopped following {}", path.display());
}
