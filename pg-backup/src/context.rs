//! Shared state for one invocation: configuration, the subprocess runner and the
//! identity WAL-E runs under.

use std::sync::Arc;

use crate::backup::StorageLayout;
use crate::config::Config;
use crate::tools::process::{CommandRunner, ToolIdentity};
use crate::tools::{service::Service, storage::Storage, wale::Wale};

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub runner: Arc<dyn CommandRunner>,
    pub identity: ToolIdentity,
}

impl Context {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, identity: ToolIdentity) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            identity,
        }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.config.wale.gs_prefix)
    }

    pub fn wale(&self) -> Wale<'_> {
        Wale::new(self)
    }

    pub fn storage(&self) -> Storage<'_> {
        Storage::new(self)
    }

    pub fn service(&self) -> Service<'_> {
        Service::new(self)
    }
}

#[cfg(test)]
impl Context {
    /// Defaults pointed at `gs://bucket/` and host `test-host`.
    pub(crate) fn for_tests(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(Self::test_config(), runner, ToolIdentity::default())
    }

    pub(crate) fn test_config() -> Config {
        let mut config = Config::default();
        config.wale.gs_prefix = "gs://bucket/".to_string();
        config.wale.host = "test-host".to_string();
        config.wale.working_dir = None;
        config.service.log_dir = None;
        config
    }
}
