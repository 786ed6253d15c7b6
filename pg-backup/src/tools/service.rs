//! Database service control and data directory ownership.

use std::path::Path;

use tracing::info;

use crate::context::Context;
use crate::tools::process::Invocation;
use crate::utils::Result;

pub struct Service<'a> {
    ctx: &'a Context,
}

impl<'a> Service<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    async fn run(&self, invocation: Invocation) -> Result<String> {
        let name = invocation.program_name();
        let output = self.ctx.runner.run(&invocation).await?.check(&name)?;
        Ok(format!("{}{}", output.stdout, output.stderr).trim().to_string())
    }

    pub async fn stop(&self) -> Result<()> {
        let out = self.run(Invocation::from_argv(&self.ctx.config.service.stop)?).await?;
        info!("PostgreSQL service stopped {}", out);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let out = self.run(Invocation::from_argv(&self.ctx.config.service.start)?).await?;
        info!("PostgreSQL service started {}", out);
        Ok(())
    }

    /// `chown -R <user>:<user> <dir>`
    pub async fn chown(&self, dir: &Path) -> Result<()> {
        let user = &self.ctx.config.wale.user;
        self.run(
            Invocation::new("chown")
                .arg("-R")
                .arg(format!("{user}:{user}"))
                .arg(dir),
        )
        .await?;
        info!("Changed owner of {} to {}", dir.display(), user);
        Ok(())
    }
}
