//! gsutil invocations for listing, sizing and copying remote objects.

use tracing::{debug, info};

use crate::context::Context;
use crate::tools::process::Invocation;
use crate::utils::Result;

pub struct Storage<'a> {
    ctx: &'a Context,
}

impl<'a> Storage<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn gsutil(&self) -> Invocation {
        Invocation::new(&self.ctx.config.storage.gsutil).arg("-m")
    }

    async fn stdout(&self, invocation: Invocation) -> Result<String> {
        let output = self.ctx.runner.run(&invocation).await?.check("gsutil")?;
        Ok(output.stdout)
    }

    /// `TOTAL` summary lines of a long listing of everything stored for `host`.
    pub async fn total_size(&self, host: &str) -> Result<String> {
        let pattern = format!("{}/**", self.ctx.layout().host_prefix(host));
        let listing = self
            .stdout(self.gsutil().args(["ls", "-l"]).arg(pattern))
            .await?;
        let totals: Vec<&str> = listing.lines().filter(|l| l.contains("TOTAL")).collect();
        Ok(totals.join("\n"))
    }

    /// Every object matching `<prefix>**`, one path per entry.
    pub async fn list_recursive(&self, prefix: &str) -> Result<Vec<String>> {
        let listing = self
            .stdout(self.gsutil().args(["ls", "-r"]).arg(format!("{prefix}**")))
            .await?;
        let objects: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with(':'))
            .map(str::to_string)
            .collect();
        debug!(prefix = %prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    pub async fn copy(&self, src: &str, dest: &str) -> Result<()> {
        self.stdout(self.gsutil().arg("cp").arg(src).arg(dest)).await?;
        info!("Copied {} to {}", src, dest);
        Ok(())
    }
}
