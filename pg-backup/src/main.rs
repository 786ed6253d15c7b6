//! pg-backup - Main entry point
//!
//! Backup, retention, weekly copies and restores for a PostgreSQL instance.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use pg_backup::backup::branch_copy::copy_to_branch;
use pg_backup::backup::catalog::{list_backups, render_listing};
use pg_backup::backup::retention::resolve_weekday;
use pg_backup::backup::{delete_backups, push_backup, total_size, Branch};
use pg_backup::restore::{restore, restore_from_date, RestoreRequest};
use pg_backup::tools::process::{SystemRunner, ToolIdentity};
use pg_backup::utils::logger::{self, LogSettings};
use pg_backup::{cron, daemon, notify, Config, Context};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Mirror log output to the console
    #[arg(long, global = true)]
    log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push a base backup of the data directory to the daily branch
    Backup,

    /// List the backups of a branch
    List {
        #[arg(short, long, value_enum, default_value_t = Branch::Daily)]
        branch: Branch,

        /// Host whose backups to list (defaults to this host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Include size and WAL columns
        #[arg(long)]
        detail: bool,
    },

    /// Delete all but the newest backups of a branch
    Delete {
        #[arg(short, long, value_enum, default_value_t = Branch::Daily)]
        branch: Branch,

        /// Number of backups to keep; 0 deletes everything
        #[arg(short, long, default_value_t = 12)]
        retain: usize,
    },

    /// Replace the data directory with a base backup and replay WAL
    Restore {
        #[arg(short, long, value_enum, default_value_t = Branch::Daily)]
        branch: Branch,

        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Base backup name, or LATEST
        #[arg(long, default_value = "LATEST")]
        base: String,

        /// Move an existing data directory aside
        #[arg(short, long)]
        force: bool,

        /// Recovery target, YYYY-MM-DD[_HH[-mm[-ss]]] local time (default now)
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Restore to the latest backup taken at or before a date
    RestoreDate {
        /// YYYY-MM-DD[_HH[-mm[-ss]]] local time (default now)
        #[arg(short, long)]
        date: Option<String>,

        #[arg(short = 'H', long)]
        host: Option<String>,
    },

    /// Copy a daily backup and its WAL into another branch
    Copy {
        /// Day of the current week, 0 = Sunday; negative values reach into last week
        #[arg(short = 'w', long, default_value_t = 6, allow_negative_numbers = true)]
        day: i64,

        /// Destination branch
        #[arg(short, long, value_enum, default_value_t = Branch::Weekly)]
        branch: Branch,
    },

    /// Total stored size of a host's backups
    Size {
        #[arg(short = 'H', long)]
        host: Option<String>,
    },

    /// Run the scheduled workflow once
    Cron,

    /// Run the scheduled workflow on the configured cron schedule
    Daemon,
}

impl Command {
    /// Everything except `size` drives WAL-E.
    fn needs_wale(&self) -> bool {
        !matches!(self, Command::Size { .. })
    }

    /// `cron` checks its tools inside the run so a missing tool still ends in a report.
    fn needs_preflight(&self) -> bool {
        self.needs_wale() && !matches!(self, Command::Cron)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let settings = LogSettings {
        level: args.log_level.clone().unwrap_or_else(|| config.log.level.clone()),
        console: args.log || config.log.console,
        dir: config.log.dir.clone(),
    };
    logger::init(&settings)?;

    tracing::info!(
        "Starting pg-backup v{} (host: {})",
        env!("CARGO_PKG_VERSION"),
        config.wale.host
    );

    if let Command::Cron = args.command {
        return run_cron_once(config).await;
    }

    let identity = if args.command.needs_wale() {
        ToolIdentity::resolve(&config.wale.user, config.wale.working_dir.clone())?
    } else {
        ToolIdentity::default()
    };
    let ctx = Context::new(config, Arc::new(SystemRunner::new()), identity);
    if args.command.needs_preflight() {
        ctx.wale().preflight().await?;
    }

    execute(&ctx, args.command).await
}

async fn run_cron_once(config: Config) -> Result<()> {
    let notifier = notify::from_config(&config.notify);
    let today = Local::now().date_naive();
    let report = cron::run_once(config, Arc::new(SystemRunner::new()), notifier.as_ref(), today).await;
    if !report.is_success() {
        bail!("{} cron step(s) failed", report.failures.len());
    }
    println!("CRON job done");
    Ok(())
}

async fn execute(ctx: &Context, command: Command) -> Result<()> {
    let this_host = ctx.config.wale.host.clone();

    match command {
        Command::Backup => {
            let name = push_backup(ctx).await?;
            println!("Backup: Backup done for host {}, new backup {}", this_host, name);
        }
        Command::List { branch, host, detail } => {
            let host = host.unwrap_or(this_host);
            let records = list_backups(ctx, branch, &host, detail).await?;
            println!("{}", render_listing(branch, &host, &records));
        }
        Command::Delete { branch, retain } => {
            println!("{}", delete_backups(ctx, branch, retain).await?);
        }
        Command::Restore { branch, host, base, force, date } => {
            let request = RestoreRequest {
                branch,
                host: host.unwrap_or(this_host),
                base_backup: base.parse()?,
                force,
                recovery_target_time: Some(parse_date_or_now(date.as_deref())?),
            };
            println!("{}", restore(ctx, &request).await?);
        }
        Command::RestoreDate { date, host } => {
            let target = parse_date_or_now(date.as_deref())?;
            let host = host.unwrap_or(this_host);
            println!("{}", restore_from_date(ctx, target, &host).await?);
        }
        Command::Copy { day, branch } => {
            let day = resolve_weekday(Local::now().date_naive(), day)?;
            let summary = copy_to_branch(ctx, day, &Local, Branch::Daily, branch).await?;
            println!("{}", summary);
        }
        Command::Size { host } => {
            let host = host.unwrap_or(this_host);
            println!("{}", total_size(ctx, &host).await?);
        }
        Command::Cron => run_cron_once((*ctx.config).clone()).await?,
        Command::Daemon => {
            let notifier = notify::from_config(&ctx.config.notify);
            daemon::run(ctx.clone(), notifier).await?;
        }
    }

    Ok(())
}

fn parse_date_or_now(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        Some(value) => parse_local_date(value),
        None => Ok(Utc::now()),
    }
}

/// `YYYY-MM-DD[_HH[-mm[-ss]]]` in the local time zone.
fn parse_local_date(value: &str) -> Result<DateTime<Utc>> {
    let (date, time) = match value.split_once('_') {
        Some((date, time)) => (date, Some(time)),
        None => (value, None),
    };
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("Invalid date {value:?}, expected YYYY-MM-DD[_HH[-mm[-ss]]]"))?;

    let mut parts = [0u32; 3];
    if let Some(time) = time {
        let fields: Vec<&str> = time.split('-').collect();
        if fields.len() > 3 {
            bail!("Invalid time in {value:?}, expected HH[-mm[-ss]]");
        }
        for (slot, field) in parts.iter_mut().zip(&fields) {
            *slot = field
                .parse()
                .with_context(|| format!("Invalid time in {value:?}, expected HH[-mm[-ss]]"))?;
        }
    }
    let time = NaiveTime::from_hms_opt(parts[0], parts[1], parts[2])
        .with_context(|| format!("Time out of range in {value:?}"))?;

    let local = Local
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
        .with_context(|| format!("{value:?} does not exist in the local time zone"))?;
    Ok(local.with_timezone(&Utc))
}
