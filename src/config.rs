use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::location::ArtifactLocation;
use crate::stats::DbCredentials;

#[derive(Parser, Debug)]
#[command(name = "sql-snap-crab", version)]
#[command(about = "Export Cloud SQL databases to a Cloud Storage bucket and restore them into a fresh instance")]
pub struct Cli {
    /// Cloud Storage bucket the backup artifacts are written to or read from
    #[arg(short, long, global = true)]
    pub bucket: Option<String>,

    /// GCP project that contains the Cloud SQL instances
    #[arg(short, long, global = true)]
    pub project: Option<String>,

    /// Cloud SQL instance; backup enumerates every instance of the project when omitted
    #[arg(short, long, global = true)]
    pub instance: Option<String>,

    /// Database user for statistics (backup) or the import (restore)
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Give up waiting for remote operations after this long, e.g. `2h` or `45m`
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Host for statistics connections, normally a local Cloud SQL Auth Proxy.
    /// Defaults to the instance's primary IP, which is reached without TLS
    #[arg(long, global = true)]
    pub db_host: Option<String>,

    #[arg(long, global = true, default_value_t = 5432)]
    pub db_port: u16,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Export data from Cloud SQL instances to the bucket
    Backup(BackupArgs),
    /// Import an exported database into a restore instance and validate it
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Export table statistics to validate restored data integrity (needs --user and --password)
    #[arg(long)]
    pub stats: bool,

    /// Password of --user, used to read table statistics
    #[arg(long, env = "CLOUDSQL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// gzip the exported SQL files
    #[arg(long)]
    pub compression: bool,

    /// Grant the instance service account write access to the bucket
    #[arg(long)]
    pub ensure_iam_bindings: bool,

    /// Like --ensure-iam-bindings, but remove the grants once the instance is exported
    #[arg(long)]
    pub ensure_iam_bindings_temp: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Exported database file, e.g. gs://bucket/instance/cloudsql/db-20240404T152957.sql.gz
    #[arg(long)]
    pub file: String,

    /// Store the generated root password in Secret Manager
    #[arg(long)]
    pub store_secret: bool,

    /// Delete the restore instance once the restore has been validated
    #[arg(long)]
    pub cleanup: bool,

    #[arg(long, default_value = "europe-west3")]
    pub region: String,

    #[arg(long, default_value = "db-f1-micro")]
    pub tier: String,

    #[arg(long, default_value = "POSTGRES_13")]
    pub database_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IamBindings {
    None,
    /// Grants are added and left in place.
    Ensure,
    /// Grants are removed again after each instance.
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub bucket: String,
    pub project: String,
    pub instance: Option<String>,
    pub compression: bool,
    pub iam_bindings: IamBindings,
    /// Set when table statistics should be exported.
    pub stats: Option<DbCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Bucket holding the dump and its sibling artifacts; must match the bucket of `file`.
    pub bucket: String,
    pub project: String,
    /// Source instance; taken from the file path when not given.
    pub instance: String,
    pub file: String,
    pub user: Option<String>,
    pub store_secret: bool,
    pub cleanup: bool,
    pub region: String,
    pub tier: String,
    pub database_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Backup(BackupOptions),
    Restore(RestoreOptions),
}

impl Job {
    pub fn project(&self) -> &str {
        match self {
            Job::Backup(opts) => &opts.project,
            Job::Restore(opts) => &opts.project,
        }
    }
}

impl Cli {
    /// Instant at which every remote wait gives up, counted from `now`.
    pub fn deadline(&self, now: Instant) -> Result<Option<Instant>> {
        self.timeout
            .map(|timeout| {
                now.checked_add(timeout).ok_or_else(|| {
                    Error::Config(format!(
                        "--timeout {} is too large",
                        humantime::format_duration(timeout)
                    ))
                })
            })
            .transpose()
    }

    /// Validates the arguments into the options of one run, before any remote call.
    pub fn job(&self) -> Result<Job> {
        let project = required(&self.project, "--project")?;
        match &self.command {
            Command::Backup(args) => {
                let bucket = required(&self.bucket, "--bucket")?;
                let stats = if args.stats {
                    let user = required(&self.user, "--user (needed by --stats)")?;
                    let password = required(&args.password, "--password (needed by --stats)")?;
                    Some(DbCredentials { user, password })
                } else {
                    None
                };
                let iam_bindings = if args.ensure_iam_bindings_temp {
                    IamBindings::Temporary
                } else if args.ensure_iam_bindings {
                    IamBindings::Ensure
                } else {
                    IamBindings::None
                };
                Ok(Job::Backup(BackupOptions {
                    bucket,
                    project,
                    instance: self.instance.clone().filter(|i| !i.is_empty()),
                    compression: args.compression,
                    iam_bindings,
                    stats,
                }))
            }
            Command::Restore(args) => {
                let artifact = ArtifactLocation::parse(&args.file)?;
                let bucket = match &self.bucket {
                    Some(bucket) if *bucket != artifact.location.bucket => {
                        return Err(Error::Config(format!(
                            "--bucket {} does not match the bucket of {}",
                            bucket, args.file
                        )));
                    }
                    _ => artifact.location.bucket.clone(),
                };
                let instance = self
                    .instance
                    .clone()
                    .filter(|i| !i.is_empty())
                    .unwrap_or_else(|| artifact.location.instance.clone());
                Ok(Job::Restore(RestoreOptions {
                    bucket,
                    project,
                    instance,
                    file: args.file.clone(),
                    user: self.user.clone(),
                    store_secret: args.store_secret,
                    cleanup: args.cleanup,
                    region: args.region.clone(),
                    tier: args.tier.clone(),
                    database_version: args.database_version.clone(),
                }))
            }
        }
    }
}

fn required(value: &Option<String>, flag: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("missing required option {flag}")))
}
