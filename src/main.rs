use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::Instant;
use tracing::{error, warn};

use sql_snap_crab::app::{App, Services};
use sql_snap_crab::config::{Cli, Job};
use sql_snap_crab::gcp::GcpClient;
use sql_snap_crab::stats::PgStatsCollector;
use sql_snap_crab::{logging, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let job = cli.job()?;
    let deadline = cli.deadline(Instant::now())?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, abandoning running operations");
            trigger.trigger();
        }
    });

    let client = Arc::new(GcpClient::new());
    let stats = Arc::new(PgStatsCollector::new(
        client.clone(),
        job.project(),
        cli.db_host.clone(),
        cli.db_port,
    ));
    let app = App::new(Services::gcp(client, stats), shutdown)
        .with_deadline(deadline);

    match job {
        Job::Backup(opts) => {
            let locations = app.backup(&opts).await.inspect_err(|e| {
                error!(error = %e, "Backup failed");
            })?;
            for location in locations {
                println!("{location}");
            }
        }
        Job::Restore(opts) => {
            let credential = app.restore(&opts).await.inspect_err(|e| {
                error!(error = %e, "Restore failed");
            })?;
            println!("instance: {}", credential.instance);
            println!("user: {}", credential.user);
            match &credential.secret {
                Some(secret) => println!("password secret: {secret}"),
                None => println!("password: {}", credential.password),
            }
        }
    }

    Ok(())
}
