use std::sync::Arc;

use tokio::time::Instant;

use crate::backup;
use crate::config::{BackupOptions, RestoreOptions};
use crate::error::{Error, Result};
use crate::gcp::{BlobStore, BucketIam, GcpClient, SecretStore, SqlAdmin};
use crate::iam::{service_account_member, PermissionGrantor};
use crate::restore::{self, RootCredential};
use crate::shutdown::Shutdown;
use crate::stats::StatsCollector;
use crate::waiter::{OperationWaiter, PollIntervals};

/// The remote collaborators backup and restore talk to.
#[derive(Clone)]
pub struct Services {
    pub admin: Arc<dyn SqlAdmin>,
    pub iam: Arc<dyn BucketIam>,
    pub blobs: Arc<dyn BlobStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub stats: Arc<dyn StatsCollector>,
}

impl Services {
    pub fn gcp(client: Arc<GcpClient>, stats: Arc<dyn StatsCollector>) -> Self {
        Self {
            admin: client.clone(),
            iam: client.clone(),
            blobs: client.clone(),
            secrets: client,
            stats,
        }
    }
}

pub struct App {
    pub services: Services,
    pub intervals: PollIntervals,
    deadline: Option<Instant>,
    shutdown: Shutdown,
}

impl App {
    pub fn new(services: Services, shutdown: Shutdown) -> Self {
        Self {
            services,
            intervals: PollIntervals::default(),
            deadline: None,
            shutdown,
        }
    }

    /// Every wait of the run gives up at `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_intervals(mut self, intervals: PollIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Waiter for exports, imports and instance creation.
    pub fn waiter(&self, project: &str) -> OperationWaiter {
        OperationWaiter::new(
            self.services.admin.clone(),
            project,
            self.intervals.transfer,
            self.deadline,
            self.shutdown.clone(),
        )
    }

    pub fn grantor(&self) -> PermissionGrantor {
        PermissionGrantor::new(self.services.iam.clone())
    }

    /// IAM member of the service account an instance runs exports and imports as.
    pub async fn instance_member(&self, project: &str, instance: &str) -> Result<String> {
        let found = self
            .services
            .admin
            .get_instance(project, instance)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance.to_string()))?;
        let email = found.service_account_email_address.ok_or_else(|| {
            Error::Remote(anyhow::anyhow!(
                "instance {} reports no service account",
                instance
            ))
        })?;
        Ok(service_account_member(&email))
    }

    pub async fn backup(&self, opts: &BackupOptions) -> Result<Vec<String>> {
        backup::run(self, opts).await
    }

    pub async fn restore(&self, opts: &RestoreOptions) -> Result<RootCredential> {
        restore::run(self, opts).await
    }
}
