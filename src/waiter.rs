use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gcp::SqlAdmin;
use crate::shutdown::Shutdown;
use crate::types::Operation;

/// Poll intervals for the different kinds of Cloud SQL operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// Exports, imports and instance creation.
    pub transfer: Duration,
    /// Database and user creation, instance deletion.
    pub provisioning: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            transfer: Duration::from_secs(60),
            provisioning: Duration::from_secs(10),
        }
    }
}

/// Polls a Cloud SQL operation at a fixed interval until it is `DONE`.
///
/// The wait ends early with [`Error::TimedOut`] when the run deadline passes or
/// the shutdown signal fires, whichever comes first.
#[derive(Clone)]
pub struct OperationWaiter {
    admin: Arc<dyn SqlAdmin>,
    project: String,
    interval: Duration,
    deadline: Option<Instant>,
    shutdown: Shutdown,
}

impl OperationWaiter {
    pub fn new(
        admin: Arc<dyn SqlAdmin>,
        project: &str,
        interval: Duration,
        deadline: Option<Instant>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            admin,
            project: project.to_string(),
            interval,
            deadline,
            shutdown,
        }
    }

    /// Same waiter, polling at a different interval.
    pub fn every(&self, interval: Duration) -> Self {
        Self {
            interval,
            ..self.clone()
        }
    }

    pub async fn wait(&self, operation: &Operation) -> Result<()> {
        if operation.name.is_empty() {
            return Err(Error::MissingOperation);
        }
        let name = operation.name.as_str();
        debug!(operation = name, interval = ?self.interval, "Waiting for operation");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => {
                    warn!(operation = name, "Shutdown requested, giving up on operation");
                    return Err(Error::TimedOut { operation: name.to_string() });
                }
                _ = until(self.deadline) => {
                    warn!(operation = name, "Deadline reached while waiting for operation");
                    return Err(Error::TimedOut { operation: name.to_string() });
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let current = self.admin.get_operation(&self.project, name).await?;
            if current.is_done() {
                let messages = current.error_messages();
                if messages.is_empty() {
                    debug!(operation = name, "Operation done");
                    return Ok(());
                }
                return Err(Error::OperationFailed {
                    operation: name.to_string(),
                    messages,
                });
            }
            debug!(operation = name, status = %current.status, "Operation still running");
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
