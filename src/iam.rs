use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::Result;
use crate::gcp::BucketIam;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ObjectCreator,
    ObjectViewer,
    LegacyBucketReader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ObjectCreator => "roles/storage.objectCreator",
            Role::ObjectViewer => "roles/storage.objectViewer",
            Role::LegacyBucketReader => "roles/storage.legacyBucketReader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles the instance service account needs to write a backup into the bucket.
pub const EXPORT_ROLES: [Role; 2] = [Role::ObjectCreator, Role::ObjectViewer];
/// Roles a restore instance needs to read a dump from the bucket.
pub const IMPORT_ROLES: [Role; 2] = [Role::LegacyBucketReader, Role::ObjectViewer];
/// The object viewer grant outlives a restore; only the bucket reader is taken back.
pub const IMPORT_REVOKED_ROLES: [Role; 1] = [Role::LegacyBucketReader];

pub fn service_account_member(email: &str) -> String {
    format!("serviceAccount:{email}")
}

/// Adds and removes role bindings on a bucket policy.
///
/// Each call is one unguarded read-modify-write, so two grantors working on the
/// same bucket at once can overwrite each other.
#[derive(Clone)]
pub struct PermissionGrantor {
    iam: Arc<dyn BucketIam>,
}

impl PermissionGrantor {
    pub fn new(iam: Arc<dyn BucketIam>) -> Self {
        Self { iam }
    }

    pub async fn grant(&self, bucket: &str, role: Role, member: &str) -> Result<()> {
        info!(%role, bucket, member, "Ensuring role binding on bucket");
        let mut policy = self.iam.get_bucket_policy(bucket).await?;
        if policy.has_role(member, role.as_str()) {
            return Ok(());
        }
        policy.add(member, role.as_str());
        self.iam.set_bucket_policy(bucket, &policy).await?;
        Ok(())
    }

    pub async fn revoke(&self, bucket: &str, role: Role, member: &str) -> Result<()> {
        info!(%role, bucket, member, "Removing role binding from bucket");
        let mut policy = self.iam.get_bucket_policy(bucket).await?;
        if !policy.has_role(member, role.as_str()) {
            return Ok(());
        }
        policy.remove(member, role.as_str());
        self.iam.set_bucket_policy(bucket, &policy).await?;
        Ok(())
    }

    pub async fn grant_all(&self, bucket: &str, roles: &[Role], member: &str) -> Result<()> {
        for role in roles {
            self.grant(bucket, *role, member).await?;
        }
        Ok(())
    }

    /// Grants `grant`, then takes back `revoke` once the bracketed work ends.
    pub fn temporary<'a>(
        &'a self,
        bucket: &'a str,
        member: &'a str,
        grant: &'a [Role],
        revoke: &'a [Role],
    ) -> TemporaryGrant<'a> {
        TemporaryGrant {
            grantor: self,
            bucket,
            member,
            grant,
            revoke,
        }
    }
}

/// Role bindings held for the duration of one piece of work.
pub struct TemporaryGrant<'a> {
    grantor: &'a PermissionGrantor,
    bucket: &'a str,
    member: &'a str,
    grant: &'a [Role],
    revoke: &'a [Role],
}

impl TemporaryGrant<'_> {
    /// Runs `work` with the roles granted. The revoke set is released on every
    /// exit path, including a failed grant. An error from `work` takes
    /// precedence over an error from releasing.
    pub async fn run<T, F>(self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = match self
            .grantor
            .grant_all(self.bucket, self.grant, self.member)
            .await
        {
            Ok(()) => work.await,
            Err(err) => Err(err),
        };
        let released = self.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                error!(bucket = self.bucket, member = self.member, error = %release_err, "Failed to release temporary role bindings");
                Err(err)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let mut first_error = None;
        for role in self.revoke {
            if let Err(err) = self.grantor.revoke(self.bucket, *role, self.member).await {
                error!(%role, bucket = self.bucket, member = self.member, error = %err, "Failed to remove role binding");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
