use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{error, info};

use crate::app::App;
use crate::config::RestoreOptions;
use crate::error::{Error, Result};
use crate::iam::{IMPORT_REVOKED_ROLES, IMPORT_ROLES};
use crate::location::ArtifactLocation;
use crate::secret::{generate_password, load_password, store_password, PASSWORD_LENGTH};
use crate::stats::{self, DbCredentials};
use crate::types::{DatabaseFlag, ImportContext, InsightsConfig, InstanceSettings, NewInstance, User};

pub const RESTORE_PREFIX: &str = "restore-";
pub const ROOT_USER: &str = "postgres";

pub fn restore_instance_name(source: &str) -> String {
    format!("{RESTORE_PREFIX}{source}")
}

/// Root login of the restore instance.
#[derive(Clone, PartialEq, Eq)]
pub struct RootCredential {
    pub instance: String,
    pub user: String,
    pub password: String,
    /// Secret Manager resource holding the password, when it was persisted.
    pub secret: Option<String>,
}

impl RootCredential {
    fn db_credentials(&self) -> DbCredentials {
        DbCredentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCredential")
            .field("instance", &self.instance)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("secret", &self.secret)
            .finish()
    }
}

/// Restores `opts.file` into `restore-{instance}` and checks the row counts
/// against the statistics captured at backup time.
pub async fn run(app: &App, opts: &RestoreOptions) -> Result<RootCredential> {
    let artifact = ArtifactLocation::parse(&opts.file)?;
    if artifact.location.bucket != opts.bucket {
        return Err(Error::Config(format!(
            "bucket {} does not match the bucket of {}",
            opts.bucket, opts.file
        )));
    }
    let target = restore_instance_name(&opts.instance);

    info!(instance = %target, "Check if restore instance exists");
    let existing = app.services.admin.get_instance(&opts.project, &target).await?;
    let credential = match existing {
        None => create_instance(app, opts, &target).await?,
        Some(_) => {
            let (secret, password) =
                load_password(app.services.secrets.as_ref(), &opts.project, &target)
                    .await
                    .map_err(|e| {
                        error!(instance = %target, error = %e, "Failed to get secret version");
                        e
                    })?;
            RootCredential {
                instance: target.clone(),
                user: ROOT_USER.to_string(),
                password,
                secret: Some(secret),
            }
        }
    };

    let restored = restore_into(app, opts, &artifact, &credential).await;

    if opts.cleanup {
        let deleted = delete_instance(app, opts, &target).await;
        match (&restored, deleted) {
            (Ok(()), Err(e)) => return Err(e),
            (Err(_), Err(e)) => {
                error!(instance = %target, error = %e, "Failed to delete restore instance")
            }
            _ => {}
        }
    }

    restored.map(|()| credential)
}

async fn create_instance(app: &App, opts: &RestoreOptions, target: &str) -> Result<RootCredential> {
    let password = generate_password(PASSWORD_LENGTH);

    let secret = if opts.store_secret {
        Some(
            store_password(
                app.services.secrets.as_ref(),
                &opts.project,
                target,
                &opts.region,
                &password,
            )
            .await?,
        )
    } else {
        None
    };

    let instance = NewInstance {
        name: target.to_string(),
        instance_type: "CLOUD_SQL_INSTANCE".to_string(),
        region: opts.region.clone(),
        database_version: opts.database_version.clone(),
        root_password: password.clone(),
        settings: InstanceSettings {
            tier: opts.tier.clone(),
            activation_policy: "ALWAYS".to_string(),
            database_flags: vec![DatabaseFlag {
                name: "cloudsql.iam_authentication".to_string(),
                value: "on".to_string(),
            }],
            insights_config: InsightsConfig {
                query_insights_enabled: true,
            },
            user_labels: BTreeMap::from([
                ("service".to_string(), target.to_string()),
                ("kind".to_string(), "restore".to_string()),
            ]),
        },
    };

    info!(instance = %target, "Create PostgreSQL instance");
    let operation = app
        .services
        .admin
        .insert_instance(&opts.project, &instance)
        .await?;
    app.waiter(&opts.project).wait(&operation).await.map_err(|e| {
        error!(instance = %target, error = %e, "Failed to create PostgreSQL instance");
        e
    })?;
    info!(instance = %target, "Successfully created PostgreSQL instance");

    Ok(RootCredential {
        instance: target.to_string(),
        user: ROOT_USER.to_string(),
        password,
        secret,
    })
}

async fn restore_into(
    app: &App,
    opts: &RestoreOptions,
    artifact: &ArtifactLocation,
    credential: &RootCredential,
) -> Result<()> {
    let target = credential.instance.as_str();
    ensure_database(app, opts, target, &artifact.database).await?;
    restore_users(app, opts, artifact, target).await?;

    let member = app.instance_member(&opts.project, target).await?;
    app.grantor()
        .temporary(
            &opts.bucket,
            &member,
            &IMPORT_ROLES,
            &IMPORT_REVOKED_ROLES,
        )
        .run(import(app, opts, &artifact.database, target))
        .await?;

    validate(app, opts, artifact, credential).await
}

async fn ensure_database(app: &App, opts: &RestoreOptions, target: &str, database: &str) -> Result<()> {
    let admin = app.services.admin.as_ref();
    if admin.get_database(&opts.project, target, database).await?.is_some() {
        return Ok(());
    }

    let operation = admin.insert_database(&opts.project, target, database).await?;
    app.waiter(&opts.project)
        .every(app.intervals.provisioning)
        .wait(&operation)
        .await?;
    info!(instance = target, database, "Successfully created PostgreSQL instance database");
    Ok(())
}

/// Recreates the users listed in the backup that the target does not have yet.
async fn restore_users(
    app: &App,
    opts: &RestoreOptions,
    artifact: &ArtifactLocation,
    target: &str,
) -> Result<()> {
    let location = artifact.user_location();
    let data = app
        .services
        .blobs
        .read_object(&opts.bucket, &location)
        .await
        .map_err(|e| {
            error!(location = %location, error = %e, "Failed to read user list");
            e
        })?;
    let listed = String::from_utf8_lossy(&data);

    let admin = app.services.admin.as_ref();
    let existing: HashSet<String> = admin
        .list_users(&opts.project, target)
        .await?
        .into_iter()
        .map(|u| u.name)
        .collect();
    let waiter = app.waiter(&opts.project).every(app.intervals.provisioning);

    for name in listed.lines().map(str::trim).filter(|n| !n.is_empty()) {
        if existing.contains(name) {
            continue;
        }
        let user = User {
            name: name.to_string(),
            password: Some(generate_password(PASSWORD_LENGTH)),
        };
        let operation = admin.insert_user(&opts.project, target, &user).await?;
        waiter.wait(&operation).await.map_err(|e| {
            error!(instance = target, user = name, error = %e, "Failed to create PostgreSQL user");
            e
        })?;
        info!(instance = target, user = name, "Successfully created PostgreSQL user");
    }
    Ok(())
}

async fn import(app: &App, opts: &RestoreOptions, database: &str, target: &str) -> Result<()> {
    info!(instance = target, file = %opts.file, "Import data");
    let context = ImportContext::sql(database, &opts.file, opts.user.as_deref());
    let operation = app
        .services
        .admin
        .import(&opts.project, target, &context)
        .await?;
    app.waiter(&opts.project).wait(&operation).await.map_err(|e| {
        error!(file = %opts.file, error = %e, "Failed to import data");
        e
    })?;
    info!(instance = target, file = %opts.file, "Data imported successfully");
    Ok(())
}

/// Compares live statistics with the backup's; skipped when the backup has none.
async fn validate(
    app: &App,
    opts: &RestoreOptions,
    artifact: &ArtifactLocation,
    credential: &RootCredential,
) -> Result<()> {
    let location = artifact.stats_location();
    let bucket = &opts.bucket;
    if !app.services.blobs.object_exists(bucket, &location).await? {
        info!(location = %location, "Stats file not found, skipping validation");
        return Ok(());
    }

    let live = app
        .services
        .stats
        .collect(
            &credential.instance,
            &artifact.database,
            &credential.db_credentials(),
        )
        .await?;
    let backup = stats::decode(&app.services.blobs.read_object(bucket, &location).await?)?;
    stats::validate(&backup, &live)?;
    info!(instance = %credential.instance, tables = backup.len(), "Restored row counts match the backup");
    Ok(())
}

async fn delete_instance(app: &App, opts: &RestoreOptions, target: &str) -> Result<()> {
    info!(instance = target, "Deleting restore instance");
    let operation = app
        .services
        .admin
        .delete_instance(&opts.project, target)
        .await?;
    app.waiter(&opts.project)
        .every(app.intervals.provisioning)
        .wait(&operation)
        .await
}
