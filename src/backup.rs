use chrono::Utc;
use tracing::{error, info};

use crate::app::App;
use crate::config::{BackupOptions, IamBindings};
use crate::enumerate::{enumerate, is_system_name};
use crate::error::Result;
use crate::iam::EXPORT_ROLES;
use crate::location::{timestamp_token, BackupLocation};
use crate::stats::{self, DbCredentials};
use crate::types::ExportContext;

/// Exports every enumerated instance in turn and returns the database dump locations.
///
/// The first failing instance stops the run; artifacts already written stay in place.
pub async fn run(app: &App, opts: &BackupOptions) -> Result<Vec<String>> {
    let instances = enumerate(
        app.services.admin.as_ref(),
        &opts.project,
        opts.instance.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Error reading Cloud SQL instances");
        e
    })?;

    let mut backup_paths = Vec::new();
    for (instance, databases) in &instances {
        info!(instance = %instance, "Exporting backup for instance");
        let locations = backup_instance(app, opts, instance.as_str(), databases)
            .await
            .map_err(|e| {
                error!(instance = %instance, error = %e, "Backup of instance failed");
                e
            })?;
        backup_paths.extend(locations);
    }

    info!(backups = ?backup_paths, "Backup complete");
    Ok(backup_paths)
}

async fn backup_instance(
    app: &App,
    opts: &BackupOptions,
    instance: &str,
    databases: &[String],
) -> Result<Vec<String>> {
    let export = export_instance(app, opts, instance, databases);
    if opts.iam_bindings == IamBindings::None {
        return export.await;
    }

    let member = app.instance_member(&opts.project, instance).await?;
    let grantor = app.grantor();
    if opts.iam_bindings == IamBindings::Temporary {
        return grantor
            .temporary(&opts.bucket, &member, &EXPORT_ROLES, &EXPORT_ROLES)
            .run(export)
            .await;
    }
    grantor.grant_all(&opts.bucket, &EXPORT_ROLES, &member).await?;
    export.await
}

async fn export_instance(
    app: &App,
    opts: &BackupOptions,
    instance: &str,
    databases: &[String],
) -> Result<Vec<String>> {
    let location = BackupLocation::new(
        &opts.bucket,
        instance,
        &timestamp_token(Utc::now()),
        opts.compression,
    );

    let users = export_users(app, opts, &location).await?;
    info!(instance, users = ?users, "Exported Cloud SQL users");

    if let Some(credentials) = &opts.stats {
        export_statistics(app, &location, databases, credentials).await?;
    }

    export_databases(app, opts, &location, databases).await
}

/// Writes the non-system user names of the instance, one per line.
async fn export_users(
    app: &App,
    opts: &BackupOptions,
    location: &BackupLocation,
) -> Result<Vec<String>> {
    let target = location.user_location();
    info!(instance = %location.instance, location = %target, "Exporting users for instance");

    let users: Vec<String> = app
        .services
        .admin
        .list_users(&opts.project, &location.instance)
        .await?
        .into_iter()
        .map(|u| u.name)
        .filter(|name| !is_system_name(name))
        .collect();

    let contents: String = users.iter().map(|name| format!("{name}\n")).collect();
    app.services
        .blobs
        .write_object(&location.bucket, &target, contents.into_bytes())
        .await?;
    Ok(users)
}

async fn export_statistics(
    app: &App,
    location: &BackupLocation,
    databases: &[String],
    credentials: &DbCredentials,
) -> Result<()> {
    for database in databases {
        let collected = app
            .services
            .stats
            .collect(&location.instance, database, credentials)
            .await?;

        let target = location.stats_location(database);
        info!(instance = %location.instance, database = %database, location = %target, "Exporting statistics for database");
        app.services
            .blobs
            .write_object(&location.bucket, &target, stats::encode(&collected)?)
            .await?;
    }
    Ok(())
}

async fn export_databases(
    app: &App,
    opts: &BackupOptions,
    location: &BackupLocation,
    databases: &[String],
) -> Result<Vec<String>> {
    let waiter = app.waiter(&opts.project);
    let mut locations = Vec::with_capacity(databases.len());

    for database in databases {
        let uri = location.database_location(database);
        info!(database = %database, instance = %location.instance, location = %uri, "Exporting database for instance");

        let operation = app
            .services
            .admin
            .export(
                &opts.project,
                &location.instance,
                &ExportContext::sql(database, &uri),
            )
            .await?;
        waiter.wait(&operation).await?;
        locations.push(uri);
    }
    Ok(locations)
}
