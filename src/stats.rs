//! Per-table size and row-count statistics, captured at backup time and
//! compared after a restore.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use crate::error::{Error, Result, RowCountMismatch};
use crate::gcp::SqlAdmin;

const STATS_SQL: &str = "
SELECT
    t.schemaname || '.' || t.tablename AS full_table_name,
    pg_table_size(c.oid) AS table_size_bytes,
    pg_relation_size(c.oid) AS table_size_bytes_without_indexes,
    pg_total_relation_size(c.oid) AS total_size_bytes,
    c.reltuples::float8 AS row_count
FROM pg_catalog.pg_tables t
JOIN pg_catalog.pg_namespace n ON n.nspname = t.schemaname
JOIN pg_catalog.pg_class c ON c.relname = t.tablename AND c.relnamespace = n.oid
WHERE t.schemaname NOT IN ('pg_catalog', 'information_schema')
ORDER BY t.schemaname, t.tablename";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistic {
    pub full_table_name: String,
    pub table_size_bytes: i64,
    pub table_size_bytes_without_indexes: i64,
    pub total_size_bytes: i64,
    pub row_count: i64,
}

/// Statistics of one database keyed by qualified table name.
pub type TableStatistics = BTreeMap<String, TableStatistic>;

pub fn encode(stats: &TableStatistics) -> Result<Vec<u8>> {
    Ok(serde_yaml::to_string(stats)?.into_bytes())
}

pub fn decode(data: &[u8]) -> Result<TableStatistics> {
    Ok(serde_yaml::from_slice(data)?)
}

/// Checks every table of the backup against the restored database.
///
/// A table missing after restore fails immediately; row-count mismatches are
/// collected and reported together.
pub fn validate(backup: &TableStatistics, restored: &TableStatistics) -> Result<()> {
    let mut mismatches = Vec::new();
    for (table, expected) in backup {
        let Some(actual) = restored.get(table) else {
            error!(table = %table, "Stats not found");
            return Err(Error::MissingTableStatistic {
                table: table.clone(),
            });
        };
        if actual.row_count != expected.row_count {
            error!(table = %table, backup = expected.row_count, restored = actual.row_count, "Row count mismatch");
            mismatches.push(RowCountMismatch {
                table: table.clone(),
                expected: expected.row_count,
                actual: actual.row_count,
            });
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(mismatches))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[mockall::automock]
#[async_trait]
pub trait StatsCollector: Send + Sync {
    /// Refreshes planner statistics and reads them back for every user table.
    async fn collect(
        &self,
        instance: &str,
        database: &str,
        credentials: &DbCredentials,
    ) -> Result<TableStatistics>;
}

/// Collects statistics over a direct PostgreSQL connection.
pub struct PgStatsCollector {
    admin: Arc<dyn SqlAdmin>,
    project: String,
    host: Option<String>,
    port: u16,
}

impl PgStatsCollector {
    /// Without a `host`, the instance's primary IP address is looked up.
    pub fn new(admin: Arc<dyn SqlAdmin>, project: &str, host: Option<String>, port: u16) -> Self {
        Self {
            admin,
            project: project.to_string(),
            host,
            port,
        }
    }

    async fn resolve_host(&self, instance: &str) -> Result<String> {
        if let Some(host) = &self.host {
            return Ok(host.clone());
        }
        let found = self
            .admin
            .get_instance(&self.project, instance)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance.to_string()))?;
        found.primary_ip().map(str::to_string).ok_or_else(|| {
            Error::Config(format!(
                "instance {instance} has no primary IP address, set --db-host"
            ))
        })
    }
}

#[async_trait]
impl StatsCollector for PgStatsCollector {
    async fn collect(
        &self,
        instance: &str,
        database: &str,
        credentials: &DbCredentials,
    ) -> Result<TableStatistics> {
        let host = self.resolve_host(instance).await?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(&host)
            .port(self.port)
            .user(&credentials.user)
            .password(&credentials.password)
            .dbname(database);

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            error!(instance, database, error = %e, "Failed to connect to database");
            e
        })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Database connection closed with error");
            }
        });

        client.batch_execute("ANALYZE").await.map_err(|e| {
            error!(instance, database, error = %e, "Failed to execute analyze query");
            e
        })?;

        let rows = client.query(STATS_SQL, &[]).await?;
        let mut stats = TableStatistics::new();
        for row in rows {
            let stat = TableStatistic {
                full_table_name: row.try_get(0)?,
                table_size_bytes: row.try_get(1)?,
                table_size_bytes_without_indexes: row.try_get(2)?,
                total_size_bytes: row.try_get(3)?,
                row_count: estimated_rows(row.try_get(4)?),
            };
            stats.insert(stat.full_table_name.clone(), stat);
        }

        info!(instance, database, tables = stats.len(), "Collected table statistics");
        Ok(stats)
    }
}

/// `reltuples` is a float estimate and is -1 for tables never analyzed.
fn estimated_rows(reltuples: f64) -> i64 {
    reltuples.round().max(0.0) as i64
}
