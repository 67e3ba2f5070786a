//! Object paths of the artifacts written by a backup run.
//!
//! Every instance backup shares one timestamp token across its artifacts:
//!
//! ```text
//! gs://{bucket}/{instance}/cloudsql/{database}-{timestamp}.sql[.gz]
//! {instance}/cloudsql/users-{timestamp}.txt
//! {instance}/cloudsql/stats-{database}-{timestamp}.yaml
//! ```

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

const SCHEME: &str = "gs";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLocation {
    pub bucket: String,
    pub instance: String,
    /// Object prefix shared by all artifacts of the run, with a trailing `/`.
    pub path: String,
    pub timestamp: String,
    pub compression: bool,
}

impl BackupLocation {
    pub fn new(bucket: &str, instance: &str, timestamp: &str, compression: bool) -> Self {
        Self {
            bucket: bucket.to_string(),
            instance: instance.to_string(),
            path: format!("{instance}/cloudsql/"),
            timestamp: timestamp.to_string(),
            compression,
        }
    }

    pub fn database_location(&self, database: &str) -> String {
        let extension = if self.compression { "sql.gz" } else { "sql" };
        format!(
            "{SCHEME}://{}/{}{}-{}.{}",
            self.bucket, self.path, database, self.timestamp, extension
        )
    }

    pub fn user_location(&self) -> String {
        format!("{}users-{}.txt", self.path, self.timestamp)
    }

    pub fn stats_location(&self, database: &str) -> String {
        format!("{}stats-{}-{}.yaml", self.path, database, self.timestamp)
    }
}

/// Timestamp token shared by the artifacts of one backup run.
pub fn timestamp_token(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// A database dump reference taken apart into the run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub location: BackupLocation,
    pub database: String,
}

impl ArtifactLocation {
    /// Parses `scheme://bucket/instance/.../database-timestamp.sql[.gz]`.
    ///
    /// The database is everything before the last hyphen of the file name, so
    /// hyphenated database names survive; the timestamp runs up to the first dot.
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedLocation {
            location: uri.to_string(),
            reason: reason.to_string(),
        };

        let (_, rest) = uri
            .split_once("://")
            .ok_or_else(|| malformed("missing scheme"))?;
        let segments: Vec<&str> = rest.split('/').collect();
        let [bucket, instance, .., file] = segments.as_slice() else {
            return Err(malformed("expected bucket, instance and file segments"));
        };
        if bucket.is_empty() || instance.is_empty() {
            return Err(malformed("empty bucket or instance segment"));
        }

        let directories = &segments[1..segments.len() - 1];
        if directories.iter().any(|segment| segment.is_empty()) {
            return Err(malformed("empty path segment"));
        }
        let path = format!("{}/", directories.join("/"));

        let (database, tail) = file
            .rsplit_once('-')
            .ok_or_else(|| malformed("file name has no `database-timestamp` form"))?;
        let (timestamp, extension) = tail
            .split_once('.')
            .ok_or_else(|| malformed("file name has no extension"))?;
        if database.is_empty() || timestamp.is_empty() {
            return Err(malformed("empty database or timestamp"));
        }
        let compression = match extension {
            "sql" => false,
            "sql.gz" => true,
            _ => return Err(malformed("extension is neither `sql` nor `sql.gz`")),
        };

        Ok(Self {
            location: BackupLocation {
                bucket: bucket.to_string(),
                instance: instance.to_string(),
                path,
                timestamp: timestamp.to_string(),
                compression,
            },
            database: database.to_string(),
        })
    }

    pub fn user_location(&self) -> String {
        self.location.user_location()
    }

    pub fn stats_location(&self) -> String {
        self.location.stats_location(&self.database)
    }
}
