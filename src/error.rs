use std::fmt;

/// Errors surfaced by the backup and restore orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed artifact location `{location}`: {reason}")]
    MalformedLocation { location: String, reason: String },

    #[error("Cloud SQL instance {0} not found")]
    InstanceNotFound(String),

    #[error("no stored root credential found in secret {secret}")]
    MissingCredential { secret: String },

    #[error("got no operation handle to wait for")]
    MissingOperation,

    #[error("operation {operation} failed: {}", .messages.join("; "))]
    OperationFailed {
        operation: String,
        messages: Vec<String>,
    },

    #[error("timed out waiting for operation {operation}")]
    TimedOut { operation: String },

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("statistics artifact could not be encoded or decoded: {0}")]
    Statistics(#[from] serde_yaml::Error),

    #[error("table {table} from the backup statistics is missing after restore")]
    MissingTableStatistic { table: String },

    #[error("restored data failed validation: {}", join_mismatches(.0))]
    Validation(Vec<RowCountMismatch>),

    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A table whose restored row count differs from the one captured at backup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCountMismatch {
    pub table: String,
    pub expected: i64,
    pub actual: i64,
}

impl fmt::Display for RowCountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row count mismatch for {}: expected {}, got {}",
            self.table, self.expected, self.actual
        )
    }
}

fn join_mismatches(mismatches: &[RowCountMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_mismatch() {
        let err = Error::Validation(vec![
            RowCountMismatch {
                table: "public.orders".to_string(),
                expected: 100,
                actual: 99,
            },
            RowCountMismatch {
                table: "public.items".to_string(),
                expected: 5,
                actual: 0,
            },
        ]);

        assert_eq!(
            err.to_string(),
            "restored data failed validation: row count mismatch for public.orders: expected 100, got 99; \
             row count mismatch for public.items: expected 5, got 0"
        );
    }

    #[test]
    fn operation_failure_carries_all_messages() {
        let err = Error::OperationFailed {
            operation: "op-1".to_string(),
            messages: vec!["disk full".to_string(), "quota".to_string()],
        };
        assert_eq!(err.to_string(), "operation op-1 failed: disk full; quota");
    }
}
