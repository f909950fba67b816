//! Error types for pgwarden
//!
//! Every fallible operation in the workspace returns [`WardenResult`]. The
//! variants are grouped by the component that raises them so callers can
//! decide which failures are worth retrying (see [`WardenError::is_retryable`]).

use std::path::PathBuf;

/// Result alias used throughout pgwarden.
pub type WardenResult<T> = Result<T, WardenError>;

/// Errors raised by the pool, the migration runner, the schema repairer and
/// the backup coordinator.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // ------------------------------------------------------------------
    // Connection pool
    // ------------------------------------------------------------------
    /// No connection became available within the acquire timeout, or the
    /// database is currently unreachable.
    #[error("timed out after {waited_ms}ms waiting for a database connection")]
    ConnectionTimeout { waited_ms: u64 },

    /// An established session failed mid-operation.
    #[error("database connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The pool has begun (or finished) shutting down.
    #[error("connection pool is shut down")]
    PoolClosed,

    /// The server rejected a statement.
    #[error("query failed: {message}")]
    Query {
        /// SQLSTATE code when the server reported one.
        code: Option<String>,
        message: String,
    },

    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------
    #[error("migration {id} ({name}) failed: {reason}")]
    MigrationFailed {
        id: String,
        name: String,
        reason: String,
    },

    #[error("unknown migration id '{id}'")]
    UnknownMigration { id: String },

    #[error("migration {id} has not been applied")]
    MigrationNotApplied { id: String },

    #[error("migration {id} cannot be rolled back: {reason}")]
    RollbackUnsupported { id: String, reason: String },

    #[error("invalid migration definition: {0}")]
    InvalidMigration(String),

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------
    /// Live schema differs from the manifest. Reported, never fatal.
    #[error(
        "schema drift detected: {missing_tables} missing table(s), {missing_columns} missing column(s)"
    )]
    SchemaDrift {
        missing_tables: usize,
        missing_columns: usize,
    },

    #[error("invalid schema manifest: {0}")]
    InvalidManifest(String),

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------
    #[error("backup '{name}' not found")]
    BackupNotFound { name: String },

    #[error("backup '{name}' already exists")]
    BackupExists { name: String },

    #[error("invalid backup name '{name}': {reason}")]
    InvalidBackupName { name: String, reason: String },

    #[error("backup I/O error on {}: {source}", .path.display())]
    BackupIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external executable (`pg_dump`, `psql`) failed. `stderr` is kept
    /// verbatim for diagnosis.
    #[error("`{program}` {}: {stderr}", exit_description(.exit_code))]
    ExternalProcess {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    // ------------------------------------------------------------------
    // Ambient
    // ------------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "did not exit normally".to_string(),
    }
}

impl WardenError {
    /// Construct a [`WardenError::BackupIo`] for `path`.
    pub fn backup_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::BackupIo {
            path: path.into(),
            source,
        }
    }

    /// Transient pool-level failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::ConnectionLost { .. }
        )
    }

    /// Whether the error means the underlying session can no longer be used.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// SQLSTATE code for [`WardenError::Query`] errors.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required environment variable '{key}' is not set")]
    MissingEnvVar { key: String },

    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
