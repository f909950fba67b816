//! Mapping from `tokio_postgres` errors onto [`WardenError`]

use std::error::Error as _;

use pgwarden_core::WardenError;
use tokio_postgres::Error as PgError;

/// SQLSTATE for `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";

/// Classify a driver error.
///
/// Server-reported errors become [`WardenError::Query`] carrying the
/// SQLSTATE. Closed sessions and socket failures mean the session is gone and
/// become [`WardenError::ConnectionLost`]. Anything else (type conversion,
/// protocol misuse) is a `Query` error without a code.
pub fn pg_error(error: PgError) -> WardenError {
    if let Some(db) = error.as_db_error() {
        return WardenError::Query {
            code: Some(db.code().code().to_string()),
            message: db.message().to_string(),
        };
    }

    let io_failure = error
        .source()
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if error.is_closed() || io_failure {
        return WardenError::ConnectionLost {
            reason: error.to_string(),
        };
    }

    WardenError::Query {
        code: None,
        message: error.to_string(),
    }
}
