//! Periodic drift monitor

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pgwarden_core::PeriodicTask;

use super::repairer::{RepairReport, SchemaMaintenance, ValidationResult};

/// Validate once and, if anything is missing, log each missing element and
/// repair. Returns the validation result and the repair report when a
/// repair ran.
pub async fn check_and_repair(
    maintenance: &dyn SchemaMaintenance,
) -> (ValidationResult, Option<RepairReport>) {
    let result = maintenance.validate().await;

    for error in &result.errors {
        warn!(error = %error, "Schema check could not inspect the catalog");
    }
    let Some(drift) = result.drift() else {
        return (result, None);
    };

    for table in &result.missing_tables {
        warn!(table = %table, "Schema drift: table missing");
    }
    for (table, columns) in &result.missing_columns {
        for column in columns {
            warn!(table = %table, column = %column, "Schema drift: column missing");
        }
    }
    warn!(error = %drift, "Repairing schema drift");

    let report = maintenance.repair(&result).await;
    if report.is_clean() {
        info!(statements = report.applied.len(), "Schema drift repaired");
    } else {
        warn!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Schema drift partially repaired"
        );
    }
    (result, Some(report))
}

/// Run [`check_and_repair`] every `interval` until the task is stopped
pub fn start_monitoring(maintenance: Arc<dyn SchemaMaintenance>, interval: Duration) -> PeriodicTask {
    info!(interval_secs = interval.as_secs(), "Starting schema drift monitor");
    PeriodicTask::spawn("schema-monitor", interval, move || {
        let maintenance = Arc::clone(&maintenance);
        async move {
            check_and_repair(maintenance.as_ref()).await;
        }
    })
}
