//! Integration tests for schema drift detection and repair

use std::sync::Arc;

use pgwarden::schema::{check_and_repair, start_monitoring, SchemaMaintenance};
use pgwarden::{SchemaManifest, SchemaRepairer, TableSpec, WardenError};
use pgwarden_testing::InMemoryCatalog;

fn manifest() -> SchemaManifest {
    SchemaManifest::new()
        .table(
            TableSpec::new("users")
                .column("id", "BIGSERIAL PRIMARY KEY")
                .column("email", "TEXT NOT NULL")
                .column("display_name", "TEXT NOT NULL DEFAULT ''"),
        )
        .table(
            TableSpec::new("sessions")
                .column("token", "TEXT PRIMARY KEY")
                .column("user_id", "BIGINT NOT NULL"),
        )
}

fn complete_catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_table("users", &["id", "email", "display_name"])
        .with_table("sessions", &["token", "user_id"])
}

#[tokio::test]
async fn matching_database_is_valid() {
    let catalog = Arc::new(complete_catalog());
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());

    let result = repairer.validate().await;
    assert!(result.is_valid);
    assert!(result.drift().is_none());
    assert!(repairer.plan(&result).is_empty());
}

#[tokio::test]
async fn dropped_column_is_detected_and_restored() {
    let catalog = Arc::new(complete_catalog());
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());
    catalog.drop_column("users", "display_name");

    let result = repairer.validate().await;
    assert!(!result.is_valid);
    assert!(result.missing_tables.is_empty());
    assert_eq!(
        result.missing_columns.get("users"),
        Some(&vec!["display_name".to_string()])
    );
    assert!(matches!(
        result.drift(),
        Some(WardenError::SchemaDrift {
            missing_tables: 0,
            missing_columns: 1
        })
    ));

    let report = repairer.repair(&result).await;
    assert!(report.is_clean());
    assert_eq!(report.applied, vec!["add column users.display_name"]);
    assert_eq!(
        catalog.applied(),
        vec![
            r#"ALTER TABLE "public"."users" ADD COLUMN IF NOT EXISTS "display_name" TEXT NOT NULL DEFAULT ''"#
        ]
    );

    assert!(repairer.validate().await.is_valid);
}

#[tokio::test]
async fn missing_table_is_created_with_all_columns() {
    let catalog = Arc::new(complete_catalog());
    catalog.drop_table("sessions");
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());

    let (result, report) = check_and_repair(&repairer).await;
    assert_eq!(result.missing_tables, vec!["sessions"]);
    // Columns of a missing table are not reported separately
    assert!(result.missing_columns.is_empty());

    let report = report.expect("drift should trigger a repair");
    assert_eq!(report.applied, vec!["create table sessions"]);
    assert!(catalog.has_column("sessions", "user_id"));
    assert!(repairer.validate().await.is_valid);
}

#[tokio::test]
async fn one_failing_statement_does_not_block_the_rest() {
    let catalog = Arc::new(complete_catalog());
    catalog.drop_column("users", "email");
    catalog.drop_table("sessions");
    catalog.reject_ddl_for("users");
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());

    let (_, report) = check_and_repair(&repairer).await;
    let report = report.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.applied, vec!["create table sessions"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].statement, "add column users.email");
    assert!(report.failed[0].error.contains("permission denied"));
}

#[tokio::test]
async fn unreachable_catalog_is_reported_not_repaired() {
    let catalog = Arc::new(complete_catalog());
    catalog.set_unavailable(true);
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());

    let (result, report) = check_and_repair(&repairer).await;
    assert!(!result.is_valid);
    assert_eq!(result.errors.len(), 1);
    assert!(report.is_none());
    assert!(catalog.applied().is_empty());
}

#[tokio::test]
async fn non_default_schema_is_quoted_into_ddl() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let repairer = SchemaRepairer::new(catalog.clone(), manifest()).with_schema("tenant_a");

    let result = repairer.validate().await;
    repairer.repair(&result).await;

    let applied = catalog.applied();
    assert_eq!(applied.len(), 2);
    assert!(applied[0].starts_with(r#"CREATE TABLE IF NOT EXISTS "tenant_a"."users""#));
}

#[tokio::test(start_paused = true)]
async fn monitor_repairs_drift_introduced_between_ticks() {
    let catalog = Arc::new(complete_catalog());
    let repairer: Arc<dyn SchemaMaintenance> =
        Arc::new(SchemaRepairer::new(catalog.clone(), manifest()));

    let task = start_monitoring(repairer, std::time::Duration::from_secs(60));
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(catalog.applied().is_empty());

    catalog.drop_column("sessions", "user_id");
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;

    assert!(catalog.has_column("sessions", "user_id"));
    assert_eq!(catalog.applied().len(), 1);
    task.stop().await;
}

#[test]
fn manifest_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema.toml");
    std::fs::write(
        &path,
        r#"
[[tables]]
name = "audit_log"
columns = [
  { name = "id", definition = "BIGSERIAL PRIMARY KEY" },
  { name = "payload", definition = "JSONB NOT NULL" },
]
"#,
    )
    .unwrap();

    let manifest = SchemaManifest::from_file(&path).unwrap();
    assert_eq!(manifest.tables.len(), 1);
    assert_eq!(
        manifest
            .table_spec("audit_log")
            .and_then(|t| t.column_spec("payload"))
            .map(|c| c.definition.as_str()),
        Some("JSONB NOT NULL")
    );

    let missing = SchemaManifest::from_file(dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(WardenError::InvalidManifest(_))));
}
