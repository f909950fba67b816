//! End-to-end lifecycle tests: a Warden assembled from in-memory fakes

use std::sync::Arc;
use std::time::Duration;

use pgwarden::{
    BackupCoordinator, BackupSettings, HealthStatus, Migration, MigrationRunner, MigrationSet,
    Pool, PoolState, PostgresConfig, Profile, SchemaManifest, SchemaRepairer, SchemaSettings,
    TableSpec, Warden, WardenConfig, WardenConfigBuilder, WardenError,
};
use pgwarden_testing::{FakeManager, InMemoryCatalog, InMemoryLedger, ScriptedTool};
use tempfile::TempDir;

const URL: &str = "postgres://app:pw@localhost:5432/app";

struct Harness {
    _dir: TempDir,
    manager: FakeManager,
    ledger: Arc<InMemoryLedger>,
    catalog: Arc<InMemoryCatalog>,
    tool: Arc<ScriptedTool>,
    warden: Warden<FakeManager>,
}

fn config(dir: &TempDir, backup_every: Option<Duration>, check_every: Option<Duration>) -> WardenConfig {
    WardenConfigBuilder::new()
        .database_url(URL)
        .profile(Profile::Test)
        .backup(BackupSettings {
            directory: dir.path().join("backups"),
            retention: 2,
            interval: backup_every,
            ..BackupSettings::default()
        })
        .schema(SchemaSettings {
            manifest_path: None,
            check_interval: check_every,
        })
        .build()
        .unwrap()
}

fn migrations() -> MigrationSet {
    MigrationSet::new()
        .with(
            Migration::new(
                "002",
                "create_accounts",
                "CREATE TABLE accounts (id BIGSERIAL PRIMARY KEY)",
            )
            .unwrap(),
        )
        .unwrap()
}

fn manifest() -> SchemaManifest {
    SchemaManifest::new().table(
        TableSpec::new("accounts")
            .column("id", "BIGSERIAL PRIMARY KEY")
            .column("plan", "TEXT NOT NULL DEFAULT 'free'"),
    )
}

async fn harness(backup_every: Option<Duration>, check_every: Option<Duration>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir, backup_every, check_every);

    let manager = FakeManager::new();
    let pool = Pool::connect(manager.clone(), config.pool.clone())
        .await
        .unwrap();

    let ledger = Arc::new(InMemoryLedger::new());
    let runner = MigrationRunner::new(ledger.clone(), migrations());

    let catalog = Arc::new(InMemoryCatalog::new().with_table("accounts", &["id"]));
    let repairer = SchemaRepairer::new(catalog.clone(), manifest());

    let tool = Arc::new(ScriptedTool::new());
    let backups = BackupCoordinator::new(
        PostgresConfig::from_warden_config(&config).unwrap(),
        config.backup.clone(),
        tool.clone(),
    );

    let warden = Warden::assemble(config, pool, runner, Some(repairer), backups);
    Harness {
        _dir: dir,
        manager,
        ledger,
        catalog,
        tool,
        warden,
    }
}

#[tokio::test]
async fn start_migrates_then_repairs_schema() {
    let h = harness(None, None).await;

    let report = h.warden.start().await.unwrap();

    assert!(report.migrations.bootstrapped);
    assert_eq!(report.migrations.applied.len(), 1);
    assert_eq!(h.ledger.applied_ids(), vec!["001", "002"]);

    let schema = report.schema.expect("manifest is configured");
    assert_eq!(
        schema.missing_columns.get("accounts"),
        Some(&vec!["plan".to_string()])
    );
    assert!(report.repair.expect("drift was found").is_clean());
    assert!(h.catalog.has_column("accounts", "plan"));

    h.warden.shutdown().await;
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let h = harness(None, None).await;
    h.warden.start().await.unwrap();
    let ddl = h.ledger.ddl_count();

    let report = h.warden.start().await.unwrap();
    assert!(report.migrations.is_noop());
    assert!(report.repair.is_none());
    assert_eq!(h.ledger.ddl_count(), ddl);

    h.warden.shutdown().await;
}

#[tokio::test]
async fn migration_failure_aborts_startup_before_schema_repair() {
    let h = harness(None, None).await;
    h.ledger.fail_on("002", "relation \"accounts\" already exists");

    let err = h.warden.start().await.unwrap_err();
    assert!(matches!(err, WardenError::MigrationFailed { .. }));
    assert!(h.catalog.applied().is_empty());

    h.warden.shutdown().await;
}

#[tokio::test]
async fn background_tasks_run_and_stop_with_shutdown() {
    let h = harness(
        Some(Duration::from_millis(40)),
        Some(Duration::from_millis(40)),
    )
    .await;
    h.warden.start().await.unwrap();

    h.warden.start_background_tasks();
    h.warden.start_background_tasks();
    assert_eq!(h.warden.background_task_count(), 2);

    // Drift introduced while running is picked up by the monitor
    h.catalog.drop_column("accounts", "plan");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(h.catalog.has_column("accounts", "plan"));
    assert!(!h.tool.invocations_of("pg_dump").is_empty());

    h.warden.shutdown().await;
    assert_eq!(h.warden.background_task_count(), 0);
    assert_eq!(h.warden.pool().state(), PoolState::Closed);

    let dumps = h.tool.invocations_of("pg_dump").len();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.tool.invocations_of("pg_dump").len(), dumps);

    // Retention applies to scheduled backups
    assert!(h.warden.backups().list_backups().await.unwrap().len() <= 2);
}

#[tokio::test]
async fn no_intervals_means_no_background_tasks() {
    let h = harness(None, None).await;
    h.warden.start_background_tasks();
    assert_eq!(h.warden.background_task_count(), 0);
    h.warden.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_sessions() {
    let h = harness(None, None).await;
    h.warden.start().await.unwrap();

    h.warden.shutdown().await;
    h.warden.shutdown().await;

    assert_eq!(h.manager.live(), 0);
    assert!(matches!(
        h.warden.pool().acquire().await,
        Err(WardenError::PoolClosed)
    ));

    // Tasks cannot be started once shut down
    h.warden.start_background_tasks();
    assert_eq!(h.warden.background_task_count(), 0);
}

#[tokio::test]
async fn health_report_reflects_database_availability() {
    let h = harness(None, None).await;

    let report = h.warden.health_report().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.server_version.as_deref(), Some("16.0 (fake)"));
    assert_eq!(report.pool.map(|p| p.in_use), Some(0));

    h.manager.set_down(true);
    h.manager.break_existing();
    let report = h.warden.health_report().await;
    assert_ne!(report.status, HealthStatus::Healthy);

    h.warden.shutdown().await;
}
