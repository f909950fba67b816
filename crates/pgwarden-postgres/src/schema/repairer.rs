//! Drift detection and corrective DDL

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use pgwarden_core::WardenError;

use super::catalog::{DdlStatement, SchemaCatalog};
use super::manifest::SchemaManifest;

/// Schema that manifests are checked against unless overridden
pub const DEFAULT_SCHEMA: &str = "public";

/// Outcome of comparing the live catalog with the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_tables: Vec<String>,
    /// Missing columns of tables that do exist, keyed by table
    pub missing_columns: BTreeMap<String, Vec<String>>,
    /// Catalog failures encountered while checking
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn missing_column_count(&self) -> usize {
        self.missing_columns.values().map(Vec::len).sum()
    }

    /// `SchemaDrift` describing this result, or `None` when nothing is missing
    pub fn drift(&self) -> Option<WardenError> {
        let missing_columns = self.missing_column_count();
        if self.missing_tables.is_empty() && missing_columns == 0 {
            return None;
        }
        Some(WardenError::SchemaDrift {
            missing_tables: self.missing_tables.len(),
            missing_columns,
        })
    }
}

/// One corrective statement that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairFailure {
    pub statement: String,
    pub error: String,
}

/// Statements issued by one repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub applied: Vec<String>,
    pub failed: Vec<RepairFailure>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Validate-and-repair seam used by the drift monitor
#[async_trait]
pub trait SchemaMaintenance: Send + Sync {
    async fn validate(&self) -> ValidationResult;

    async fn repair(&self, result: &ValidationResult) -> RepairReport;
}

/// Compares the live schema with a [`SchemaManifest`] and adds what is
/// missing. Never drops or alters existing objects.
pub struct SchemaRepairer {
    catalog: Arc<dyn SchemaCatalog>,
    manifest: SchemaManifest,
    schema: String,
}

impl SchemaRepairer {
    pub fn new(catalog: Arc<dyn SchemaCatalog>, manifest: SchemaManifest) -> Self {
        Self {
            catalog,
            manifest,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn manifest(&self) -> &SchemaManifest {
        &self.manifest
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Check every manifest table and, for existing tables, every column.
    pub async fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let tables = match self.catalog.existing_tables(&self.schema).await {
            Ok(tables) => tables,
            Err(e) => {
                warn!(schema = %self.schema, error = %e, "Cannot list tables");
                result.errors.push(format!("listing tables in {}: {e}", self.schema));
                return result;
            }
        };

        for table in &self.manifest.tables {
            if !tables.contains(&table.name) {
                result.missing_tables.push(table.name.clone());
                continue;
            }

            let columns = match self.catalog.existing_columns(&self.schema, &table.name).await {
                Ok(columns) => columns,
                Err(e) => {
                    warn!(table = %table.name, error = %e, "Cannot list columns");
                    result
                        .errors
                        .push(format!("listing columns of {}: {e}", table.name));
                    continue;
                }
            };
            let missing: Vec<String> = table
                .columns
                .iter()
                .filter(|c| !columns.contains(&c.name))
                .map(|c| c.name.clone())
                .collect();
            if !missing.is_empty() {
                result.missing_columns.insert(table.name.clone(), missing);
            }
        }

        result.is_valid = result.errors.is_empty() && result.drift().is_none();
        debug!(
            is_valid = result.is_valid,
            missing_tables = result.missing_tables.len(),
            missing_columns = result.missing_column_count(),
            "Schema validated"
        );
        result
    }

    /// Statements that would fix `result`, in manifest order
    pub fn plan(&self, result: &ValidationResult) -> Vec<DdlStatement> {
        let mut statements = Vec::new();
        for name in &result.missing_tables {
            match self.manifest.table_spec(name) {
                Some(table) => statements.push(DdlStatement::CreateTable {
                    schema: self.schema.clone(),
                    table: table.clone(),
                }),
                None => warn!(table = %name, "Missing table is not in the manifest; skipping"),
            }
        }
        for (table_name, columns) in &result.missing_columns {
            let Some(table) = self.manifest.table_spec(table_name) else {
                warn!(table = %table_name, "Table is not in the manifest; skipping");
                continue;
            };
            for column in columns {
                match table.column_spec(column) {
                    Some(spec) => statements.push(DdlStatement::AddColumn {
                        schema: self.schema.clone(),
                        table: table_name.clone(),
                        column: spec.clone(),
                    }),
                    None => warn!(
                        table = %table_name,
                        column = %column,
                        "Missing column is not in the manifest; skipping"
                    ),
                }
            }
        }
        statements
    }

    /// Apply each corrective statement on its own. A failed statement is
    /// recorded and the remaining ones still run.
    pub async fn repair(&self, result: &ValidationResult) -> RepairReport {
        let mut report = RepairReport::default();
        for statement in self.plan(result) {
            match self.catalog.apply_ddl(&statement).await {
                Ok(()) => {
                    info!(table = %statement.table(), statement = %statement, "Schema repaired");
                    report.applied.push(statement.to_string());
                }
                Err(e) => {
                    warn!(
                        table = %statement.table(),
                        statement = %statement,
                        error = %e,
                        "Schema repair statement failed"
                    );
                    report.failed.push(RepairFailure {
                        statement: statement.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[async_trait]
impl SchemaMaintenance for SchemaRepairer {
    async fn validate(&self) -> ValidationResult {
        SchemaRepairer::validate(self).await
    }

    async fn repair(&self, result: &ValidationResult) -> RepairReport {
        SchemaRepairer::repair(self, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::manifest::TableSpec;
    use pgwarden_core::WardenResult;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubCatalog {
        tables: Mutex<BTreeMap<String, BTreeSet<String>>>,
        reject: Option<&'static str>,
        broken: bool,
    }

    impl StubCatalog {
        fn with_table(self, name: &str, columns: &[&str]) -> Self {
            self.tables.lock().unwrap().insert(
                name.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl SchemaCatalog for StubCatalog {
        async fn existing_tables(&self, _schema: &str) -> WardenResult<BTreeSet<String>> {
            if self.broken {
                return Err(WardenError::ConnectionLost {
                    reason: "gone".into(),
                });
            }
            Ok(self.tables.lock().unwrap().keys().cloned().collect())
        }

        async fn existing_columns(
            &self,
            _schema: &str,
            table: &str,
        ) -> WardenResult<BTreeSet<String>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default())
        }

        async fn apply_ddl(&self, statement: &DdlStatement) -> WardenResult<()> {
            if self.reject == Some(statement.table()) {
                return Err(WardenError::Query {
                    code: Some("42501".into()),
                    message: "permission denied".into(),
                });
            }
            let mut tables = self.tables.lock().unwrap();
            match statement {
                DdlStatement::CreateTable { table, .. } => {
                    tables.insert(
                        table.name.clone(),
                        table.columns.iter().map(|c| c.name.clone()).collect(),
                    );
                }
                DdlStatement::AddColumn { table, column, .. } => {
                    tables
                        .entry(table.clone())
                        .or_default()
                        .insert(column.name.clone());
                }
            }
            Ok(())
        }
    }

    fn manifest() -> SchemaManifest {
        SchemaManifest::new()
            .table(
                TableSpec::new("users")
                    .column("id", "BIGSERIAL PRIMARY KEY")
                    .column("email", "TEXT"),
            )
            .table(TableSpec::new("audit").column("id", "BIGSERIAL PRIMARY KEY"))
    }

    #[tokio::test]
    async fn detects_and_repairs_drift() {
        let catalog = Arc::new(StubCatalog::default().with_table("users", &["id"]));
        let repairer = SchemaRepairer::new(catalog, manifest());

        let result = repairer.validate().await;
        assert!(!result.is_valid);
        assert_eq!(result.missing_tables, vec!["audit".to_string()]);
        assert_eq!(result.missing_columns["users"], vec!["email".to_string()]);
        assert!(matches!(
            result.drift(),
            Some(WardenError::SchemaDrift {
                missing_tables: 1,
                missing_columns: 1
            })
        ));

        let report = repairer.repair(&result).await;
        assert!(report.is_clean());
        assert_eq!(
            report.applied,
            vec!["create table audit".to_string(), "add column users.email".to_string()]
        );
        assert!(repairer.validate().await.is_valid);
    }

    #[tokio::test]
    async fn failed_statement_does_not_stop_repair() {
        let catalog = Arc::new(StubCatalog {
            reject: Some("audit"),
            ..StubCatalog::default().with_table("users", &["id"])
        });
        let repairer = SchemaRepairer::new(catalog, manifest());

        let report = repairer.repair(&repairer.validate().await).await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("permission denied"));
        assert_eq!(report.applied, vec!["add column users.email".to_string()]);
    }

    #[tokio::test]
    async fn catalog_errors_make_result_invalid() {
        let catalog = Arc::new(StubCatalog {
            broken: true,
            ..Default::default()
        });
        let result = SchemaRepairer::new(catalog, manifest()).validate().await;
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.drift().is_none());
    }
}
