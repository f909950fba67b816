//! In-memory schema catalog

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use pgwarden_core::{WardenError, WardenResult};
use pgwarden_postgres::schema::{DdlStatement, SchemaCatalog};

use crate::lock;

/// [`SchemaCatalog`] over an in-memory `table -> columns` map of a single
/// schema. DDL is applied to the map and logged as SQL.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tables: Mutex<BTreeMap<String, BTreeSet<String>>>,
    applied: Mutex<Vec<String>>,
    rejected_tables: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        self.create_table(table, columns);
        self
    }

    pub fn create_table(&self, table: &str, columns: &[&str]) {
        lock(&self.tables).insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn drop_table(&self, table: &str) {
        lock(&self.tables).remove(table);
    }

    pub fn drop_column(&self, table: &str, column: &str) {
        if let Some(columns) = lock(&self.tables).get_mut(table) {
            columns.remove(column);
        }
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        lock(&self.tables)
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    /// Make DDL touching `table` fail with a permission error
    pub fn reject_ddl_for(&self, table: &str) {
        lock(&self.rejected_tables).insert(table.to_string());
    }

    /// Make catalog reads fail as if the connection were gone
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// SQL of every DDL statement applied, in order
    pub fn applied(&self) -> Vec<String> {
        lock(&self.applied).clone()
    }

    fn check_available(&self) -> WardenResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WardenError::ConnectionLost {
                reason: "catalog unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaCatalog for InMemoryCatalog {
    async fn existing_tables(&self, _schema: &str) -> WardenResult<BTreeSet<String>> {
        self.check_available()?;
        Ok(lock(&self.tables).keys().cloned().collect())
    }

    async fn existing_columns(&self, _schema: &str, table: &str) -> WardenResult<BTreeSet<String>> {
        self.check_available()?;
        Ok(lock(&self.tables).get(table).cloned().unwrap_or_default())
    }

    async fn apply_ddl(&self, statement: &DdlStatement) -> WardenResult<()> {
        self.check_available()?;
        if lock(&self.rejected_tables).contains(statement.table()) {
            return Err(WardenError::Query {
                code: Some("42501".to_string()),
                message: format!("permission denied for table {}", statement.table()),
            });
        }

        let mut tables = lock(&self.tables);
        match statement {
            DdlStatement::CreateTable { table, .. } => {
                tables
                    .entry(table.name.clone())
                    .or_insert_with(|| table.columns.iter().map(|c| c.name.clone()).collect());
            }
            DdlStatement::AddColumn { table, column, .. } => {
                let Some(columns) = tables.get_mut(table) else {
                    return Err(WardenError::Query {
                        code: Some("42P01".to_string()),
                        message: format!("relation \"{table}\" does not exist"),
                    });
                };
                columns.insert(column.name.clone());
            }
        }
        drop(tables);
        lock(&self.applied).push(statement.to_sql());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgwarden_postgres::schema::ColumnSpec;

    #[tokio::test]
    async fn add_column_requires_table() {
        let catalog = InMemoryCatalog::new();
        let statement = DdlStatement::AddColumn {
            schema: "public".into(),
            table: "ghost".into(),
            column: ColumnSpec {
                name: "id".into(),
                definition: "INT".into(),
            },
        };
        assert!(catalog.apply_ddl(&statement).await.is_err());
        assert!(catalog.applied().is_empty());
    }

    #[tokio::test]
    async fn drop_column_is_visible() {
        let catalog = InMemoryCatalog::new().with_table("users", &["id", "email"]);
        catalog.drop_column("users", "email");
        let columns = catalog.existing_columns("public", "users").await.unwrap();
        assert_eq!(columns.into_iter().collect::<Vec<_>>(), vec!["id".to_string()]);
    }
}
