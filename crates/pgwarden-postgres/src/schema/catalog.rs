//! Live catalog access and corrective DDL

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;

use pgwarden_core::WardenResult;

use super::manifest::{ColumnSpec, TableSpec};
use crate::error::pg_error;
use crate::manager::PostgresPool;

/// Read access to existing tables/columns plus DDL execution
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn existing_tables(&self, schema: &str) -> WardenResult<BTreeSet<String>>;

    async fn existing_columns(&self, schema: &str, table: &str) -> WardenResult<BTreeSet<String>>;

    async fn apply_ddl(&self, statement: &DdlStatement) -> WardenResult<()>;
}

/// Corrective statement issued by the repairer. Both forms are idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    CreateTable { schema: String, table: TableSpec },
    AddColumn {
        schema: String,
        table: String,
        column: ColumnSpec,
    },
}

impl DdlStatement {
    pub fn to_sql(&self) -> String {
        match self {
            DdlStatement::CreateTable { schema, table } => {
                let columns = table
                    .columns
                    .iter()
                    .map(|c| format!("    {} {}", quote_ident(&c.name), c.definition))
                    .collect::<Vec<_>>()
                    .join(",\n");
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (\n{}\n)",
                    quote_ident(schema),
                    quote_ident(&table.name),
                    columns
                )
            }
            DdlStatement::AddColumn {
                schema,
                table,
                column,
            } => format!(
                "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(schema),
                quote_ident(table),
                quote_ident(&column.name),
                column.definition
            ),
        }
    }

    /// The table this statement touches
    pub fn table(&self) -> &str {
        match self {
            DdlStatement::CreateTable { table, .. } => &table.name,
            DdlStatement::AddColumn { table, .. } => table,
        }
    }
}

impl fmt::Display for DdlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdlStatement::CreateTable { table, .. } => write!(f, "create table {}", table.name),
            DdlStatement::AddColumn { table, column, .. } => {
                write!(f, "add column {}.{}", table, column.name)
            }
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Catalog backed by `information_schema` of the pooled database
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PostgresPool,
}

impl PostgresCatalog {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaCatalog for PostgresCatalog {
    async fn existing_tables(&self, schema: &str) -> WardenResult<BTreeSet<String>> {
        let conn = self.pool.acquire().await?;
        let rows = conn
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
                &[&schema],
            )
            .await
            .map_err(pg_error)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg_error))
            .collect()
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> WardenResult<BTreeSet<String>> {
        let conn = self.pool.acquire().await?;
        let rows = conn
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table],
            )
            .await
            .map_err(pg_error)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg_error))
            .collect()
    }

    async fn apply_ddl(&self, statement: &DdlStatement) -> WardenResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.execute_batch(&statement.to_sql()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_quotes_identifiers() {
        let statement = DdlStatement::CreateTable {
            schema: "public".into(),
            table: TableSpec::new("user accounts")
                .column("id", "BIGSERIAL PRIMARY KEY")
                .column("display\"name", "TEXT"),
        };
        assert_eq!(
            statement.to_sql(),
            "CREATE TABLE IF NOT EXISTS \"public\".\"user accounts\" (\n    \"id\" BIGSERIAL PRIMARY KEY,\n    \"display\"\"name\" TEXT\n)"
        );
        assert_eq!(statement.table(), "user accounts");
    }

    #[test]
    fn add_column_is_idempotent_ddl() {
        let statement = DdlStatement::AddColumn {
            schema: "public".into(),
            table: "users".into(),
            column: ColumnSpec {
                name: "email".into(),
                definition: "TEXT NOT NULL DEFAULT ''".into(),
            },
        };
        assert_eq!(
            statement.to_sql(),
            "ALTER TABLE \"public\".\"users\" ADD COLUMN IF NOT EXISTS \"email\" TEXT NOT NULL DEFAULT ''"
        );
        assert_eq!(statement.to_string(), "add column users.email");
    }
}
