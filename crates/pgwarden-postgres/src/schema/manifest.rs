//! Expected tables and columns

use std::path::Path;

use serde::{Deserialize, Serialize};

use pgwarden_core::{WardenError, WardenResult};

/// One expected column. `definition` is the SQL type plus constraints, e.g.
/// `"TEXT NOT NULL DEFAULT ''"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub definition: String,
}

/// One expected table with its columns in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, definition: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            definition: definition.into(),
        });
        self
    }

    pub fn column_spec(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The static shape the database is expected to have.
///
/// A TOML manifest looks like:
///
/// ```toml
/// [[tables]]
/// name = "users"
/// columns = [
///   { name = "id", definition = "BIGSERIAL PRIMARY KEY" },
///   { name = "email", definition = "TEXT NOT NULL" },
/// ]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaManifest {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl SchemaManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table_spec(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn from_toml_str(raw: &str) -> WardenResult<Self> {
        let manifest: Self =
            toml::from_str(raw).map_err(|e| WardenError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WardenError::InvalidManifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject empty names, tables without columns and duplicates
    pub fn validate(&self) -> WardenResult<()> {
        let mut seen_tables = std::collections::HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(WardenError::InvalidManifest(
                    "table name cannot be empty".to_string(),
                ));
            }
            if !seen_tables.insert(table.name.as_str()) {
                return Err(WardenError::InvalidManifest(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }
            if table.columns.is_empty() {
                return Err(WardenError::InvalidManifest(format!(
                    "table '{}' has no columns",
                    table.name
                )));
            }

            let mut seen_columns = std::collections::HashSet::new();
            for column in &table.columns {
                if column.name.trim().is_empty() || column.definition.trim().is_empty() {
                    return Err(WardenError::InvalidManifest(format!(
                        "table '{}' has a column with an empty name or definition",
                        table.name
                    )));
                }
                if !seen_columns.insert(column.name.as_str()) {
                    return Err(WardenError::InvalidManifest(format!(
                        "column '{}.{}' is declared twice",
                        table.name, column.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[tables]]
name = "users"
columns = [
  { name = "id", definition = "BIGSERIAL PRIMARY KEY" },
  { name = "email", definition = "TEXT NOT NULL" },
]

[[tables]]
name = "sessions"
columns = [{ name = "token", definition = "TEXT PRIMARY KEY" }]
"#;

    #[test]
    fn parses_toml_in_declaration_order() {
        let manifest = SchemaManifest::from_toml_str(MANIFEST).unwrap();
        let names: Vec<&str> = manifest.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users", "sessions"]);

        let users = manifest.table_spec("users").unwrap();
        assert_eq!(users.columns[1].name, "email");
        assert_eq!(
            users.column_spec("id").unwrap().definition,
            "BIGSERIAL PRIMARY KEY"
        );
    }

    #[test]
    fn builder_matches_toml() {
        let built = SchemaManifest::new()
            .table(
                TableSpec::new("users")
                    .column("id", "BIGSERIAL PRIMARY KEY")
                    .column("email", "TEXT NOT NULL"),
            )
            .table(TableSpec::new("sessions").column("token", "TEXT PRIMARY KEY"));
        assert_eq!(built, SchemaManifest::from_toml_str(MANIFEST).unwrap());
    }

    #[test]
    fn rejects_duplicates_and_empty_tables() {
        let duplicate = SchemaManifest::new()
            .table(TableSpec::new("a").column("x", "INT"))
            .table(TableSpec::new("a").column("y", "INT"));
        assert!(duplicate.validate().is_err());

        let empty = SchemaManifest::new().table(TableSpec::new("a"));
        assert!(empty.validate().is_err());

        let err = SchemaManifest::from_toml_str("tables = 3").unwrap_err();
        assert!(matches!(err, WardenError::InvalidManifest(_)));
    }
}
