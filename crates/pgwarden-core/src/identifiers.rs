//! Validated identifiers for migrations and backups

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::WardenError;

/// Migration identifier: a non-empty run of ASCII digits such as `"001"`.
///
/// Ids are ordered by numeric value, so `"002" < "010" < "0100"`. Leading
/// zeros are kept for display but ignored for equality, which makes `"7"`
/// and `"007"` duplicates of each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId(String);

impl MigrationId {
    pub fn new(id: impl Into<String>) -> Result<Self, WardenError> {
        let id = id.into();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(WardenError::InvalidMigration(format!(
                "migration id '{id}' must be a non-empty string of digits"
            )));
        }
        Ok(Self(id))
    }

    /// Zero-padded id for a number, e.g. `from_number(1, 3)` is `"001"`.
    pub fn from_number(value: u64, width: usize) -> Self {
        Self(format!("{value:0width$}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn significant(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() { "0" } else { trimmed }
    }
}

impl Ord for MigrationId {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.significant(), other.significant());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for MigrationId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MigrationId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MigrationId {}

impl Hash for MigrationId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MigrationId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MigrationId {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.0
    }
}

/// Backup file stem. `<name>.sql` and `<name>.json` live side by side in the
/// backup directory, so the name must be safe to use as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupName(String);

impl BackupName {
    pub const MAX_LENGTH: usize = 128;

    pub fn new(name: impl Into<String>) -> Result<Self, WardenError> {
        let name = name.into();
        let reject = |reason: &str| WardenError::InvalidBackupName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(reject("name cannot be empty"));
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(reject("name is longer than 128 characters"));
        }
        if name.starts_with('.') {
            return Err(reject("name cannot start with '.'"));
        }
        if name.contains("..") {
            return Err(reject("name cannot contain '..'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(reject(
                "only ASCII letters, digits, '.', '_' and '-' are allowed",
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BackupName {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BackupName {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackupName> for String {
    fn from(name: BackupName) -> Self {
        name.0
    }
}
