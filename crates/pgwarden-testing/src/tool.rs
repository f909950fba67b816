//! Scripted `pg_dump` / `psql`

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pgwarden_core::{WardenError, WardenResult};
use pgwarden_postgres::backup::{ExternalTool, ToolOutput};

use crate::lock;

const DUMP_HEADER: &str = "-- pgwarden fake dump";

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Value following `--file`
    pub fn file(&self) -> Option<&str> {
        self.args
            .windows(2)
            .find(|pair| pair[0] == "--file")
            .map(|pair| pair[1].as_str())
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
enum Script {
    Fail { exit_code: i32, stderr: String },
    NoOutput,
}

#[derive(Serialize, Deserialize)]
struct Dump {
    rows: BTreeMap<String, String>,
}

/// [`ExternalTool`] that dumps and restores an in-memory key/value
/// "database" instead of spawning processes.
///
/// `pg_dump` writes the current rows to the `--file` path; `psql` replaces
/// the rows with the contents of its `--file`. Scripted outcomes queued
/// with [`fail_next`](Self::fail_next) or [`no_output_next`](Self::no_output_next)
/// apply to the next call of any program.
#[derive(Debug, Default)]
pub struct ScriptedTool {
    rows: Mutex<BTreeMap<String, String>>,
    invocations: Mutex<Vec<Invocation>>,
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.rows).insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        lock(&self.rows).remove(key);
    }

    pub fn rows(&self) -> BTreeMap<String, String> {
        lock(&self.rows).clone()
    }

    /// Next call writes partial output, then exits with `exit_code`
    pub fn fail_next(&self, exit_code: i32, stderr: impl Into<String>) {
        lock(&self.scripts).push_back(Script::Fail {
            exit_code,
            stderr: stderr.into(),
        });
    }

    /// Next call exits successfully without writing anything
    pub fn no_output_next(&self) {
        lock(&self.scripts).push_back(Script::NoOutput);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|call| program_name(&call.program) == program)
            .collect()
    }

    fn dump(&self, file: &str) -> std::io::Result<()> {
        let dump = Dump { rows: self.rows() };
        let body = serde_json::to_string(&dump).map_err(std::io::Error::other)?;
        std::fs::write(file, format!("{DUMP_HEADER}\n{body}\n"))
    }

    fn restore(&self, file: &str) -> Result<(), String> {
        let raw = std::fs::read_to_string(file).map_err(|e| format!("psql: error: {file}: {e}"))?;
        let body = raw.strip_prefix(DUMP_HEADER).ok_or_else(|| {
            let first = raw.split_whitespace().next().unwrap_or_default();
            format!("psql:{file}:1: ERROR: syntax error at or near \"{first}\"")
        })?;
        let dump: Dump =
            serde_json::from_str(body.trim()).map_err(|e| format!("psql:{file}: ERROR: {e}"))?;
        *lock(&self.rows) = dump.rows;
        Ok(())
    }
}

fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

fn exit(code: i32, stderr: impl Into<String>) -> ToolOutput {
    ToolOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: Some(code),
    }
}

#[async_trait]
impl ExternalTool for ScriptedTool {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> WardenResult<ToolOutput> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        };
        let file = invocation.file().map(str::to_string);
        lock(&self.invocations).push(invocation);

        let script = lock(&self.scripts).pop_front();
        let name = program_name(program);
        let Some(file) = file else {
            return Ok(exit(2, format!("{name}: no --file argument")));
        };

        match (name, script) {
            (_, Some(Script::NoOutput)) => Ok(exit(0, "")),
            ("pg_dump", Some(Script::Fail { exit_code, stderr })) => {
                // A dump that dies midway leaves a truncated file behind
                std::fs::write(&file, format!("{DUMP_HEADER}\n"))
                    .map_err(|e| WardenError::backup_io(&file, e))?;
                Ok(exit(exit_code, stderr))
            }
            (_, Some(Script::Fail { exit_code, stderr })) => Ok(exit(exit_code, stderr)),
            ("pg_dump", None) => {
                self.dump(&file)
                    .map_err(|e| WardenError::backup_io(&file, e))?;
                Ok(exit(0, ""))
            }
            ("psql", None) => match self.restore(&file) {
                Ok(()) => Ok(exit(0, "")),
                Err(stderr) => Ok(exit(3, stderr)),
            },
            (other, None) => Ok(exit(127, format!("{other}: command not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(file: &Path) -> Vec<String> {
        vec!["--file".to_string(), file.display().to_string()]
    }

    #[tokio::test]
    async fn dump_then_restore_round_trips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("snap.sql");
        let tool = ScriptedTool::new();
        tool.insert("users:1", "ada");

        assert!(tool.run("pg_dump", &args(&file), &[]).await.unwrap().success());
        tool.insert("users:2", "grace");
        tool.remove("users:1");

        assert!(tool.run("/usr/bin/psql", &args(&file), &[]).await.unwrap().success());
        assert_eq!(
            tool.rows().into_iter().collect::<Vec<_>>(),
            vec![("users:1".to_string(), "ada".to_string())]
        );
        assert_eq!(tool.invocations_of("psql").len(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("snap.sql");
        let tool = ScriptedTool::new();
        tool.fail_next(1, "pg_dump: error: connection refused");

        let output = tool.run("pg_dump", &args(&file), &[]).await.unwrap();
        assert_eq!(output.exit_code, Some(1));
        assert!(file.exists());
        assert!(tool.run("pg_dump", &args(&file), &[]).await.unwrap().success());
    }

    #[tokio::test]
    async fn restoring_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.sql");
        std::fs::write(&file, "DROP DATABASE everything;").unwrap();

        let output = ScriptedTool::new()
            .run("psql", &args(&file), &[])
            .await
            .unwrap();
        assert!(!output.success());
        assert!(output.stderr.contains("syntax error"));
    }
}
