//! External process seam for `pg_dump` / `psql`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use pgwarden_core::{WardenError, WardenResult};

/// Captured result of one external invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a non-zero exit into [`WardenError::ExternalProcess`]
    pub fn check(self, program: &str) -> WardenResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(WardenError::ExternalProcess {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim_end().to_string(),
            })
        }
    }
}

/// Runs an executable with an argument vector and extra environment.
/// Implementations never go through a shell.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> WardenResult<ToolOutput>;
}

/// [`ExternalTool`] backed by `tokio::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTool;

#[async_trait]
impl ExternalTool for ProcessTool {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> WardenResult<ToolOutput> {
        debug!(program, args = ?args, "Spawning external tool");
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| WardenError::ExternalProcess {
                program: program.to_string(),
                exit_code: None,
                stderr: format!("failed to start: {e}"),
            })?;

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_keeps_stderr() {
        let output = ToolOutput {
            stderr: "pg_dump: error: connection refused\n".into(),
            exit_code: Some(1),
            ..Default::default()
        };
        match output.check("pg_dump").unwrap_err() {
            WardenError::ExternalProcess {
                program,
                exit_code,
                stderr,
            } => {
                assert_eq!(program, "pg_dump");
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "pg_dump: error: connection refused");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_external_process_error() {
        let err = ProcessTool
            .run("pgwarden-definitely-not-installed", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ExternalProcess { exit_code: None, .. }));
    }
}
