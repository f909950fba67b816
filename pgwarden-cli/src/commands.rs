//! Command execution

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::info;

use pgwarden::{BackupCoordinator, PostgresWarden, WardenConfig, WardenError};

use crate::signals::shutdown_signal;
use crate::{BackupCommands, Commands, MigrationCommands, SchemaCommands};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Warden(#[from] WardenError),

    #[error("restoring '{name}' overwrites the database; pass --yes to confirm")]
    RestoreNotConfirmed { name: String },

    #[error("no schema manifest configured (set PGWARDEN_SCHEMA_MANIFEST)")]
    NoManifest,

    #[error("schema check could not complete: {0}")]
    SchemaCheck(String),

    #[error("{failed} schema repair statement(s) failed")]
    RepairIncomplete { failed: usize },

    #[error("database is unhealthy: {0}")]
    Unhealthy(String),

    #[error("cannot render output: {0}")]
    Output(#[from] serde_json::Error),
}

type CliResult = Result<(), CliError>;

pub async fn execute(command: Commands) -> CliResult {
    let config = WardenConfig::from_env().map_err(WardenError::from)?;

    match command {
        // Backups drive pg_dump/psql directly and need no pool
        Commands::Backup { command } => backup(&config, command).await,
        Commands::Run => run(config).await,
        Commands::Migrate => with_warden(config, |w| Box::pin(migrate(w))).await,
        Commands::Migrations { command } => {
            with_warden(config, |w| Box::pin(migrations(w, command))).await
        }
        Commands::Schema { command } => with_warden(config, |w| Box::pin(schema(w, command))).await,
        Commands::Health => with_warden(config, |w| Box::pin(health(w))).await,
    }
}

/// Connect, run `f`, and always shut the pool down afterwards
async fn with_warden<F>(config: WardenConfig, f: F) -> CliResult
where
    F: for<'w> FnOnce(&'w PostgresWarden) -> BoxFuture<'w, CliResult>,
{
    let warden = PostgresWarden::connect(config).await?;
    let result = f(&warden).await;
    warden.shutdown().await;
    result
}

async fn migrate(warden: &PostgresWarden) -> CliResult {
    let report = warden.migrations().run_pending().await?;
    print_json(&report)
}

async fn migrations(warden: &PostgresWarden, command: MigrationCommands) -> CliResult {
    match command {
        MigrationCommands::Status => print_json(&warden.migrations().status().await?),
        MigrationCommands::Rollback { id } => {
            warden.migrations().rollback(&id).await?;
            println!("rolled back migration {id}");
            Ok(())
        }
    }
}

async fn schema(warden: &PostgresWarden, command: SchemaCommands) -> CliResult {
    let repairer = warden.schema().ok_or(CliError::NoManifest)?;
    let result = repairer.validate().await;

    match command {
        SchemaCommands::Validate => {
            print_json(&result)?;
            if let Some(drift) = result.drift() {
                return Err(drift.into());
            }
            if !result.errors.is_empty() {
                return Err(CliError::SchemaCheck(result.errors.join("; ")));
            }
            Ok(())
        }
        SchemaCommands::Repair => {
            if !result.errors.is_empty() {
                return Err(CliError::SchemaCheck(result.errors.join("; ")));
            }
            let report = repairer.repair(&result).await;
            print_json(&report)?;
            if report.is_clean() {
                Ok(())
            } else {
                Err(CliError::RepairIncomplete {
                    failed: report.failed.len(),
                })
            }
        }
    }
}

async fn health(warden: &PostgresWarden) -> CliResult {
    let report = warden.health_report().await;
    print_json(&report)?;
    if report.status.is_operational() {
        Ok(())
    } else {
        Err(CliError::Unhealthy(
            report.message.unwrap_or_else(|| "no details".to_string()),
        ))
    }
}

async fn backup(config: &WardenConfig, command: BackupCommands) -> CliResult {
    let backups = BackupCoordinator::from_config(config)?;
    match command {
        BackupCommands::Create { name } => print_json(&backups.create_backup(name).await?),
        BackupCommands::List => print_json(&backups.list_backups().await?),
        BackupCommands::Restore { name, yes } => {
            if !yes {
                return Err(CliError::RestoreNotConfirmed {
                    name: name.to_string(),
                });
            }
            backups.restore_backup(&name).await?;
            println!("restored backup {name}");
            Ok(())
        }
        BackupCommands::Delete { name } => {
            backups.delete_backup(&name).await?;
            println!("deleted backup {name}");
            Ok(())
        }
    }
}

async fn run(config: WardenConfig) -> CliResult {
    let warden = PostgresWarden::connect(config).await?;
    if let Err(e) = warden.start().await {
        warden.shutdown().await;
        return Err(e.into());
    }
    warden.start_background_tasks();
    info!("pgwarden running; waiting for shutdown signal");

    shutdown_signal().await;
    warden.shutdown().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_confirmation_message_names_backup() {
        let err = CliError::RestoreNotConfirmed {
            name: "nightly".into(),
        };
        assert_eq!(
            err.to_string(),
            "restoring 'nightly' overwrites the database; pass --yes to confirm"
        );
    }

    #[test]
    fn warden_errors_pass_through() {
        let err: CliError = WardenError::BackupNotFound {
            name: "gone".into(),
        }
        .into();
        assert_eq!(err.to_string(), "backup 'gone' not found");
    }
}
