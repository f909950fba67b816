use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pgwarden::{BackupName, MigrationId};
use tracing::{debug, error};

mod commands;
mod signals;

#[derive(Parser, Debug)]
#[command(name = "pgwarden", version)]
#[command(about = "pgwarden - PostgreSQL pool, migrations, schema repair and backups")]
struct Cli {
    /// Human-readable log output instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// Inspect or roll back migrations
    Migrations {
        #[command(subcommand)]
        command: MigrationCommands,
    },
    /// Compare the live schema with the manifest
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Manage logical backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Check database connectivity and pool state
    Health,
    /// Migrate, start configured monitors and run until SIGINT/SIGTERM
    Run,
}

#[derive(Subcommand, Debug)]
enum MigrationCommands {
    /// Applied and pending migrations
    Status,
    /// Roll back the most recently applied migration
    Rollback {
        /// Migration id, e.g. 004
        id: MigrationId,
    },
}

#[derive(Subcommand, Debug)]
enum SchemaCommands {
    /// Report drift without changing anything
    Validate,
    /// Report drift and add missing tables and columns
    Repair,
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Dump the database
    Create {
        /// Backup name (default: backup-<timestamp>-<suffix>)
        #[arg(long)]
        name: Option<BackupName>,
    },
    /// List complete backups, newest first
    List,
    /// Replace the database contents with a backup
    Restore {
        name: BackupName,
        /// Confirm that the current contents may be overwritten
        #[arg(long)]
        yes: bool,
    },
    /// Delete a backup
    Delete { name: BackupName },
}

fn init_tracing(pretty: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let _ = if pretty {
        builder.try_init()
    } else {
        builder.json().try_init()
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => error!(error = %e, "Could not read .env file"),
    }

    match commands::execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
