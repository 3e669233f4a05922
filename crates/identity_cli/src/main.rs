//! CLI entry point for identity resolution.
//!
//! # Responsibility
//! - Resolve identities against a SQLite contact store from the shell.
//! - Print results as JSON using the identify response shape.

use clap::{Parser, Subcommand};
use identity_core::db::{open_db, open_db_in_memory};
use identity_core::{
    core_version, init_logging, IdentifyRequest, IdentityConfig, IdentityError, IdentityService,
    SqliteContactStore,
};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "identity_cli", about = "Resolve contact identities", version)]
struct Cli {
    /// SQLite database file. Overrides `db_path` from the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// trace|debug|info|warn|error
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Absolute directory for rolling log files. Logs go to stderr otherwise.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number.
    Identify {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Resolve a JSON body: {"email": ..., "phoneNumber": ...}.
    IdentifyJson { body: String },
    /// Show the cluster containing a contact id.
    Cluster { contact_id: i64 },
    /// Print the core version.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<String, String> {
    if matches!(cli.command, Command::Version) {
        return Ok(version_line());
    }

    let config = load_config(&cli)?;
    init_logging(&config.log_level, config.log_dir.as_deref())?;

    let conn = match &config.db_path {
        Some(path) => open_db(path),
        None => open_db_in_memory(),
    }
    .map_err(|err| format!("failed to open contact store: {err}"))?;
    let store = SqliteContactStore::try_new(&conn).map_err(|err| err.to_string())?;
    let service = IdentityService::with_config(store, &config);

    let value = match cli.command {
        Command::Identify { email, phone } => {
            let request = IdentifyRequest {
                email,
                phone_number: phone,
            };
            service
                .identify(&request)
                .map_err(report)
                .and_then(|response| to_json(&response))?
        }
        Command::IdentifyJson { body } => {
            let request: IdentifyRequest =
                serde_json::from_str(&body).map_err(|err| format!("invalid request body: {err}"))?;
            service
                .identify(&request)
                .map_err(report)
                .and_then(|response| to_json(&response))?
        }
        Command::Cluster { contact_id } => service
            .cluster_view(contact_id)
            .map_err(report)
            .and_then(|view| to_json(&view))?,
        Command::Version => version_line(),
    };
    Ok(value)
}

fn version_line() -> String {
    format!("identity_core version={}", core_version())
}

fn load_config(cli: &Cli) -> Result<IdentityConfig, String> {
    let mut config = match &cli.config {
        Some(path) => IdentityConfig::load(path).map_err(|err| err.to_string())?,
        None => IdentityConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = Some(dir.clone());
    }
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

fn report(err: IdentityError) -> String {
    error!("event=cli_command module=cli status=error error={err}");
    format!("{}: {err}", error_kind(&err))
}

fn error_kind(err: &IdentityError) -> &'static str {
    match err {
        IdentityError::InvalidInput(_) | IdentityError::NotFound(_) => "client_error",
        IdentityError::ConflictRetry { .. } => "transient_failure",
        IdentityError::InconsistentState(_) => "data_integrity_failure",
        IdentityError::StorageUnavailable(_) => "dependency_failure",
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|err| format!("failed to encode output: {err}"))
}
