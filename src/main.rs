//! unidb - command-line entry point.
//!
//! Connects every configured backend, then runs one command against them.

use clap::Parser;
use serde_json::json;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use unidb::config::{Command, Config, StatementArgs};
use unidb::{ClientRegistry, DbError, DbResult, Params, QueryParam};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output.
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting unidb v{}", env!("CARGO_PKG_VERSION"));

    let registry = ClientRegistry::new();
    let result = run(&config, &registry).await;
    registry.close_all().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config, registry: &ClientRegistry) -> DbResult<()> {
    let backends = config.backends()?;
    if backends.is_empty() {
        return Err(DbError::configuration(
            "At least one database must be configured (--database URL, SQLITE_PATH, PG_* or MYSQL_*)",
        ));
    }

    info!(count = backends.len(), "Connecting to configured databases");
    for backend in &backends {
        registry.get_or_connect(backend).await?;
    }

    match config.command.as_ref().unwrap_or(&Command::Status) {
        Command::Status => status(registry).await,
        Command::Query(args) => {
            let client = client_for(registry, args)?;
            let rows = client.query(&args.sql, statement_params(args)).await?;
            print_json(&rows)
        }
        Command::Execute(args) => {
            let client = client_for(registry, args)?;
            let result = client.execute(&args.sql, statement_params(args)).await?;
            print_json(&result)
        }
    }
}

async fn status(registry: &ClientRegistry) -> DbResult<()> {
    let mut report = Vec::new();
    for client in registry.clients() {
        let latency = client.ping().await?;
        report.push(json!({
            "info": client.info(),
            "pingMs": latency.as_secs_f64() * 1000.0,
            "pool": client.status(),
        }));
    }
    print_json(&report)
}

fn client_for(registry: &ClientRegistry, args: &StatementArgs) -> DbResult<unidb::DbClient> {
    let db_type = args.database_type()?;
    registry
        .get(db_type)
        .ok_or_else(|| DbError::invalid_input(format!("{db_type} is not configured")))
}

fn statement_params(args: &StatementArgs) -> Params {
    Params::positional(args.params.iter().map(|raw| QueryParam::parse_lenient(raw)))
}

fn print_json<T: serde::Serialize>(value: &T) -> DbResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
