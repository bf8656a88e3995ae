use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use token_audit::app;
use token_audit::cli::{Cli, Commands};
use token_audit::config::AuditConfig;
use token_audit::error::StorageError;
use token_audit::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("token-audit error: {err:#}");
            if is_retryable(&err) {
                eprintln!("storage is busy; retry shortly");
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StorageError>()
            .is_some_and(StorageError::is_retryable)
    })
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = AuditConfig::load_or_init()?;
    let storage = app::open_storage(&config)?;

    match cli.command {
        Commands::Record {
            session,
            platform,
            project,
        } => app::record(&storage, &session, platform, project.as_deref()),
        Commands::List { filter } => {
            app::list(&storage, &filter)?;
            Ok(0)
        }
        Commands::Show { session, events } => {
            app::show(&storage, &session, events)?;
            Ok(0)
        }
        Commands::Delete { session, yes } => app::delete(&storage, &session, yes),
        Commands::Analytics {
            period,
            by_project,
            markdown,
            json,
            filter,
        } => {
            app::analytics(&storage, period, by_project, markdown, json, &filter)?;
            Ok(0)
        }
        Commands::Smells {
            days,
            markdown,
            json,
        } => {
            app::smells(&storage, days, markdown, json)?;
            Ok(0)
        }
        Commands::Export {
            format,
            max,
            output,
            stdout,
            filter,
        } => {
            app::export(&storage, format, max, output, stdout, &filter)?;
            Ok(0)
        }
        Commands::RebuildIndex => {
            app::rebuild_index(&storage)?;
            Ok(0)
        }
        Commands::Status => {
            app::print_status(&config, &storage)?;
            Ok(0)
        }
    }
}
