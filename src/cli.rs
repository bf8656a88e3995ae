use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::analytics::{DEFAULT_SMELL_DAYS, PeriodKind};
use crate::export::{DEFAULT_MAX_RECORDS, ExportFormat};
use crate::filter::DatePreset;
use crate::model::Platform;

#[derive(Parser, Debug)]
#[command(
    name = "token-audit",
    version,
    about = "Record and analyze token usage of AI-assistant tool-call sessions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Append JSON events from stdin (one per line) to a session, finalizing on EOF.
    Record {
        #[arg(long)]
        session: String,
        #[arg(long, value_enum)]
        platform: Platform,
        #[arg(long)]
        project: Option<String>,
    },
    /// List recorded sessions, newest first.
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show one session, recomputed from its log.
    Show {
        session: String,
        /// Print every recorded event.
        #[arg(long)]
        events: bool,
    },
    /// Delete an inactive session and its log.
    Delete {
        session: String,
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Usage aggregated by period, project and model.
    Analytics {
        #[arg(long, value_enum, default_value_t = PeriodKind::Daily)]
        period: PeriodKind,
        #[arg(long)]
        by_project: bool,
        /// Print the report as Markdown.
        #[arg(long, conflicts_with = "json")]
        markdown: bool,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Smell frequency and trends over the last N days.
    Smells {
        #[arg(long, default_value_t = DEFAULT_SMELL_DAYS, value_parser = clap::value_parser!(u32).range(1..=365))]
        days: u32,
        #[arg(long, conflicts_with = "json")]
        markdown: bool,
        #[arg(long)]
        json: bool,
    },
    /// Export sessions as CSV, JSON or a Markdown analysis document.
    Export {
        #[arg(long, value_enum)]
        format: ExportFormat,
        #[arg(long, default_value_t = DEFAULT_MAX_RECORDS)]
        max: usize,
        /// Output file; defaults to a timestamped file in the exports directory.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write to stdout instead of a file.
        #[arg(long, conflicts_with = "output")]
        stdout: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Rebuild the session index from the session logs.
    RebuildIndex,
    /// Print storage paths, session counts and active writers.
    Status,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    #[arg(long, value_enum)]
    pub preset: Option<DatePreset>,
    #[arg(long, value_enum)]
    pub platform: Option<Platform>,
    #[arg(long)]
    pub project: Option<String>,
    /// Only sessions with a live writer.
    #[arg(long)]
    pub active: bool,
}
