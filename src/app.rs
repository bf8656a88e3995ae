use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::analytics::{
    self, AnalyticsReport, PeriodKind, SmellTrendsReport, UsageTrend, build_report, smell_trends,
};
use crate::cli::FilterArgs;
use crate::config::{self, AuditConfig};
use crate::error::StorageError;
use crate::export::{
    ExportContext, ExportFormat, SESSIONS_VIEW, default_export_path, export_sessions, write_export,
};
use crate::filter::SessionFilter;
use crate::model::{Event, IndexEntry, Platform, Smell};
use crate::storage::{DeleteOutcome, IndexState, SessionStorage, SessionWriter};
use crate::util::{age, format_cost, format_local, format_tokens, progress_bar, truncate};

const SIGINT_EXIT_CODE: i32 = 130;

pub fn open_storage(config: &AuditConfig) -> Result<SessionStorage> {
    let base_dir = config.storage_dir();
    SessionStorage::open(base_dir.clone(), config.storage_options())
        .with_context(|| format!("failed to open storage at {}", base_dir.display()))
}

/// Event line as accepted on stdin; the timestamp defaults to arrival time.
#[derive(Debug, Deserialize)]
struct IncomingEvent {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    tool: String,
    #[serde(default)]
    tokens: u64,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    smells: Vec<Smell>,
}

pub fn parse_event_line(line: &str) -> Result<Event> {
    let incoming: IncomingEvent = serde_json::from_str(line).context("invalid event JSON")?;
    Ok(Event {
        timestamp: incoming.timestamp.unwrap_or_else(Utc::now),
        tool: incoming.tool,
        tokens: incoming.tokens,
        cost_usd: incoming.cost_usd,
        model: incoming.model.filter(|model| !model.trim().is_empty()),
        smells: incoming.smells,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub appended: u64,
    pub skipped: u64,
}

/// Appends every event line from `reader`. Stops early once the shared
/// writer has been taken (interrupt handler finalized it).
pub fn record_events<R: BufRead>(
    writer: &Mutex<Option<SessionWriter>>,
    reader: R,
) -> Result<RecordStats> {
    let mut stats = RecordStats::default();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("failed to read event from stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = match parse_event_line(trimmed) {
            Ok(event) => event,
            Err(err) => {
                warn!(line = idx + 1, error = %format!("{err:#}"), "skipping malformed event");
                stats.skipped += 1;
                continue;
            }
        };

        let mut guard = writer
            .lock()
            .map_err(|_| anyhow!("session writer lock poisoned"))?;
        let Some(active) = guard.as_mut() else {
            debug!("writer already finalized; stopping");
            break;
        };
        active.append(event)?;
        stats.appended += 1;
    }
    Ok(stats)
}

pub fn record(
    storage: &SessionStorage,
    session: &str,
    platform: Platform,
    project: Option<&str>,
) -> Result<u8> {
    let writer = storage
        .open_for_writing(session, platform, project)
        .with_context(|| format!("failed to open session {session} for writing"))?;
    let shared = Arc::new(Mutex::new(Some(writer)));
    install_interrupt_finalizer(Arc::clone(&shared))?;

    let stats = record_events(&shared, io::stdin().lock())?;

    let mut guard = shared
        .lock()
        .map_err(|_| anyhow!("session writer lock poisoned"))?;
    if let Some(mut writer) = guard.take() {
        writer
            .finalize()
            .with_context(|| format!("failed to finalize session {session}"))?;
        let totals = writer.totals();
        println!(
            "session {session}: {} events appended ({} skipped), {} tokens, {}",
            stats.appended,
            stats.skipped,
            format_tokens(totals.tokens),
            format_cost(totals.cost_usd)
        );
    }
    Ok(0)
}

fn install_interrupt_finalizer(shared: Arc<Mutex<Option<SessionWriter>>>) -> Result<()> {
    ctrlc::set_handler(move || {
        if let Ok(mut guard) = shared.lock()
            && let Some(mut writer) = guard.take()
            && let Err(err) = writer.finalize()
        {
            warn!(session_id = %writer.session_id(), error = %err, "failed to finalize on interrupt");
        }
        std::process::exit(SIGINT_EXIT_CODE);
    })
    .context("failed to install Ctrl+C handler")
}

pub fn build_filter(args: &FilterArgs, now: NaiveDateTime) -> SessionFilter {
    let mut filter = SessionFilter {
        platform: args.platform,
        project: args.project.clone(),
        active_only: args.active,
        ..SessionFilter::default()
    };
    if let Some(preset) = args.preset {
        filter = filter.with_preset(preset, now);
    }
    filter
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn list(storage: &SessionStorage, args: &FilterArgs) -> Result<()> {
    let now = now_local();
    let filter = build_filter(args, now);
    let entries = storage.list(&filter)?;
    if entries.is_empty() {
        println!("No sessions match filter: {}", filter.describe(now));
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:<11} {:<18} {:>8} {:>9} {:>6}  {}",
        "SESSION", "STARTED", "PLATFORM", "PROJECT", "TOKENS", "COST", "SMELLS", "ACTIVE"
    );
    for entry in &entries {
        println!(
            "{:<24} {:<16} {:<11} {:<18} {:>8} {:>9} {:>6}  {}",
            truncate(&entry.session_id, 24),
            format_local(entry.started_at),
            entry.platform.as_str(),
            truncate(entry.project_label(), 18),
            format_tokens(entry.totals.tokens),
            format_cost(entry.totals.cost_usd),
            entry.smell_count(),
            if entry.active { "yes" } else { "" }
        );
    }
    let tokens: u64 = entries.iter().map(|entry| entry.totals.tokens).sum();
    let cost: f64 = entries.iter().map(|entry| entry.totals.cost_usd).sum();
    println!(
        "{} sessions, {} tokens, {} (filter: {})",
        entries.len(),
        format_tokens(tokens),
        format_cost(cost),
        filter.describe(now)
    );
    Ok(())
}

pub fn show(storage: &SessionStorage, session: &str, with_events: bool) -> Result<()> {
    let summary = storage
        .summary(session)
        .with_context(|| format!("failed to load session {session}"))?;
    print_summary(&summary);

    if with_events {
        println!("events:");
        for event in storage.read(session)? {
            let event = event?;
            let smells: Vec<&str> = event.smells.iter().map(|s| s.pattern.as_str()).collect();
            println!(
                "  {}  {:<28} {:>8} {:>9}{}{}",
                format_local(event.timestamp),
                truncate(&event.tool, 28),
                format_tokens(event.tokens),
                format_cost(event.cost_usd.unwrap_or(0.0)),
                event
                    .model
                    .as_deref()
                    .map(|model| format!("  [{model}]"))
                    .unwrap_or_default(),
                if smells.is_empty() {
                    String::new()
                } else {
                    format!("  smells: {}", smells.join(","))
                }
            );
        }
    }
    Ok(())
}

fn print_summary(entry: &IndexEntry) {
    println!("session: {}", entry.session_id);
    println!("platform: {}", entry.platform);
    println!("project: {}", entry.project_label());
    println!("started: {}", format_local(entry.started_at));
    println!(
        "updated: {} ({} ago)",
        format_local(entry.updated_at),
        age(entry.updated_at)
    );
    println!("active: {}", entry.active);
    println!("events: {}", entry.totals.events);
    println!("tokens: {}", format_tokens(entry.totals.tokens));
    println!("cost: {}", format_cost(entry.totals.cost_usd));
    if !entry.models.is_empty() {
        println!("models:");
        for (model, tokens) in &entry.models {
            println!("  - {model}: {}", format_tokens(*tokens));
        }
    }
    if !entry.smells.is_empty() {
        println!("smells:");
        for smell in &entry.smells {
            println!(
                "  - {} {} on {} x{}",
                smell.severity.indicator(),
                smell.pattern,
                smell.tool,
                smell.count
            );
        }
    }
}

pub fn delete(storage: &SessionStorage, session: &str, yes: bool) -> Result<u8> {
    if storage.has_active_session(session)? {
        return Err(StorageError::SessionBusy(session.to_string()).into());
    }
    if !yes && !confirm(&format!("Delete session {session} and its log?"))? {
        println!("Aborted.");
        return Ok(1);
    }
    match storage.delete_session(session)? {
        DeleteOutcome::Deleted => println!("Deleted session {session}."),
        DeleteOutcome::AlreadyAbsent => println!("Session {session} was already absent."),
    }
    Ok(0)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush().context("failed to flush prompt")?;
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

pub fn analytics(
    storage: &SessionStorage,
    period: PeriodKind,
    by_project: bool,
    markdown: bool,
    json: bool,
    args: &FilterArgs,
) -> Result<()> {
    let now = now_local();
    let entries = storage.list(&build_filter(args, now))?;
    let report = build_report(&entries, period, now);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if markdown {
        print!("{}", analytics::report_markdown(&report));
    } else {
        print_report(&report, by_project);
    }
    Ok(())
}

fn print_report(report: &AnalyticsReport, by_project: bool) {
    println!("Usage by {} period", report.period_type.as_str());
    println!(
        "{:<16} {:>8} {:>9} {:>9} {:>6}  {}",
        "PERIOD", "SESSIONS", "TOKENS", "COST", "SMELLS", "TREND"
    );
    for row in &report.rows {
        println!(
            "{:<16} {:>8} {:>9} {:>9} {:>6}  {}",
            row.label,
            row.sessions,
            format_tokens(row.tokens),
            format_cost(row.cost_usd),
            row.smells,
            row.trend.map_or("", UsageTrend::symbol)
        );
    }
    println!(
        "total: {} sessions, {} tokens, {}",
        report.totals.sessions,
        format_tokens(report.totals.tokens),
        format_cost(report.totals.cost_usd)
    );

    if by_project && !report.projects.is_empty() {
        println!();
        println!("By project");
        for group in &report.projects {
            println!(
                "{:<20} {} {:>5.1}%  {:>9} {:>9}  ({} sessions)",
                truncate(&group.project, 20),
                progress_bar(group.cost_share, 20),
                group.cost_share,
                format_tokens(group.tokens),
                format_cost(group.cost_usd),
                group.sessions
            );
        }
    }

    if !report.top_models.is_empty() {
        println!();
        println!("Top models");
        for model in &report.top_models {
            println!(
                "  {:<28} {:>9} {:>5.1}%",
                truncate(&model.model, 28),
                format_tokens(model.tokens),
                model.share
            );
        }
    }
}

pub fn smells(storage: &SessionStorage, days: u32, markdown: bool, json: bool) -> Result<()> {
    let entries = storage.list(&SessionFilter::default())?;
    let report = smell_trends(&entries, days, now_local().date());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if markdown {
        print!("{}", analytics::smells_markdown(&report));
    } else {
        print_smells(&report);
    }
    Ok(())
}

fn print_smells(report: &SmellTrendsReport) {
    println!(
        "Smell trends, last {} days: {} sessions, {} with smells, {} patterns",
        report.days,
        report.summary.total_sessions,
        report.summary.sessions_with_smells,
        report.summary.unique_patterns
    );
    if report.patterns.is_empty() {
        println!("No smells detected.");
        return;
    }
    println!(
        "{:<24} {:>6}  {:<12} {:<13} {:<24} {:>5}",
        "PATTERN", "FREQ", "TREND", "SEVERITY", "TOP TOOL", "COUNT"
    );
    for stats in &report.patterns {
        println!(
            "{:<24} {:>5.1}%  {} {:<10} {} {:<9} {:<24} {:>5}",
            truncate(&stats.pattern, 24),
            stats.frequency,
            stats.trend.symbol(),
            stats.trend.as_str(),
            stats.severity.indicator(),
            stats.severity.as_str(),
            truncate(stats.top_tool.as_deref().unwrap_or("-"), 24),
            stats.occurrences
        );
    }
}

pub fn export(
    storage: &SessionStorage,
    format: ExportFormat,
    max: usize,
    output: Option<PathBuf>,
    to_stdout: bool,
    args: &FilterArgs,
) -> Result<()> {
    let now = now_local();
    let filter = build_filter(args, now);
    let entries = storage.list(&filter)?;
    let ctx = ExportContext::sessions(filter.describe(now), now);
    let exported = export_sessions(&entries, format, max, &ctx)?;

    if to_stdout {
        print!("{}", exported.content);
        return Ok(());
    }

    let path = output
        .unwrap_or_else(|| default_export_path(&config::exports_dir(), SESSIONS_VIEW, format, now));
    write_export(&path, &exported.content)?;
    println!(
        "Exported {} of {} sessions to {}",
        exported.record_count,
        exported.total_records,
        path.display()
    );
    if exported.truncated {
        println!("Output truncated; raise --max to include more sessions.");
    }
    Ok(())
}

pub fn rebuild_index(storage: &SessionStorage) -> Result<()> {
    let count = storage.rebuild_index()?;
    let reaped = storage.reap_stale()?;
    println!("Rebuilt index with {count} sessions.");
    if reaped > 0 {
        println!("Marked {reaped} crashed sessions inactive.");
    }
    Ok(())
}

pub fn print_status(config: &AuditConfig, storage: &SessionStorage) -> Result<()> {
    let snapshot = storage.index().snapshot()?;
    let index_state = match snapshot.state {
        IndexState::Loaded => "ok",
        IndexState::Missing => "missing",
        IndexState::Corrupt => "corrupt",
    };
    let entries = storage.list(&SessionFilter::default())?;
    let active: Vec<&IndexEntry> = entries.iter().filter(|entry| entry.active).collect();

    println!("token-audit status");
    println!("data_home: {}", config::data_home().display());
    println!("config: {}", config::config_path().display());
    println!("storage: {}", storage.base_dir().display());
    println!(
        "index: {index_state} ({} entries)",
        snapshot.file.sessions.len()
    );
    println!(
        "lock_timeout: {}ms",
        config.storage_options().lock_timeout.as_millis()
    );
    println!("sessions: {}", entries.len());
    println!("active_sessions: {}", active.len());
    for entry in active {
        println!(
            "  - {} ({}, {}) {} tokens, updated {} ago",
            entry.session_id,
            entry.platform,
            entry.project_label(),
            format_tokens(entry.totals.tokens),
            age(entry.updated_at)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DatePreset;
    use crate::model::Severity;
    use crate::storage::StorageOptions;
    use chrono::NaiveDate;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn event_line_defaults_timestamp_and_blank_model() {
        let event = parse_event_line(
            r#"{"tool":"mcp__zen__chat","tokens":1200,"model":" ","smells":[{"pattern":"MANY_SMALL_CALLS","severity":"high"}]}"#,
        )
        .expect("parse");
        assert_eq!(event.tool, "mcp__zen__chat");
        assert_eq!(event.tokens, 1200);
        assert_eq!(event.model, None);
        assert_eq!(event.smells[0].severity, Severity::High);
        assert!(parse_event_line(r#"{"tokens":5}"#).is_err());
    }

    #[test]
    fn filter_args_map_to_session_filter() {
        let now = NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let args = FilterArgs {
            preset: Some(DatePreset::Last7Days),
            platform: Some(Platform::GeminiCli),
            project: Some("api".to_string()),
            active: true,
        };
        let filter = build_filter(&args, now);
        assert_eq!(filter.platform, Some(Platform::GeminiCli));
        assert!(filter.active_only);
        assert_eq!(filter.describe(now), "Last 7d, gemini-cli, project api, active only");
        assert!(build_filter(&FilterArgs::default(), now).is_empty());
    }

    #[test]
    fn record_events_appends_and_skips_malformed_lines() {
        let tmp = TempDir::new().expect("temp dir");
        let storage = SessionStorage::open(
            tmp.path(),
            StorageOptions {
                lock_timeout: Duration::from_millis(500),
                ..StorageOptions::default()
            },
        )
        .expect("open storage");
        let writer = storage
            .open_for_writing("cli-1", Platform::ClaudeCode, Some("api"))
            .expect("open writer");
        let shared = Mutex::new(Some(writer));

        let input = concat!(
            "{\"tool\":\"Read\",\"tokens\":100}\n",
            "\n",
            "not json\n",
            "{\"tool\":\"Bash\",\"tokens\":50,\"cost_usd\":0.01}\n",
        );
        let stats = record_events(&shared, Cursor::new(input)).expect("record");
        assert_eq!(stats, RecordStats { appended: 2, skipped: 1 });

        let mut writer = shared.lock().unwrap().take().expect("writer");
        writer.finalize().expect("finalize");
        let summary = storage.summary("cli-1").expect("summary");
        assert_eq!(summary.totals.tokens, 150);
        assert_eq!(summary.totals.events, 2);
        assert!(!summary.active);
    }

    #[test]
    fn record_events_stops_once_writer_taken() {
        let shared: Mutex<Option<SessionWriter>> = Mutex::new(None);
        let stats = record_events(&shared, Cursor::new("{\"tool\":\"Read\"}\n")).expect("record");
        assert_eq!(stats.appended, 0);
    }
}
