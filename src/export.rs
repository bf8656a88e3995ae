use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::model::{IndexEntry, Platform, Severity};
use crate::util::{format_cost, format_tokens};

pub const DEFAULT_MAX_RECORDS: usize = 100;
pub const SESSIONS_VIEW: &str = "sessions";

const CSV_HEADER: [&str; 8] = [
    "session_id",
    "date",
    "platform",
    "project",
    "tokens",
    "cost_usd",
    "smells",
    "active",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

/// Flat per-session row shared by every export format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub date: String,
    pub platform: Platform,
    pub project: String,
    pub tokens: u64,
    pub cost_usd: f64,
    pub smells: u64,
    pub active: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub smell_patterns: BTreeMap<String, u64>,
}

impl From<&IndexEntry> for SessionRecord {
    fn from(entry: &IndexEntry) -> Self {
        Self {
            session_id: entry.session_id.clone(),
            date: entry.started_local().format("%Y-%m-%d %H:%M").to_string(),
            platform: entry.platform,
            project: entry.project_label().to_string(),
            tokens: entry.totals.tokens,
            cost_usd: entry.totals.cost_usd,
            smells: entry.smell_count(),
            active: entry.active,
            smell_patterns: entry
                .smell_patterns()
                .into_iter()
                .map(|(pattern, count)| (pattern.to_string(), count))
                .collect(),
        }
    }
}

/// Keeps at most `max` records; the flag reports whether anything was cut.
pub fn truncate_records<T>(mut records: Vec<T>, max: usize) -> (Vec<T>, bool) {
    let truncated = records.len() > max;
    records.truncate(max);
    (records, truncated)
}

#[derive(Debug, Clone)]
pub struct ExportContext {
    pub view: String,
    pub filter_label: String,
    pub exported_at: NaiveDateTime,
}

impl ExportContext {
    pub fn sessions(filter_label: impl Into<String>, exported_at: NaiveDateTime) -> Self {
        Self {
            view: SESSIONS_VIEW.to_string(),
            filter_label: filter_label.into(),
            exported_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub content: String,
    pub record_count: usize,
    pub total_records: usize,
    pub truncated: bool,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    view: &'a str,
    exported_at: NaiveDateTime,
    filter_applied: &'a str,
    record_count: usize,
    total_records: usize,
    truncated: bool,
    records: &'a [SessionRecord],
}

pub fn export_sessions(
    entries: &[IndexEntry],
    format: ExportFormat,
    max_records: usize,
    ctx: &ExportContext,
) -> Result<ExportOutput> {
    let total_records = entries.len();
    let (records, truncated) =
        truncate_records(entries.iter().map(SessionRecord::from).collect(), max_records);

    let content = match format {
        ExportFormat::Csv => sessions_csv(&records)?,
        ExportFormat::Json => serde_json::to_string_pretty(&JsonExport {
            view: &ctx.view,
            exported_at: ctx.exported_at,
            filter_applied: &ctx.filter_label,
            record_count: records.len(),
            total_records,
            truncated,
            records: &records,
        })?,
        ExportFormat::Markdown => analysis_markdown(entries, &records, truncated, ctx),
    };

    Ok(ExportOutput {
        content,
        record_count: records.len(),
        total_records,
        truncated,
    })
}

/// Empty input produces an empty document, header included.
pub fn sessions_csv(records: &[SessionRecord]) -> Result<String> {
    if records.is_empty() {
        return Ok(String::new());
    }
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for record in records {
        let tokens = record.tokens.to_string();
        let cost = format!("{:.6}", record.cost_usd);
        let smells = record.smells.to_string();
        wtr.write_record([
            record.session_id.as_str(),
            record.date.as_str(),
            record.platform.as_str(),
            record.project.as_str(),
            tokens.as_str(),
            cost.as_str(),
            smells.as_str(),
            if record.active { "true" } else { "false" },
        ])?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|err| anyhow!("failed to flush CSV output: {}", err.error()))?;
    String::from_utf8(bytes).context("CSV output was not valid UTF-8")
}

struct PatternSummary {
    sessions: u64,
    occurrences: u64,
    severity: Severity,
}

fn analysis_markdown(
    entries: &[IndexEntry],
    records: &[SessionRecord],
    truncated: bool,
    ctx: &ExportContext,
) -> String {
    let mut markdown = String::new();
    markdown.push_str("# Token Audit Analysis\n\n");

    markdown.push_str("## Analysis Request\n\n");
    markdown.push_str(
        "Review the AI-assistant sessions below and identify where tokens are being wasted. \
         Focus on the detected patterns and the most expensive sessions.\n\n",
    );

    let total_tokens: u64 = entries.iter().map(|entry| entry.totals.tokens).sum();
    let total_cost: f64 = entries.iter().map(|entry| entry.totals.cost_usd).sum();
    let mut platforms: BTreeMap<&str, u64> = BTreeMap::new();
    for entry in entries {
        *platforms.entry(entry.platform.as_str()).or_insert(0) += 1;
    }

    markdown.push_str("## Data Summary\n\n");
    let _ = writeln!(markdown, "- Exported: {}", ctx.exported_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(markdown, "- Filter: {}", ctx.filter_label);
    let _ = writeln!(markdown, "- Sessions: {}", entries.len());
    let _ = writeln!(markdown, "- Total tokens: {}", format_tokens(total_tokens));
    let _ = writeln!(markdown, "- Total cost: {}", format_cost(total_cost));
    if !platforms.is_empty() {
        let breakdown: Vec<String> = platforms
            .iter()
            .map(|(platform, count)| format!("{platform} ({count})"))
            .collect();
        let _ = writeln!(markdown, "- Platforms: {}", breakdown.join(", "));
    }
    markdown.push('\n');

    markdown.push_str("## Sessions\n\n");
    if records.is_empty() {
        markdown.push_str("No sessions matched.\n\n");
    } else {
        markdown.push_str("| Date | Platform | Project | Tokens | Cost | Smells |\n");
        markdown.push_str("|------|----------|---------|--------|------|--------|\n");
        for record in records {
            let _ = writeln!(
                markdown,
                "| {} | {} | {} | {} | {} | {} |",
                record.date,
                record.platform,
                record.project,
                format_tokens(record.tokens),
                format_cost(record.cost_usd),
                record.smells
            );
        }
        if truncated {
            let _ = writeln!(
                markdown,
                "\n*Showing first {} of {} sessions.*",
                records.len(),
                entries.len()
            );
        }
        markdown.push('\n');
    }

    markdown.push_str("## Detected Patterns\n\n");
    let mut patterns: BTreeMap<&str, PatternSummary> = BTreeMap::new();
    for entry in entries {
        for (pattern, count) in entry.smell_patterns() {
            let severity = entry
                .smells
                .iter()
                .filter(|smell| smell.pattern == pattern)
                .map(|smell| smell.severity)
                .max()
                .unwrap_or_default();
            let summary = patterns.entry(pattern).or_insert(PatternSummary {
                sessions: 0,
                occurrences: 0,
                severity,
            });
            summary.sessions += 1;
            summary.occurrences += count;
            summary.severity = summary.severity.max(severity);
        }
    }
    if patterns.is_empty() {
        markdown.push_str("No usage smells detected.\n\n");
    } else {
        for (pattern, summary) in &patterns {
            let _ = writeln!(
                markdown,
                "- **{pattern}** {} {}: {} occurrences across {} sessions",
                summary.severity.indicator(),
                summary.severity.as_str(),
                summary.occurrences,
                summary.sessions
            );
        }
        markdown.push('\n');
    }

    markdown.push_str("## Recommendations Requested\n\n");
    markdown.push_str("1. Which patterns cost the most tokens, and how can they be avoided?\n");
    markdown.push_str("2. Which projects or platforms show unusual spend?\n");
    markdown.push_str("3. What workflow changes would reduce cost without losing capability?\n");
    markdown
}

/// `token-audit-{view}-{YYYYmmdd_HHMMSS}.{ext}`
pub fn export_filename(view: &str, format: ExportFormat, now: NaiveDateTime) -> String {
    format!(
        "token-audit-{view}-{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

pub fn default_export_path(
    dir: &Path,
    view: &str,
    format: ExportFormat,
    now: NaiveDateTime,
) -> PathBuf {
    dir.join(export_filename(view, format, now))
}

pub fn write_export(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create export directory {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}
