use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::model::{IndexEntry, Severity};
use crate::util::{format_cost, format_tokens};

/// Relative change beyond which a trend counts as moving. Fixed, not configurable.
const TREND_BAND: f64 = 0.10;

const DAILY_BUCKETS: i64 = 14;
const WEEKLY_BUCKETS: i64 = 8;
const MONTHLY_BUCKETS: u32 = 6;
const TOP_MODELS: usize = 3;

pub const SMELL_DAY_OPTIONS: [u32; 4] = [7, 14, 30, 90];
pub const DEFAULT_SMELL_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl PeriodKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Bucket bounds, oldest first, ending with the bucket containing `today`.
    pub fn windows(self, today: NaiveDate) -> Vec<(String, NaiveDate, NaiveDate)> {
        match self {
            Self::Daily => (0..DAILY_BUCKETS)
                .rev()
                .map(|back| {
                    let day = today - Duration::days(back);
                    (day.format("%Y-%m-%d").to_string(), day, day)
                })
                .collect(),
            Self::Weekly => (0..WEEKLY_BUCKETS)
                .rev()
                .map(|back| {
                    let end = today - Duration::days(back * 7);
                    let start = end - Duration::days(6);
                    (format!("Week of {}", start.format("%b %d")), start, end)
                })
                .collect(),
            Self::Monthly => {
                let this_month = today - Duration::days(i64::from(today.day0()));
                (0..MONTHLY_BUCKETS)
                    .rev()
                    .filter_map(|back| {
                        let start = this_month.checked_sub_months(Months::new(back))?;
                        let end = if back == 0 {
                            today
                        } else {
                            start.checked_add_months(Months::new(1))? - Duration::days(1)
                        };
                        Some((start.format("%Y-%m").to_string(), start, end))
                    })
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTrend {
    Up,
    Down,
    Stable,
}

impl UsageTrend {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Up => "↑",
            Self::Down => "↓",
            Self::Stable => "→",
        }
    }
}

pub fn classify_usage_trend(current: f64, previous: f64) -> UsageTrend {
    if current > previous * (1.0 + TREND_BAND) {
        UsageTrend::Up
    } else if current < previous * (1.0 - TREND_BAND) {
        UsageTrend::Down
    } else {
        UsageTrend::Stable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmellTrend {
    Worsening,
    Improving,
    Stable,
}

impl SmellTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worsening => "worsening",
            Self::Improving => "improving",
            Self::Stable => "stable",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Worsening => "▲",
            Self::Improving => "▼",
            Self::Stable => "→",
        }
    }
}

/// Compares two frequency percentages using the fixed ±10% band.
pub fn classify_smell_trend(current: f64, previous: f64) -> SmellTrend {
    match classify_usage_trend(current, previous) {
        UsageTrend::Up => SmellTrend::Worsening,
        UsageTrend::Down => SmellTrend::Improving,
        UsageTrend::Stable => SmellTrend::Stable,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodBucket {
    #[serde(rename = "period")]
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub sessions: u64,
    pub tokens: u64,
    #[serde(rename = "cost")]
    pub cost_usd: f64,
    pub smells: u64,
    pub trend: Option<UsageTrend>,
}

pub fn aggregate_by_period(
    entries: &[IndexEntry],
    kind: PeriodKind,
    today: NaiveDate,
) -> Vec<PeriodBucket> {
    let mut buckets: Vec<PeriodBucket> = kind
        .windows(today)
        .into_iter()
        .map(|(label, start, end)| PeriodBucket {
            label,
            start,
            end,
            sessions: 0,
            tokens: 0,
            cost_usd: 0.0,
            smells: 0,
            trend: None,
        })
        .collect();

    for entry in entries {
        let day = entry.started_date();
        if let Some(bucket) = buckets
            .iter_mut()
            .find(|bucket| bucket.start <= day && day <= bucket.end)
        {
            bucket.sessions += 1;
            bucket.tokens += entry.totals.tokens;
            bucket.cost_usd += entry.totals.cost_usd;
            bucket.smells += entry.smell_count();
        }
    }

    for idx in 1..buckets.len() {
        let previous = buckets[idx - 1].tokens as f64;
        buckets[idx].trend = Some(classify_usage_trend(buckets[idx].tokens as f64, previous));
    }
    buckets
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectGroup {
    pub project: String,
    pub sessions: u64,
    pub tokens: u64,
    pub cost_usd: f64,
    /// Percentage of total cost; 0 when total cost is 0.
    pub cost_share: f64,
}

/// Groups by project (missing projects share one bucket), costliest first.
pub fn group_by_project(entries: &[IndexEntry]) -> Vec<ProjectGroup> {
    let mut grouped: BTreeMap<&str, ProjectGroup> = BTreeMap::new();
    for entry in entries {
        let label = entry.project_label();
        let group = grouped.entry(label).or_insert_with(|| ProjectGroup {
            project: label.to_string(),
            sessions: 0,
            tokens: 0,
            cost_usd: 0.0,
            cost_share: 0.0,
        });
        group.sessions += 1;
        group.tokens += entry.totals.tokens;
        group.cost_usd += entry.totals.cost_usd;
    }

    let total_cost: f64 = grouped.values().map(|group| group.cost_usd).sum();
    let mut groups: Vec<ProjectGroup> = grouped.into_values().collect();
    for group in &mut groups {
        group.cost_share = percentage(group.cost_usd, total_cost);
    }
    groups.sort_by(|a, b| {
        b.cost_usd
            .total_cmp(&a.cost_usd)
            .then_with(|| a.project.cmp(&b.project))
    });
    groups
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub tokens: u64,
    pub share: f64,
}

/// Models by token volume, largest first.
pub fn top_models(entries: &[IndexEntry], limit: usize) -> Vec<ModelUsage> {
    let mut by_model: BTreeMap<&str, u64> = BTreeMap::new();
    for entry in entries {
        for (model, tokens) in &entry.models {
            *by_model.entry(model.as_str()).or_insert(0) += tokens;
        }
    }
    let total: u64 = by_model.values().sum();
    let mut models: Vec<ModelUsage> = by_model
        .into_iter()
        .map(|(model, tokens)| ModelUsage {
            model: model.to_string(),
            tokens,
            share: percentage(tokens as f64, total as f64),
        })
        .collect();
    models.sort_by(|a, b| b.tokens.cmp(&a.tokens).then_with(|| a.model.cmp(&b.model)));
    models.truncate(limit);
    models
}

/// Tool with the most occurrences; ties go to the lexicographically smallest name.
pub fn top_tool(tool_counts: &BTreeMap<String, u64>) -> Option<String> {
    let mut best: Option<(&String, u64)> = None;
    for (tool, count) in tool_counts {
        if best.is_none_or(|(_, best_count)| *count > best_count) {
            best = Some((tool, *count));
        }
    }
    best.map(|(tool, _)| tool.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsTotals {
    pub sessions: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsReport {
    pub period_type: PeriodKind,
    pub generated_at: NaiveDateTime,
    pub totals: AnalyticsTotals,
    pub rows: Vec<PeriodBucket>,
    pub projects: Vec<ProjectGroup>,
    pub top_models: Vec<ModelUsage>,
}

pub fn build_report(entries: &[IndexEntry], kind: PeriodKind, now: NaiveDateTime) -> AnalyticsReport {
    let rows = aggregate_by_period(entries, kind, now.date());
    let totals = AnalyticsTotals {
        sessions: rows.iter().map(|row| row.sessions).sum(),
        tokens: rows.iter().map(|row| row.tokens).sum(),
        cost_usd: rows.iter().map(|row| row.cost_usd).sum(),
    };
    AnalyticsReport {
        period_type: kind,
        generated_at: now,
        totals,
        rows,
        projects: group_by_project(entries),
        top_models: top_models(entries, TOP_MODELS),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmellSummary {
    pub total_sessions: u64,
    pub sessions_with_smells: u64,
    pub unique_patterns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmellPatternStats {
    pub pattern: String,
    /// Percentage of sessions in the window showing the pattern.
    pub frequency: f64,
    pub previous_frequency: f64,
    pub trend: SmellTrend,
    pub severity: Severity,
    pub top_tool: Option<String>,
    pub occurrences: u64,
    pub sessions_affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmellTrendsReport {
    pub days: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub summary: SmellSummary,
    pub patterns: Vec<SmellPatternStats>,
}

#[derive(Default)]
struct PatternWindow {
    sessions_affected: u64,
    occurrences: u64,
    severity: Option<Severity>,
    tools: BTreeMap<String, u64>,
}

#[derive(Default)]
struct WindowStats {
    total_sessions: u64,
    sessions_with_smells: u64,
    patterns: BTreeMap<String, PatternWindow>,
}

impl WindowStats {
    fn collect(entries: &[IndexEntry], start: NaiveDate, end: NaiveDate) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            let day = entry.started_date();
            if day < start || day > end {
                continue;
            }
            stats.total_sessions += 1;
            if !entry.smells.is_empty() {
                stats.sessions_with_smells += 1;
            }
            let mut seen = BTreeSet::new();
            for smell in &entry.smells {
                let window = stats.patterns.entry(smell.pattern.clone()).or_default();
                if seen.insert(smell.pattern.as_str()) {
                    window.sessions_affected += 1;
                }
                window.occurrences += smell.count;
                window.severity = Some(window.severity.map_or(smell.severity, |s| s.max(smell.severity)));
                *window.tools.entry(smell.tool.clone()).or_insert(0) += smell.count;
            }
        }
        stats
    }

    fn frequency(&self, pattern: &str) -> f64 {
        let affected = self
            .patterns
            .get(pattern)
            .map_or(0, |window| window.sessions_affected);
        percentage(affected as f64, self.total_sessions as f64)
    }
}

/// Smell statistics for the last `days` days, with trends measured against
/// the equally long window immediately before it.
pub fn smell_trends(entries: &[IndexEntry], days: u32, today: NaiveDate) -> SmellTrendsReport {
    // Windows saturate at the earliest representable date.
    let back = Duration::days(i64::from(days.max(1)) - 1);
    let start = today.checked_sub_signed(back).unwrap_or(NaiveDate::MIN);
    let previous_end = start.pred_opt().unwrap_or(NaiveDate::MIN);
    let previous_start = previous_end
        .checked_sub_signed(back)
        .unwrap_or(NaiveDate::MIN);

    let current = WindowStats::collect(entries, start, today);
    let previous = WindowStats::collect(entries, previous_start, previous_end);

    let names: BTreeSet<&String> = current
        .patterns
        .keys()
        .chain(previous.patterns.keys())
        .collect();
    let mut patterns: Vec<SmellPatternStats> = names
        .into_iter()
        .map(|pattern| {
            let frequency = current.frequency(pattern);
            let previous_frequency = previous.frequency(pattern);
            let now_window = current.patterns.get(pattern);
            let severity = now_window
                .and_then(|window| window.severity)
                .or_else(|| previous.patterns.get(pattern).and_then(|window| window.severity))
                .unwrap_or_default();
            SmellPatternStats {
                pattern: pattern.clone(),
                frequency,
                previous_frequency,
                trend: classify_smell_trend(frequency, previous_frequency),
                severity,
                top_tool: now_window.and_then(|window| top_tool(&window.tools)),
                occurrences: now_window.map_or(0, |window| window.occurrences),
                sessions_affected: now_window.map_or(0, |window| window.sessions_affected),
            }
        })
        .collect();
    patterns.sort_by(|a, b| {
        b.frequency
            .total_cmp(&a.frequency)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });

    SmellTrendsReport {
        days,
        start,
        end: today,
        summary: SmellSummary {
            total_sessions: current.total_sessions,
            sessions_with_smells: current.sessions_with_smells,
            unique_patterns: current.patterns.len() as u64,
        },
        patterns,
    }
}

fn percentage(part: f64, total: f64) -> f64 {
    if total > 0.0 { part / total * 100.0 } else { 0.0 }
}

pub fn report_markdown(report: &AnalyticsReport) -> String {
    let mut markdown = String::new();
    markdown.push_str("# Token Usage Analytics\n\n");
    let _ = writeln!(
        markdown,
        "*Generated: {} | Period: {}*\n",
        report.generated_at.format("%b %d, %Y %I:%M %p"),
        report.period_type.as_str()
    );

    markdown.push_str("## Totals\n\n");
    markdown.push_str("| Metric | Value |\n");
    markdown.push_str("|--------|-------|\n");
    let _ = writeln!(markdown, "| Sessions | {} |", report.totals.sessions);
    let _ = writeln!(markdown, "| Tokens | {} |", format_tokens(report.totals.tokens));
    let _ = writeln!(markdown, "| Cost | {} |", format_cost(report.totals.cost_usd));
    markdown.push('\n');

    markdown.push_str("## By Period\n\n");
    markdown.push_str("| Period | Sessions | Tokens | Cost | Smells | Trend |\n");
    markdown.push_str("|--------|----------|--------|------|--------|-------|\n");
    for row in &report.rows {
        let _ = writeln!(
            markdown,
            "| {} | {} | {} | {} | {} | {} |",
            row.label,
            row.sessions,
            format_tokens(row.tokens),
            format_cost(row.cost_usd),
            row.smells,
            row.trend.map_or("", UsageTrend::symbol)
        );
    }
    markdown.push('\n');

    if !report.projects.is_empty() {
        markdown.push_str("## By Project\n\n");
        markdown.push_str("| Project | Sessions | Tokens | Cost | Share |\n");
        markdown.push_str("|---------|----------|--------|------|-------|\n");
        for group in &report.projects {
            let _ = writeln!(
                markdown,
                "| {} | {} | {} | {} | {:.1}% |",
                group.project,
                group.sessions,
                format_tokens(group.tokens),
                format_cost(group.cost_usd),
                group.cost_share
            );
        }
        markdown.push('\n');
    }

    if !report.top_models.is_empty() {
        markdown.push_str("## Top Models\n\n");
        for model in &report.top_models {
            let _ = writeln!(
                markdown,
                "- {}: {} ({:.1}%)",
                model.model,
                format_tokens(model.tokens),
                model.share
            );
        }
    }
    markdown
}

pub fn smells_markdown(report: &SmellTrendsReport) -> String {
    let mut markdown = String::new();
    let _ = writeln!(markdown, "# Smell Trends (last {} days)\n", report.days);
    let _ = writeln!(
        markdown,
        "*{} sessions, {} with smells, {} unique patterns*\n",
        report.summary.total_sessions,
        report.summary.sessions_with_smells,
        report.summary.unique_patterns
    );
    if report.patterns.is_empty() {
        markdown.push_str("No smells detected.\n");
        return markdown;
    }
    markdown.push_str("| Pattern | Frequency | Trend | Severity | Top Tool | Occurrences |\n");
    markdown.push_str("|---------|-----------|-------|----------|----------|-------------|\n");
    for stats in &report.patterns {
        let _ = writeln!(
            markdown,
            "| {} | {:.1}% | {} {} | {} {} | {} | {} |",
            stats.pattern,
            stats.frequency,
            stats.trend.symbol(),
            stats.trend.as_str(),
            stats.severity.indicator(),
            stats.severity.as_str(),
            stats.top_tool.as_deref().unwrap_or("-"),
            stats.occurrences
        );
    }
    markdown
}
