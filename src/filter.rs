use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::model::{IndexEntry, NO_PROJECT, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DatePreset {
    Today,
    Yesterday,
    #[value(name = "last-7-days")]
    #[serde(rename = "last-7-days")]
    Last7Days,
    #[value(name = "last-14-days")]
    #[serde(rename = "last-14-days")]
    Last14Days,
    #[value(name = "last-30-days")]
    #[serde(rename = "last-30-days")]
    Last30Days,
    #[value(name = "last-60-days")]
    #[serde(rename = "last-60-days")]
    Last60Days,
    ThisMonth,
    LastMonth,
    AllTime,
}

impl DatePreset {
    pub const ALL: [DatePreset; 9] = [
        Self::Today,
        Self::Yesterday,
        Self::Last7Days,
        Self::Last14Days,
        Self::Last30Days,
        Self::Last60Days,
        Self::ThisMonth,
        Self::LastMonth,
        Self::AllTime,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::Last7Days => "Last 7 days",
            Self::Last14Days => "Last 14 days",
            Self::Last30Days => "Last 30 days",
            Self::Last60Days => "Last 60 days",
            Self::ThisMonth => "This month",
            Self::LastMonth => "Last month",
            Self::AllTime => "All time",
        }
    }

    fn badge(self) -> &'static str {
        match self {
            Self::Last7Days => "Last 7d",
            Self::Last14Days => "Last 14d",
            Self::Last30Days => "Last 30d",
            Self::Last60Days => "Last 60d",
            Self::AllTime => "",
            other => other.label(),
        }
    }

    /// Concrete `[start, end]` bounds relative to `now` (local wall clock).
    pub fn resolve(self, now: NaiveDateTime) -> DateRange {
        let today = now.date();
        let today_start = today.and_time(NaiveTime::MIN);
        let last_days = |days: i64| DateRange::between(today_start - Duration::days(days), now);

        match self {
            Self::Today => DateRange::between(today_start, now),
            Self::Yesterday => {
                let yesterday = today - Duration::days(1);
                DateRange::between(yesterday.and_time(NaiveTime::MIN), end_of_day(yesterday))
            }
            Self::Last7Days => last_days(7),
            Self::Last14Days => last_days(14),
            Self::Last30Days => last_days(30),
            Self::Last60Days => last_days(60),
            Self::ThisMonth => {
                DateRange::between(first_of_month(today).and_time(NaiveTime::MIN), now)
            }
            Self::LastMonth => {
                let last_of_previous = first_of_month(today) - Duration::days(1);
                DateRange::between(
                    first_of_month(last_of_previous).and_time(NaiveTime::MIN),
                    end_of_day(last_of_previous),
                )
            }
            Self::AllTime => DateRange::default(),
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

/// Last representable microsecond of `date`, so sub-second start times stay covered.
fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::microseconds(1)
}

/// Inclusive bounds; `None` on both sides means no date filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl DateRange {
    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at <= end)
    }

    /// Short header label: a preset name when the bounds fall on a preset's
    /// days, otherwise the explicit day span.
    pub fn badge(&self, now: NaiveDateTime) -> String {
        if self.is_unbounded() {
            return String::new();
        }
        let days = |range: &DateRange| (range.start.map(|at| at.date()), range.end.map(|at| at.date()));
        let own = days(self);
        if let Some(preset) = DatePreset::ALL
            .into_iter()
            .filter(|preset| *preset != DatePreset::AllTime)
            .find(|preset| days(&preset.resolve(now)) == own)
        {
            return preset.badge().to_string();
        }

        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                format!("{}-{}", start.format("%b %d"), end.format("%b %d"))
            }
            (Some(start), None) => format!("Since {}", start.format("%b %d")),
            (None, Some(end)) => format!("Until {}", end.format("%b %d")),
            (None, None) => String::new(),
        }
    }
}

/// Predicate applied to index entries when listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub range: DateRange,
    pub platform: Option<Platform>,
    pub project: Option<String>,
    pub active_only: bool,
}

impl SessionFilter {
    pub fn with_preset(mut self, preset: DatePreset, now: NaiveDateTime) -> Self {
        self.range = preset.resolve(now);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_unbounded()
            && self.platform.is_none()
            && self.project.is_none()
            && !self.active_only
    }

    /// Human description used in exports, e.g. `Last 7d, codex-cli, project api`.
    pub fn describe(&self, now: NaiveDateTime) -> String {
        let mut parts = Vec::new();
        let badge = self.range.badge(now);
        if !badge.is_empty() {
            parts.push(badge);
        }
        if let Some(platform) = self.platform {
            parts.push(platform.to_string());
        }
        if let Some(project) = &self.project {
            parts.push(format!("project {}", project_bucket(project)));
        }
        if self.active_only {
            parts.push("active only".to_string());
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if self.active_only && !entry.active {
            return false;
        }
        if let Some(platform) = self.platform
            && entry.platform != platform
        {
            return false;
        }
        if let Some(project) = &self.project
            && entry.project_label() != project_bucket(project)
        {
            return false;
        }
        self.range.contains(entry.started_local())
    }

    /// Matching entries, newest first.
    pub fn select(&self, entries: impl IntoIterator<Item = IndexEntry>) -> Vec<IndexEntry> {
        let mut selected: Vec<IndexEntry> = entries
            .into_iter()
            .filter(|entry| self.matches(entry))
            .collect();
        selected.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        selected
    }
}

fn project_bucket(project: &str) -> &str {
    let trimmed = project.trim();
    if trimmed.is_empty() { NO_PROJECT } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionTotals;
    use chrono::{Local, TimeZone, Utc};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn end_of(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap()
    }

    fn entry(id: &str, started_local: NaiveDateTime, project: Option<&str>) -> IndexEntry {
        let started_at = Local
            .from_local_datetime(&started_local)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        IndexEntry {
            session_id: id.to_string(),
            platform: Platform::ClaudeCode,
            project: project.map(ToString::to_string),
            started_at,
            updated_at: started_at,
            totals: SessionTotals::default(),
            active: false,
            smells: Vec::new(),
            models: Default::default(),
        }
    }

    #[test]
    fn last_seven_days_starts_at_midnight_seven_days_back() {
        let now = at(2025, 6, 15, 14, 30, 0);
        let range = DatePreset::Last7Days.resolve(now);
        assert_eq!(range.start, Some(at(2025, 6, 8, 0, 0, 0)));
        assert_eq!(range.end, Some(now));
    }

    #[test]
    fn this_month_on_last_day_of_january() {
        let now = at(2025, 1, 31, 9, 0, 0);
        let range = DatePreset::ThisMonth.resolve(now);
        assert_eq!(range.start, Some(at(2025, 1, 1, 0, 0, 0)));
        assert_eq!(range.end, Some(now));
    }

    #[test]
    fn last_month_rolls_back_over_year_boundary() {
        let range = DatePreset::LastMonth.resolve(at(2025, 1, 10, 12, 0, 0));
        assert_eq!(range.start, Some(at(2024, 12, 1, 0, 0, 0)));
        assert_eq!(range.end, Some(end_of(2024, 12, 31)));
    }

    #[test]
    fn last_month_handles_leap_february() {
        let range = DatePreset::LastMonth.resolve(at(2024, 3, 31, 8, 0, 0));
        assert_eq!(range.start, Some(at(2024, 2, 1, 0, 0, 0)));
        assert_eq!(range.end, Some(end_of(2024, 2, 29)));
    }

    #[test]
    fn yesterday_and_all_time() {
        let now = at(2025, 3, 1, 0, 5, 0);
        let range = DatePreset::Yesterday.resolve(now);
        assert_eq!(range.start, Some(at(2025, 2, 28, 0, 0, 0)));
        assert_eq!(range.end, Some(end_of(2025, 2, 28)));
        assert!(DatePreset::AllTime.resolve(now).is_unbounded());
    }

    #[test]
    fn last_second_of_month_belongs_to_last_month() {
        let now = at(2025, 1, 15, 12, 0, 0);
        let late = NaiveDate::from_ymd_opt(2024, 12, 31)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 500)
            .unwrap();
        assert!(DatePreset::LastMonth.resolve(now).contains(late));
        assert!(!DatePreset::ThisMonth.resolve(now).contains(late));

        let yesterday_late = NaiveDate::from_ymd_opt(2025, 1, 14)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap();
        assert!(DatePreset::Yesterday.resolve(now).contains(yesterday_late));
        assert!(!DatePreset::Today.resolve(now).contains(yesterday_late));
    }

    #[test]
    fn badge_names_presets_and_custom_spans() {
        let now = at(2025, 6, 15, 14, 30, 0);
        assert_eq!(DateRange::default().badge(now), "");
        assert_eq!(DatePreset::Today.resolve(now).badge(now), "Today");
        assert_eq!(DatePreset::Last30Days.resolve(now).badge(now), "Last 30d");
        assert_eq!(DatePreset::LastMonth.resolve(now).badge(now), "Last month");
        let custom = DateRange::between(at(2025, 5, 2, 0, 0, 0), at(2025, 5, 9, 23, 0, 0));
        assert_eq!(custom.badge(now), "May 02-May 09");
    }

    #[test]
    fn filter_combines_range_platform_and_project() {
        let now = at(2025, 6, 15, 14, 30, 0);
        let filter = SessionFilter {
            project: Some(NO_PROJECT.to_string()),
            ..SessionFilter::default()
        }
        .with_preset(DatePreset::Last7Days, now);

        let recent = entry("recent", at(2025, 6, 14, 9, 0, 0), None);
        let old = entry("old", at(2025, 5, 1, 9, 0, 0), None);
        let other_project = entry("api", at(2025, 6, 14, 10, 0, 0), Some("api"));
        assert!(filter.matches(&recent));
        assert!(!filter.matches(&old));
        assert!(!filter.matches(&other_project));

        let codex_only = SessionFilter {
            platform: Some(Platform::CodexCli),
            ..SessionFilter::default()
        };
        assert!(!codex_only.matches(&recent));
    }

    #[test]
    fn select_sorts_newest_first() {
        let entries = vec![
            entry("a", at(2025, 6, 1, 9, 0, 0), None),
            entry("b", at(2025, 6, 3, 9, 0, 0), None),
            entry("c", at(2025, 6, 2, 9, 0, 0), None),
        ];
        let ids: Vec<String> = SessionFilter::default()
            .select(entries)
            .into_iter()
            .map(|entry| entry.session_id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn describe_lists_active_parts() {
        let now = at(2025, 6, 15, 14, 30, 0);
        assert_eq!(SessionFilter::default().describe(now), "none");
        let filter = SessionFilter {
            platform: Some(Platform::CodexCli),
            active_only: true,
            ..SessionFilter::default()
        }
        .with_preset(DatePreset::Last7Days, now);
        assert_eq!(filter.describe(now), "Last 7d, codex-cli, active only");
    }
}
