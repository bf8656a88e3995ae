use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Bucket name for sessions recorded without a project.
pub const NO_PROJECT: &str = "(no project)";

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    ClaudeCode,
    CodexCli,
    GeminiCli,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Self::ClaudeCode, Self::CodexCli, Self::GeminiCli];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::CodexCli => "codex-cli",
            Self::GeminiCli => "gemini-cli",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|platform| platform.as_str() == key)
            .ok_or_else(|| {
                format!("unknown platform '{raw}' (expected claude-code|codex-cli|gemini-cli)")
            })
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn indicator(self) -> &'static str {
        match self {
            Self::Low => "●○○",
            Self::Medium => "●●○",
            Self::High | Self::Critical => "●●●",
        }
    }
}

/// A usage anti-pattern detected on a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smell {
    pub pattern: String,
    #[serde(default)]
    pub severity: Severity,
}

impl Smell {
    pub fn new(pattern: impl Into<String>, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            severity,
        }
    }
}

/// One tool call or token-usage delta. Never mutated once written to a session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub smells: Vec<Smell>,
}

impl Event {
    pub fn new(tool: impl Into<String>, tokens: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            tool: tool.into(),
            tokens,
            cost_usd: None,
            model: None,
            smells: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_smell(mut self, smell: Smell) -> Self {
        self.smells.push(smell);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SessionTotals {
    pub tokens: u64,
    pub cost_usd: f64,
    pub events: u64,
}

/// Aggregated smell occurrences for one (pattern, tool) pair within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmellOccurrence {
    pub pattern: String,
    pub tool: String,
    #[serde(default)]
    pub severity: Severity,
    pub count: u64,
}

/// Denormalized per-session summary kept in the shared index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub session_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub project: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub totals: SessionTotals,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub smells: Vec<SmellOccurrence>,
    /// Tokens per model, for events that named one.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, u64>,
}

impl IndexEntry {
    pub fn project_label(&self) -> &str {
        self.project
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(NO_PROJECT)
    }

    pub fn started_local(&self) -> NaiveDateTime {
        self.started_at.with_timezone(&Local).naive_local()
    }

    pub fn started_date(&self) -> NaiveDate {
        self.started_local().date()
    }

    pub fn smell_count(&self) -> u64 {
        self.smells.iter().map(|smell| smell.count).sum()
    }

    /// Occurrence counts per pattern, keyed by pattern name.
    pub fn smell_patterns(&self) -> BTreeMap<&str, u64> {
        let mut patterns = BTreeMap::new();
        for smell in &self.smells {
            *patterns.entry(smell.pattern.as_str()).or_insert(0) += smell.count;
        }
        patterns
    }
}

pub fn normalize_project(project: Option<&str>) -> Option<String> {
    project
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != NO_PROJECT)
        .map(ToString::to_string)
}
