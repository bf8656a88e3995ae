use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::StorageOptions;

const CONFIG_SCHEMA_VERSION: u32 = 2;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const MIN_LOCK_TIMEOUT_MS: u64 = 10;
const DEFAULT_INDEX_FLUSH_EVERY: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub schema_version: u32,
    pub storage: StorageConfig,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage base directory; defaults to the data home.
    pub data_dir: Option<String>,
    pub lock_timeout_ms: u64,
    /// Appends between index mirrors while a session is being recorded.
    pub index_flush_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub aliases: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, ModelPricingOverride>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModelPricingOverride {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            storage: StorageConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            index_flush_every: DEFAULT_INDEX_FLUSH_EVERY,
        }
    }
}

impl AuditConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Reads `path`, creating it with defaults when absent and rewriting it
    /// when normalization changed anything.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: AuditConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = AuditConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(data_home)
    }

    /// Storage settings with environment overrides applied.
    pub fn storage_options(&self) -> StorageOptions {
        let lock_timeout_ms = env_u64("TOKEN_AUDIT_LOCK_TIMEOUT_MS", self.storage.lock_timeout_ms)
            .max(MIN_LOCK_TIMEOUT_MS);
        let index_flush_every =
            env_u64("TOKEN_AUDIT_INDEX_FLUSH_EVERY", self.storage.index_flush_every).max(1);
        StorageOptions {
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            index_flush_every,
            pricing: self.pricing.clone(),
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self
            .storage
            .data_dir
            .as_deref()
            .is_some_and(|dir| dir.trim().is_empty())
        {
            self.storage.data_dir = None;
            changed = true;
        }
        if self.storage.lock_timeout_ms < MIN_LOCK_TIMEOUT_MS {
            self.storage.lock_timeout_ms = MIN_LOCK_TIMEOUT_MS;
            changed = true;
        }
        if self.storage.index_flush_every == 0 {
            self.storage.index_flush_every = DEFAULT_INDEX_FLUSH_EVERY;
            changed = true;
        }
        if normalize_pricing_config(&mut self.pricing) {
            changed = true;
        }

        changed
    }
}

pub fn data_home() -> PathBuf {
    if let Ok(custom) = env::var("TOKEN_AUDIT_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".token-audit")
}

pub fn config_path() -> PathBuf {
    data_home().join("config.json")
}

pub fn exports_dir() -> PathBuf {
    data_home().join("exports")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_pricing_config(pricing: &mut PricingConfig) -> bool {
    let mut normalized_aliases: BTreeMap<String, String> = BTreeMap::new();
    for (raw_key, raw_target) in &pricing.aliases {
        let key = raw_key.trim().to_ascii_lowercase();
        let target = raw_target.trim().to_ascii_lowercase();
        if key.is_empty() || target.is_empty() || key == target {
            continue;
        }
        normalized_aliases.entry(key).or_insert(target);
    }

    let mut normalized_overrides: BTreeMap<String, ModelPricingOverride> = BTreeMap::new();
    for (raw_key, override_pricing) in &pricing.overrides {
        let key = raw_key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let clamp = |rate: f64| if rate.is_finite() && rate >= 0.0 { rate } else { 0.0 };
        normalized_overrides.insert(
            key,
            ModelPricingOverride {
                input_per_million: clamp(override_pricing.input_per_million),
                output_per_million: clamp(override_pricing.output_per_million),
            },
        );
    }

    let changed =
        pricing.aliases != normalized_aliases || pricing.overrides != normalized_overrides;
    pricing.aliases = normalized_aliases;
    pricing.overrides = normalized_overrides;
    changed
}
