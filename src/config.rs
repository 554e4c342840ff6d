//! Run configuration.
//!
//! Loaded once from YAML, overlaid with a few environment variables, and
//! validated before any symbol is processed. Every field outside `symbols`
//! and `freq` has a default so a minimal file is two keys long.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::FixedOffset;
use regex::Regex;
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::models::{
    BarInterval, Decay, DistributionPolicy, Language, Resolution, SymbolConfig, SymbolEntry,
};

/// Finer ticks would put exchange prices beyond the exact integer range of the tick grid.
const MIN_TICK_SIZE: f64 = 1e-6;

fn symbol_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z]{1,4}\d{0,6}$").expect("static regex"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub symbols: Vec<SymbolEntry>,
    pub freq: BarInterval,
    #[serde(default)]
    pub timezone: TimeZoneOffset,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_pages_root")]
    pub pages_root: PathBuf,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_pages_root() -> PathBuf {
    PathBuf::from("./docs")
}

fn default_max_parallel() -> usize {
    1
}

/// Fixed UTC offset used to decide "today" for the fetch window and file dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeZoneOffset(pub FixedOffset);

impl Default for TimeZoneOffset {
    fn default() -> Self {
        TimeZoneOffset(FixedOffset::east_opt(8 * 3600).expect("valid offset"))
    }
}

impl TimeZoneOffset {
    pub fn parse(raw: &str) -> Result<Self, String> {
        // Exchange-local names used by older configs.
        match raw {
            "Asia/Shanghai" | "Asia/Hong_Kong" | "PRC" => return Ok(Self::default()),
            "UTC" | "Z" => return Ok(TimeZoneOffset(FixedOffset::east_opt(0).expect("valid offset"))),
            _ => {}
        }

        let re = Regex::new(r"^([+-])(\d{2}):?(\d{2})$").expect("static regex");
        let caps = re
            .captures(raw.trim())
            .ok_or_else(|| format!("expected an offset like +08:00, got '{}'", raw))?;
        let hours: i32 = caps[2].parse().map_err(|_| "bad hours".to_string())?;
        let minutes: i32 = caps[3].parse().map_err(|_| "bad minutes".to_string())?;
        let secs = hours * 3600 + minutes * 60;
        let secs = if &caps[1] == "-" { -secs } else { secs };

        FixedOffset::east_opt(secs)
            .map(TimeZoneOffset)
            .ok_or_else(|| format!("offset out of range: '{}'", raw))
    }
}

impl<'de> Deserialize<'de> for TimeZoneOffset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TimeZoneOffset::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Sina,
    CsvDir,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub base_url: String,
    /// Where `csv_dir` sources read from. Defaults to `data_dir`.
    pub csv_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub requests_per_minute: u32,
    /// Archive the fetched bars under `data_dir`.
    pub archive_raw: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sina,
            base_url: "https://stock2.finance.sina.com.cn/futures/api/jsonp.php".to_string(),
            csv_dir: None,
            timeout_secs: 20,
            max_attempts: 3,
            backoff_ms: 1000,
            requests_per_minute: 60,
            archive_raw: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Rolling window for accumulation strength.
    pub window_strength: usize,
    /// EWM span smoothing the strength lines.
    pub smooth: usize,
    /// Number of most recent bars forming the "recent" zone histogram.
    pub window_zone: usize,
    /// Exponent on (1 + open-interest increase) in the zone weighting.
    pub beta: f64,
    /// Quantile of non-zero strengths a bin must reach to count as a zone.
    pub quantile: f64,
    pub min_bars: usize,
    pub resolution: Resolution,
    pub distribution: DistributionPolicy,
    pub decay: Decay,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_strength: 20,
            smooth: 7,
            window_zone: 60,
            beta: 0.7,
            quantile: 0.8,
            min_bars: 2,
            resolution: Resolution::default(),
            distribution: DistributionPolicy::default(),
            decay: Decay::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub language: Language,
    /// Font files tried in order; the first readable one is used for all chart text.
    pub font_candidates: Vec<PathBuf>,
    /// Decimal places for prices and volumes in the CSV.
    pub precision: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1000,
            language: Language::Zh,
            font_candidates: vec![
                PathBuf::from("/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc"),
                PathBuf::from("/usr/share/fonts/truetype/noto/NotoSansCJK-Regular.ttc"),
                PathBuf::from("/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.otf"),
                PathBuf::from("/usr/share/fonts/truetype/arphic/ukai.ttc"),
                PathBuf::from("/usr/share/fonts/truetype/wqy/wqy-microhei.ttc"),
                PathBuf::from("/System/Library/Fonts/PingFang.ttc"),
                PathBuf::from("/System/Library/Fonts/STHeiti Light.ttc"),
                PathBuf::from("C:\\Windows\\Fonts\\msyh.ttc"),
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
            ],
            precision: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Also write the date-stamped copy next to the latest file.
    pub keep_dated: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { keep_dated: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Name of the environment variable holding the integration token.
    pub token_env: String,
    pub api_base: String,
    pub database_id: Option<String>,
    pub parent_page_id: Option<String>,
    /// Public URL of `pages_root`; chart links are relative paths without it.
    pub public_base_url: Option<String>,
    pub prune_unlisted: bool,
    /// One child page per symbol with the chart embedded.
    pub symbol_pages: bool,
    /// A single page under the parent linking every configured symbol.
    pub directory_page: bool,
    pub directory_title: String,
    pub requests_per_minute: u32,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_env: "NOTION_TOKEN".to_string(),
            api_base: "https://api.notion.com/v1".to_string(),
            database_id: None,
            parent_page_id: None,
            public_base_url: None,
            prune_unlisted: false,
            symbol_pages: true,
            directory_page: true,
            directory_title: "📘 Symbol Directory".to_string(),
            requests_per_minute: 180,
            timeout_secs: 20,
            max_attempts: 3,
        }
    }
}

impl SyncConfig {
    /// Credential from the environment; `None` means sync is skipped.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse without environment overlays. Still validated.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(db) = non_empty_env("NOTION_DB") {
            self.sync.database_id = Some(db);
        }
        if let Some(parent) = non_empty_env("NOTION_PARENT_PAGE") {
            self.sync.parent_page_id = Some(parent);
        }
        if let Some(base) = non_empty_env("PAGES_BASE_URL") {
            self.sync.public_base_url = Some(base);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::invalid("symbols", "at least one symbol is required"));
        }

        let mut seen = HashSet::new();
        for (i, entry) in self.symbols.iter().enumerate() {
            if !symbol_code_pattern().is_match(&entry.code) {
                return Err(ConfigError::invalid(
                    format!("symbols[{}].code", i),
                    format!("'{}' is not an exchange contract code", entry.code),
                ));
            }
            if !seen.insert(entry.code.to_uppercase()) {
                return Err(ConfigError::invalid(
                    format!("symbols[{}].code", i),
                    format!("duplicate symbol '{}'", entry.code),
                ));
            }
        }

        if self.max_parallel == 0 {
            return Err(ConfigError::invalid("max_parallel", "must be at least 1"));
        }

        let source = &self.source;
        if source.timeout_secs == 0 || source.max_attempts == 0 || source.requests_per_minute == 0 {
            return Err(ConfigError::invalid(
                "source",
                "timeout_secs, max_attempts and requests_per_minute must be positive",
            ));
        }
        if source.kind == SourceKind::Sina {
            url::Url::parse(&source.base_url)
                .map_err(|e| ConfigError::invalid("source.base_url", e.to_string()))?;
        }

        let a = &self.analysis;
        if a.window_strength == 0 || a.smooth == 0 || a.window_zone == 0 {
            return Err(ConfigError::invalid(
                "analysis",
                "window_strength, smooth and window_zone must be positive",
            ));
        }
        if a.min_bars < 2 {
            return Err(ConfigError::invalid("analysis.min_bars", "must be at least 2"));
        }
        if !(a.quantile > 0.0 && a.quantile < 1.0) {
            return Err(ConfigError::invalid("analysis.quantile", "must be within (0, 1)"));
        }
        if !a.beta.is_finite() || a.beta < 0.0 {
            return Err(ConfigError::invalid("analysis.beta", "must be a non-negative number"));
        }
        match a.resolution {
            Resolution::BinCount(n) if n < 2 => {
                return Err(ConfigError::invalid("analysis.resolution", "bin_count must be at least 2"));
            }
            Resolution::TickSize(t) | Resolution::PercentOfMean(t) if !(t.is_finite() && t > 0.0) => {
                return Err(ConfigError::invalid("analysis.resolution", "value must be positive"));
            }
            Resolution::TickSize(t) if t < MIN_TICK_SIZE => {
                return Err(ConfigError::invalid(
                    "analysis.resolution",
                    format!("tick_size must be at least {}", MIN_TICK_SIZE),
                ));
            }
            _ => {}
        }
        match a.decay {
            Decay::Exponential { half_life_days: v } | Decay::Linear { window_days: v }
                if !(v.is_finite() && v > 0.0) =>
            {
                return Err(ConfigError::invalid("analysis.decay", "window must be positive"));
            }
            _ => {}
        }

        if self.render.width < 200 || self.render.height < 200 {
            return Err(ConfigError::invalid("render", "chart must be at least 200x200 pixels"));
        }

        let sync = &self.sync;
        if sync.enabled {
            if sync.database_id.is_none() && sync.parent_page_id.is_none() {
                return Err(ConfigError::invalid(
                    "sync",
                    "either database_id or parent_page_id is required when sync is enabled",
                ));
            }
            if sync.directory_page && sync.directory_title.trim().is_empty() {
                return Err(ConfigError::invalid("sync.directory_title", "must not be empty"));
            }
            if sync.requests_per_minute == 0 || sync.max_attempts == 0 || sync.timeout_secs == 0 {
                return Err(ConfigError::invalid(
                    "sync",
                    "requests_per_minute, max_attempts and timeout_secs must be positive",
                ));
            }
        }

        Ok(())
    }

    /// Typed per-symbol settings, in config order.
    pub fn symbol_configs(&self) -> Vec<SymbolConfig> {
        self.symbols
            .iter()
            .map(|e| SymbolConfig::new(e.code.to_uppercase(), e.start, self.freq))
            .collect()
    }

    pub fn csv_source_dir(&self) -> &Path {
        self.source.csv_dir.as_deref().unwrap_or(&self.data_dir)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
