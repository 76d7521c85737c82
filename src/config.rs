use crate::cache::CacheKind;
use crate::planner::DEFAULT_MAX_PAGES;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CACHE_DIR: &str = "./.tag-reader-cache";
const DEFAULT_SAMPLE_INTERVAL_SECONDS: u64 = 60;
const MAX_PAGES_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    pub cache_dir: PathBuf,
    pub cache_kind: CacheKind,
    /// Cached entries older than this read as absent. `None` keeps them forever.
    pub cache_ttl_seconds: Option<u64>,
    pub timezone: Tz,
    pub default_sample_interval_seconds: u64,
    pub max_pages: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_kind: CacheKind::Bucket,
            cache_ttl_seconds: None,
            timezone: chrono_tz::Europe::Oslo,
            default_sample_interval_seconds: DEFAULT_SAMPLE_INTERVAL_SECONDS,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOverrides {
    #[serde(default)]
    cache_dir: Option<String>,
    #[serde(default)]
    cache_kind: Option<String>,
    #[serde(default)]
    cache_ttl_seconds: Option<u64>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    default_sample_interval_seconds: Option<u64>,
    #[serde(default)]
    max_pages: Option<u64>,
}

fn load_file_overrides(path: &Path) -> Option<FileOverrides> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "reader config file not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read reader config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse reader config; using env defaults"
            );
            None
        }
    }
}

fn apply_file_overrides(config: &mut ReaderConfig, overrides: &FileOverrides) -> Result<()> {
    if let Some(dir) = overrides
        .cache_dir
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        config.cache_dir = PathBuf::from(dir);
    }
    if let Some(kind) = overrides.cache_kind.as_deref() {
        config.cache_kind = parse_cache_kind(kind, "cache_kind")?;
    }
    if let Some(seconds) = overrides.cache_ttl_seconds {
        config.cache_ttl_seconds = Some(seconds).filter(|seconds| *seconds > 0);
    }
    if let Some(name) = overrides.timezone.as_deref() {
        config.timezone = parse_timezone(name, "timezone")?;
    }
    if let Some(seconds) = overrides.default_sample_interval_seconds {
        config.default_sample_interval_seconds = seconds.max(1);
    }
    if let Some(pages) = overrides.max_pages {
        config.max_pages = pages.clamp(1, MAX_PAGES_LIMIT) as usize;
    }
    Ok(())
}

fn parse_cache_kind(value: &str, label: &str) -> Result<CacheKind> {
    value
        .parse::<CacheKind>()
        .with_context(|| format!("invalid {label} {value:?}"))
}

fn parse_timezone(value: &str, label: &str) -> Result<Tz> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|err| anyhow::anyhow!("{err}"))
        .with_context(|| format!("invalid {label} {value:?}"))
}

impl ReaderConfig {
    /// Defaults, then `TAG_READER_CONFIG_PATH` JSON overrides, then explicit
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = env_optional_path("TAG_READER_CONFIG_PATH") {
            if let Some(overrides) = load_file_overrides(&path) {
                apply_file_overrides(&mut config, &overrides)
                    .with_context(|| format!("invalid reader config {}", path.display()))?;
            }
        }

        if let Some(dir) = env_optional_path("TAG_READER_CACHE_DIR") {
            config.cache_dir = dir;
        }
        if let Some(kind) = env_optional_string("TAG_READER_CACHE_KIND") {
            config.cache_kind = parse_cache_kind(&kind, "TAG_READER_CACHE_KIND")?;
        }
        if let Some(seconds) = env_optional_string("TAG_READER_CACHE_TTL_SECONDS") {
            let seconds = seconds
                .parse::<u64>()
                .with_context(|| format!("invalid TAG_READER_CACHE_TTL_SECONDS {seconds:?}"))?;
            config.cache_ttl_seconds = Some(seconds).filter(|seconds| *seconds > 0);
        }
        let timezone = env_string("TAG_READER_TIMEZONE", "");
        if !timezone.is_empty() {
            config.timezone = parse_timezone(&timezone, "TAG_READER_TIMEZONE")?;
        }
        config.default_sample_interval_seconds = env_u64(
            "TAG_READER_DEFAULT_SAMPLE_INTERVAL_SECONDS",
            config.default_sample_interval_seconds,
        )
        .max(1);
        config.max_pages =
            env_u64("TAG_READER_MAX_PAGES", config.max_pages as u64).clamp(1, MAX_PAGES_LIMIT) as usize;

        tracing::debug!(
            cache_dir = %config.cache_dir.display(),
            cache_kind = %config.cache_kind,
            cache_ttl_seconds = config.cache_ttl_seconds,
            timezone = %config.timezone,
            "loaded reader config"
        );
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_seconds.map(Duration::from_secs)
    }

    /// Cache file for one data source.
    pub fn cache_path(&self, source: &str) -> PathBuf {
        crate::cache::cache_path_for_source(&self.cache_dir, source)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}
