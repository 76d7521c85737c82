//! Caller-facing entry point: multi-tag reads into a [`Table`], tag search and
//! read-through metadata lookups.

use crate::backend::Backend;
use crate::cache::{open_cache, Cache};
use crate::config::ReaderConfig;
use crate::error::{ReaderError, ReaderResult};
use crate::interval::Interval;
use crate::metadata::{text_property, TagInfo, TagMetadata, DESCRIPTION, UNIT};
use crate::planner::{QueryPlanner, TagRead, DEFAULT_MAX_PAGES};
use crate::read_mode::ReadMode;
use crate::series::Series;
use crate::table::Table;
use crate::time::{localize, parse_time_input, ResolvedInstant};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Roughly a century. Longer grids have no meaningful second point.
pub const MAX_SAMPLE_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// A time bound as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeArg {
    Utc(DateTime<Utc>),
    /// Wall-clock time in the client timezone.
    Local(NaiveDateTime),
    Text(String),
}

impl From<DateTime<Utc>> for TimeArg {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Utc(value)
    }
}

impl From<DateTime<Tz>> for TimeArg {
    fn from(value: DateTime<Tz>) -> Self {
        Self::Utc(value.with_timezone(&Utc))
    }
}

impl From<NaiveDateTime> for TimeArg {
    fn from(value: NaiveDateTime) -> Self {
        Self::Local(value)
    }
}

impl From<&str> for TimeArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TimeArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    tags: Vec<String>,
    start: Option<TimeArg>,
    end: Option<TimeArg>,
    sample_interval: Option<u64>,
    mode: ReadMode,
    include_status: bool,
    stepped: bool,
}

impl ReadRequest {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            start: None,
            end: None,
            sample_interval: None,
            mode: ReadMode::Interpolated,
            include_status: false,
            stepped: false,
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self::new([tag.into()])
    }

    pub fn start(mut self, start: impl Into<TimeArg>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn end(mut self, end: impl Into<TimeArg>) -> Self {
        self.end = Some(end.into());
        self
    }

    /// Seconds between grid points. Ignored for RAW and SNAPSHOT.
    pub fn sample_interval(mut self, seconds: u64) -> Self {
        self.sample_interval = Some(seconds);
        self
    }

    pub fn mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn include_status(mut self, include_status: bool) -> Self {
        self.include_status = include_status;
        self
    }

    pub fn stepped(mut self, stepped: bool) -> Self {
        self.stepped = stepped;
        self
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

pub struct TagClient {
    source: String,
    backend: Arc<dyn Backend>,
    cache: Option<Arc<dyn Cache>>,
    timezone: Tz,
    default_sample_interval: u64,
    max_pages: usize,
}

impl TagClient {
    /// Client for one data source. A cache that cannot be opened is reported
    /// and the client continues without one.
    pub fn new(source: impl Into<String>, backend: Arc<dyn Backend>, config: &ReaderConfig) -> Self {
        let source = source.into();
        let cache_path = config.cache_path(&source);
        let cache = match open_cache(config.cache_kind, &cache_path, config.cache_ttl()) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!(
                    source = %source,
                    path = %cache_path.display(),
                    error = %err,
                    "cache unavailable; continuing without cache"
                );
                None
            }
        };
        Self {
            source,
            backend,
            cache,
            timezone: config.timezone,
            default_sample_interval: config.default_sample_interval_seconds.max(1),
            max_pages: config.max_pages,
        }
    }

    pub fn without_cache(source: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let defaults = ReaderConfig::default();
        Self {
            source: source.into(),
            backend,
            cache: None,
            timezone: defaults.timezone,
            default_sample_interval: defaults.default_sample_interval_seconds,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn Cache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_default_sample_interval(mut self, seconds: u64) -> Self {
        self.default_sample_interval = seconds.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    /// Reads every requested tag and aligns them in one table.
    ///
    /// Argument problems fail before the backend is contacted. Unknown tags
    /// become empty columns and a warning on the returned table.
    pub fn read(&self, request: &ReadRequest) -> ReaderResult<Table> {
        if request.tags.is_empty() {
            return Err(ReaderError::invalid("at least one tag is required"));
        }
        if !request.mode.uses_sample_interval() && request.tags.len() > 1 {
            return Err(ReaderError::invalid(format!(
                "{} reads accept a single tag, got {}",
                request.mode,
                request.tags.len()
            )));
        }
        if let Some(blank) = request.tags.iter().position(|tag| tag.trim().is_empty()) {
            return Err(ReaderError::invalid(format!("tag #{} is empty", blank + 1)));
        }

        let mut warnings = Vec::new();
        let tags = unique_tags(&request.tags, &mut warnings);

        let start = match &request.start {
            Some(arg) => self.resolve_time(arg, &mut warnings)?,
            // 1970-01-01T00:00:00Z
            None => DateTime::<Utc>::default(),
        };
        let end = match &request.end {
            Some(arg) => self.resolve_time(arg, &mut warnings)?,
            None => Utc::now(),
        };
        if start > end {
            return Err(ReaderError::invalid(format!(
                "start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        let range = Interval::new(start, end)?;

        let sample_interval = if request.mode.uses_sample_interval() {
            match request.sample_interval.unwrap_or(self.default_sample_interval) {
                seconds @ 1..=MAX_SAMPLE_INTERVAL_SECONDS => Some(seconds),
                seconds => {
                    return Err(ReaderError::invalid(format!(
                        "{} reads need a sample interval between 1 and {MAX_SAMPLE_INTERVAL_SECONDS} seconds, got {seconds}",
                        request.mode
                    )))
                }
            }
        } else {
            None
        };

        let planner = QueryPlanner::new(self.backend.as_ref())
            .with_cache(self.cache.as_deref())
            .with_max_pages(self.max_pages);
        let mut columns = Vec::with_capacity(tags.len());
        for tag in tags {
            let read = TagRead {
                tag: &tag,
                range,
                sample_interval,
                mode: request.mode,
                stepped: request.stepped,
                include_status: request.include_status,
            };
            let series = match planner.read_tag(&read, &mut warnings) {
                Ok(series) => series,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(tag = %tag, error = %err, "skipping unknown tag");
                    warnings.push(err.to_string());
                    Series::new()
                }
                Err(err) => return Err(err),
            };
            columns.push((tag, series));
        }

        Ok(Table::from_series(self.timezone, columns, request.include_status).with_warnings(warnings))
    }

    fn resolve_time(&self, arg: &TimeArg, warnings: &mut Vec<String>) -> ReaderResult<DateTime<Utc>> {
        let ResolvedInstant { utc, warnings: adjusted } = match arg {
            TimeArg::Utc(utc) => return Ok(*utc),
            TimeArg::Local(naive) => localize(&self.timezone, *naive)?,
            TimeArg::Text(text) => parse_time_input(&self.timezone, text)?,
        };
        for warning in adjusted {
            tracing::warn!(timezone = %self.timezone, "{warning}");
            warnings.push(warning);
        }
        Ok(utc)
    }

    pub fn search(
        &self,
        tag_pattern: Option<&str>,
        description_pattern: Option<&str>,
    ) -> ReaderResult<Vec<TagInfo>> {
        self.backend.search(tag_pattern, description_pattern)
    }

    /// Engineering unit per tag. Tags without one are omitted.
    pub fn get_units<S: AsRef<str>>(&self, tags: &[S]) -> ReaderResult<BTreeMap<String, String>> {
        self.metadata_property(tags, UNIT, |backend, tag| backend.unit(tag))
    }

    /// Description per tag. Tags without one are omitted.
    pub fn get_descriptions<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> ReaderResult<BTreeMap<String, String>> {
        self.metadata_property(tags, DESCRIPTION, |backend, tag| backend.description(tag))
    }

    fn metadata_property<S, F>(
        &self,
        tags: &[S],
        property: &str,
        lookup: F,
    ) -> ReaderResult<BTreeMap<String, String>>
    where
        S: AsRef<str>,
        F: Fn(&dyn Backend, &str) -> ReaderResult<Option<String>>,
    {
        let mut found = BTreeMap::new();
        for tag in tags.iter().map(AsRef::as_ref) {
            if let Some(value) = self.cached_property(tag, property) {
                found.insert(tag.to_string(), value);
                continue;
            }
            let value = match lookup(self.backend.as_ref(), tag) {
                Ok(value) => value,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(tag = %tag, property = %property, "tag not found");
                    continue;
                }
                Err(err) => {
                    if self.backend.search(Some(tag), None)?.is_empty() {
                        tracing::warn!(tag = %tag, property = %property, error = %err, "tag not found");
                        continue;
                    }
                    return Err(err);
                }
            };
            let Some(value) = value else {
                continue;
            };
            if let Some(cache) = &self.cache {
                let mut metadata = TagMetadata::new();
                metadata.insert(property.to_string(), value.clone().into());
                if let Err(err) = cache.store_metadata(tag, &metadata) {
                    tracing::warn!(tag = %tag, error = %err, "failed to cache metadata");
                }
            }
            found.insert(tag.to_string(), value);
        }
        Ok(found)
    }

    fn cached_property(&self, tag: &str, property: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.fetch_metadata_properties(tag, &[property]) {
            Ok(metadata) => text_property(&metadata, property),
            Err(err) => {
                tracing::warn!(tag = %tag, error = %err, "metadata cache lookup failed");
                None
            }
        }
    }
}

/// First occurrence of each tag, in request order.
fn unique_tags(tags: &[String], warnings: &mut Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(tags.len());
    for tag in tags {
        if seen.insert(tag.as_str()) {
            unique.push(tag.clone());
        } else {
            tracing::warn!(tag = %tag, "duplicate tag removed from request");
            warnings.push(format!("Duplicate tag removed: {tag}"));
        }
    }
    unique
}
