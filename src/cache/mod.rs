//! Persistent caches of previously fetched tag data.
//!
//! Two layouts share one capability: [`BucketCache`] keeps many time-ranged
//! buckets per key family and merges overlapping writes, [`LegacyCache`] keeps
//! one ever-growing series per (tag, mode, interval).

pub mod bucket;
pub mod legacy;
pub mod matcher;
pub mod store;

pub use bucket::{BucketCache, BucketName};
pub use legacy::{LegacyCache, StopBound};
pub use matcher::TagMatch;
pub use store::{Entry, KvRead, KvStore, KvWrite, MemoryKvStore, SqliteKvStore};

use crate::error::{ReaderError, ReaderResult};
use crate::interval::Interval;
use crate::metadata::TagMetadata;
use crate::read_mode::ReadMode;
use crate::series::Series;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Bucket,
    Legacy,
    Disabled,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::Legacy => "legacy",
            Self::Disabled => "none",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = ReaderError;

    fn from_str(s: &str) -> ReaderResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "bucket" | "buckets" => Ok(Self::Bucket),
            "legacy" | "smart" => Ok(Self::Legacy),
            "none" | "off" | "disabled" => Ok(Self::Disabled),
            other => Err(ReaderError::invalid(format!(
                "unknown cache kind {other:?}; expected bucket, legacy or none"
            ))),
        }
    }
}

/// Identity of a family of cached series: everything but the time range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilyKey {
    pub tagname: String,
    pub mode: ReadMode,
    pub sample_interval: Option<u64>,
    pub stepped: bool,
    pub include_status: bool,
}

impl FamilyKey {
    /// The sample interval is dropped for modes without a sampling grid.
    pub fn new(tagname: impl Into<String>, mode: ReadMode, sample_interval: Option<u64>) -> Self {
        Self {
            tagname: tagname.into(),
            mode,
            sample_interval: sample_interval.filter(|_| mode.uses_sample_interval()),
            stepped: false,
            include_status: false,
        }
    }

    pub fn stepped(mut self, stepped: bool) -> Self {
        self.stepped = stepped;
        self
    }

    pub fn include_status(mut self, include_status: bool) -> Self {
        self.include_status = include_status;
        self
    }

    pub fn safe_tagname(&self) -> String {
        safe_tagname(&self.tagname)
    }
}

/// Normalizes a tag name for use inside cache keys and file names.
///
/// `.` becomes `_`, everything except ASCII alphanumerics and `_` is dropped,
/// and a leading digit is prefixed with `_`.
pub fn safe_tagname(tagname: &str) -> String {
    let mut safe: String = tagname
        .trim()
        .chars()
        .map(|c| if c == '.' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if safe.starts_with(|c: char| c.is_ascii_digit()) {
        safe.insert(0, '_');
    }
    safe
}

pub fn cache_path_for_source(cache_dir: &Path, source: &str) -> PathBuf {
    cache_dir.join(format!("{}.sqlite", safe_tagname(source)))
}

/// Coverage lookups answered entirely from the cache (`hits`) versus those
/// that left something for the backend (`misses`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record(&self, missing: &[Interval]) {
        let counter = if missing.is_empty() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Capability shared by every cache layout. Each call is its own atomic unit.
pub trait Cache: Send + Sync {
    fn kind(&self) -> CacheKind;

    /// Persists `series` as covering `requested`. Empty series are ignored.
    fn store(&self, key: &FamilyKey, requested: Interval, series: &Series) -> ReaderResult<()>;

    /// Cached points with timestamps in `range`.
    fn fetch(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Series>;

    /// Sub-ranges of `range` the cache cannot answer, ordered by start.
    fn missing_intervals(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Vec<Interval>>;

    /// Merges `metadata` into the stored bag and returns the result.
    fn store_metadata(&self, tagname: &str, metadata: &TagMetadata) -> ReaderResult<TagMetadata>;

    fn fetch_metadata(&self, tagname: &str) -> ReaderResult<TagMetadata>;

    fn fetch_metadata_properties(&self, tagname: &str, names: &[&str]) -> ReaderResult<TagMetadata> {
        let mut metadata = self.fetch_metadata(tagname)?;
        metadata.retain(|name, _| names.contains(&name.as_str()));
        Ok(metadata)
    }

    fn delete_metadata(&self, tagname: &str) -> ReaderResult<bool>;

    /// Deletes every data entry matched by `matcher`; returns how many.
    fn invalidate(&self, matcher: &TagMatch) -> ReaderResult<usize>;

    /// Deletes every entry but keeps the backing store.
    fn clear(&self) -> ReaderResult<()>;

    /// Drops entries older than the store's TTL; returns how many.
    fn purge_expired(&self) -> ReaderResult<usize>;

    /// Hit/miss counts of `missing_intervals` since creation or the last reset.
    fn stats(&self) -> CacheStats;

    fn reset_stats(&self);

    /// Deletes the backing store.
    fn remove(&self) -> ReaderResult<()>;

    fn location(&self) -> String;
}

/// Builds the configured cache over a SQLite file at `path`. Entries older
/// than `ttl`, when given, read as absent.
pub fn open_cache(
    kind: CacheKind,
    path: &Path,
    ttl: Option<Duration>,
) -> ReaderResult<Option<Arc<dyn Cache>>> {
    if kind == CacheKind::Disabled {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ReaderError::CacheUnavailable(format!(
                    "cannot create cache directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
    }
    if path.is_dir() {
        return Err(ReaderError::CacheUnavailable(format!(
            "cache path {} is a directory",
            path.display()
        )));
    }
    let store = SqliteKvStore::new(path).with_ttl(ttl);
    let cache: Arc<dyn Cache> = match kind {
        CacheKind::Legacy => Arc::new(LegacyCache::new(store)),
        _ => Arc::new(BucketCache::new(store)),
    };
    tracing::debug!(
        kind = %kind,
        path = %path.display(),
        ttl_seconds = ttl.map(|ttl| ttl.as_secs()),
        "cache ready"
    );
    Ok(Some(cache))
}

const METADATA_PREFIX: &str = "@metadata@";

pub(crate) fn metadata_key(tagname: &str) -> String {
    format!("{METADATA_PREFIX}{}", safe_tagname(tagname))
}

pub(crate) fn is_metadata_key(key: &str) -> bool {
    key.starts_with(METADATA_PREFIX)
}

pub(crate) fn series_entry(series: &Series) -> ReaderResult<Entry> {
    let mut entry = Entry::new(serde_json::to_vec(series)?)
        .with_attribute("points", series.len())
        .with_attribute("stored_at", chrono::Utc::now().to_rfc3339());
    if let (Some(first), Some(last)) = (series.first_timestamp(), series.last_timestamp()) {
        entry = entry
            .with_attribute("first", first.to_rfc3339())
            .with_attribute("last", last.to_rfc3339());
    }
    Ok(entry)
}

pub(crate) fn decode_series(entry: &Entry) -> ReaderResult<Series> {
    let decoded: Series = serde_json::from_slice(&entry.payload)?;
    Ok(Series::from_points(decoded.into_points()))
}

pub(crate) fn store_metadata_in<S: KvStore>(
    store: &S,
    tagname: &str,
    metadata: &TagMetadata,
) -> ReaderResult<TagMetadata> {
    let key = metadata_key(tagname);
    store.write(|view| {
        let mut merged = match view.get(&key)? {
            Some(entry) => serde_json::from_slice::<TagMetadata>(&entry.payload)?,
            None => TagMetadata::new(),
        };
        merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        view.put(&key, &Entry::new(serde_json::to_vec(&merged)?))?;
        Ok(merged)
    })
}

pub(crate) fn fetch_metadata_in<S: KvStore>(store: &S, tagname: &str) -> ReaderResult<TagMetadata> {
    let key = metadata_key(tagname);
    let found = store.read(|view| match view.get(&key)? {
        Some(entry) => Ok(serde_json::from_slice::<TagMetadata>(&entry.payload)?),
        None => Ok(TagMetadata::new()),
    })?;
    Ok(found.unwrap_or_default())
}

pub(crate) fn delete_metadata_in<S: KvStore>(store: &S, tagname: &str) -> ReaderResult<bool> {
    let key = metadata_key(tagname);
    if store.read(|_| Ok(()))?.is_none() {
        return Ok(false);
    }
    store.write(|view| view.delete(&key))
}

pub(crate) fn clear_in<S: KvStore>(store: &S) -> ReaderResult<()> {
    if store.read(|_| Ok(()))?.is_none() {
        return Ok(());
    }
    // Expired entries are invisible to the view below.
    store.purge_expired()?;
    store.write(|view| {
        for key in view.keys_with_prefix("")? {
            view.delete(&key)?;
        }
        Ok(())
    })
}
