//! Time-ranged buckets per key family.
//!
//! Key layout: `$<tag>$<MODE>[$s<seconds>][$stepped][$status]$_<start>_<end>`
//! with the bucket's covered range in whole epoch seconds, rounded inward so a
//! key never claims time that was not fetched. Everything up to and
//! including `$_` is the family prefix used for enumeration, so coverage is
//! computed from key names alone without loading payloads.

use super::matcher::TagMatch;
use super::store::{KvRead, KvStore};
use super::{
    clear_in, decode_series, delete_metadata_in, fetch_metadata_in, is_metadata_key,
    series_entry, store_metadata_in, Cache, CacheKind, CacheStats, FamilyKey, StatsCounter,
};
use crate::error::ReaderResult;
use crate::interval::{subtract, Interval};
use crate::metadata::TagMetadata;
use crate::read_mode::ReadMode;
use crate::series::Series;
use chrono::{DateTime, Utc};

impl FamilyKey {
    /// `$<tag>$<MODE>[$s<seconds>][$stepped][$status]`
    pub fn bucket_prefix(&self) -> String {
        let mut prefix = format!("${}${}", self.safe_tagname(), self.mode.canonical_name());
        if let Some(seconds) = self.sample_interval {
            prefix.push_str(&format!("$s{seconds}"));
        }
        if self.stepped {
            prefix.push_str("$stepped");
        }
        if self.include_status {
            prefix.push_str("$status");
        }
        prefix
    }

    pub fn family_prefix(&self) -> String {
        format!("{}$_", self.bucket_prefix())
    }

    /// `None` when `range` contains no whole second to key on.
    pub fn bucket_key(&self, range: Interval) -> Option<String> {
        let range = whole_seconds(range)?;
        Some(format!(
            "{}{}_{}",
            self.family_prefix(),
            range.start.timestamp(),
            range.end.timestamp()
        ))
    }
}

/// `range` with the start rounded up and the end rounded down to whole seconds.
pub fn whole_seconds(range: Interval) -> Option<Interval> {
    let mut start = range.start.timestamp();
    if range.start.timestamp_subsec_nanos() > 0 {
        start += 1;
    }
    let start = DateTime::<Utc>::from_timestamp(start, 0)?;
    let end = DateTime::<Utc>::from_timestamp(range.end.timestamp(), 0)?;
    Interval::new(start, end).ok()
}

/// A bucket's key and the range parsed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketName {
    pub key: String,
    pub range: Interval,
}

/// Range encoded in the trailing `$_<start>_<end>` segment, if well formed.
pub fn parse_bucket_range(key: &str) -> Option<Interval> {
    let (_, segment) = key.rsplit_once('$')?;
    let (start, end) = segment.strip_prefix('_')?.split_once('_')?;
    let start = DateTime::<Utc>::from_timestamp(start.parse().ok()?, 0)?;
    let end = DateTime::<Utc>::from_timestamp(end.parse().ok()?, 0)?;
    Interval::new(start, end).ok()
}

/// Sanitized tag, mode and sample interval of a bucket key.
fn parse_bucket_identity(key: &str) -> Option<(&str, ReadMode, Option<u64>)> {
    let mut parts = key.strip_prefix('$')?.split('$');
    let tag = parts.next()?;
    let mode = ReadMode::from_canonical(parts.next()?)?;
    let sample_interval = parts
        .filter_map(|part| part.strip_prefix('s'))
        .find_map(|seconds| seconds.parse::<u64>().ok());
    Some((tag, mode, sample_interval))
}

fn family_buckets<V: KvRead + ?Sized>(view: &V, key: &FamilyKey) -> ReaderResult<Vec<BucketName>> {
    let mut buckets: Vec<BucketName> = view
        .keys_with_prefix(&key.family_prefix())?
        .into_iter()
        .filter_map(|key| {
            let range = parse_bucket_range(&key)?;
            Some(BucketName { key, range })
        })
        .collect();
    buckets.sort_by_key(|bucket| bucket.range);
    Ok(buckets)
}

pub struct BucketCache<S> {
    store: S,
    stats: StatsCounter,
}

impl<S: KvStore> BucketCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stats: StatsCounter::default(),
        }
    }

    pub fn backing_store(&self) -> &S {
        &self.store
    }

    /// Every bucket in the family, ordered by range.
    pub fn buckets(&self, key: &FamilyKey) -> ReaderResult<Vec<BucketName>> {
        Ok(self
            .store
            .read(|view| family_buckets(view, key))?
            .unwrap_or_default())
    }

    pub fn intersecting_buckets(
        &self,
        key: &FamilyKey,
        range: Interval,
    ) -> ReaderResult<Vec<BucketName>> {
        let mut buckets = self.buckets(key)?;
        buckets.retain(|bucket| bucket.range.overlaps(&range));
        Ok(buckets)
    }
}

impl<S: KvStore> Cache for BucketCache<S> {
    fn kind(&self) -> CacheKind {
        CacheKind::Bucket
    }

    fn store(&self, key: &FamilyKey, requested: Interval, series: &Series) -> ReaderResult<()> {
        if series.is_empty() {
            return Ok(());
        }
        if whole_seconds(requested).is_none() {
            tracing::debug!(
                tag = %key.tagname,
                range = %requested,
                "range spans no whole second; not cached"
            );
            return Ok(());
        }
        let (covered, merged_buckets) = self.store.write(|view| {
            let mut covered = requested;
            let mut frames = vec![series.clone()];
            let mut stale = Vec::new();
            for bucket in family_buckets(&*view, key)? {
                if !bucket.range.overlaps(&requested) {
                    continue;
                }
                if let Some(entry) = view.get(&bucket.key)? {
                    frames.push(decode_series(&entry)?);
                }
                covered = covered.span(&bucket.range);
                stale.push(bucket.key);
            }
            // New values come first so they win on duplicate timestamps.
            let merged = Series::merge_keep_first(frames);
            let entry = series_entry(&merged)?;
            let Some(bucket_key) = key.bucket_key(covered) else {
                return Ok((covered, 0));
            };
            for stale_key in &stale {
                view.delete(stale_key)?;
            }
            view.put(&bucket_key, &entry)?;
            Ok((covered, stale.len()))
        })?;
        tracing::debug!(
            tag = %key.tagname,
            mode = %key.mode,
            range = %covered,
            merged_buckets,
            points = series.len(),
            "stored cache bucket"
        );
        Ok(())
    }

    fn fetch(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Series> {
        let frames = self.store.read(|view| {
            let mut frames = Vec::new();
            for bucket in family_buckets(view, key)? {
                if !bucket.range.overlaps(&range) {
                    continue;
                }
                if let Some(entry) = view.get(&bucket.key)? {
                    frames.push(decode_series(&entry)?.slice(range));
                }
            }
            Ok(frames)
        })?;
        Ok(Series::merge_keep_first(frames.unwrap_or_default()))
    }

    fn missing_intervals(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Vec<Interval>> {
        let covering: Vec<Interval> = self
            .intersecting_buckets(key, range)?
            .into_iter()
            .map(|bucket| bucket.range)
            .collect();
        let missing = subtract(range, &covering);
        self.stats.record(&missing);
        Ok(missing)
    }

    fn store_metadata(&self, tagname: &str, metadata: &TagMetadata) -> ReaderResult<TagMetadata> {
        store_metadata_in(&self.store, tagname, metadata)
    }

    fn fetch_metadata(&self, tagname: &str) -> ReaderResult<TagMetadata> {
        fetch_metadata_in(&self.store, tagname)
    }

    fn delete_metadata(&self, tagname: &str) -> ReaderResult<bool> {
        delete_metadata_in(&self.store, tagname)
    }

    fn invalidate(&self, matcher: &TagMatch) -> ReaderResult<usize> {
        if self.store.read(|_| Ok(()))?.is_none() {
            return Ok(0);
        }
        let removed = self.store.write(|view| {
            let mut removed = 0;
            for key in view.keys_with_prefix("$")? {
                if is_metadata_key(&key) {
                    continue;
                }
                let Some((tag, mode, sample_interval)) = parse_bucket_identity(&key) else {
                    continue;
                };
                if matcher.matches(tag, mode, sample_interval) && view.delete(&key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })?;
        tracing::info!(removed, location = %self.store.location(), "invalidated cache buckets");
        Ok(removed)
    }

    fn clear(&self) -> ReaderResult<()> {
        clear_in(&self.store)
    }

    fn purge_expired(&self) -> ReaderResult<usize> {
        self.store.purge_expired()
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset()
    }

    fn remove(&self) -> ReaderResult<()> {
        self.store.destroy()
    }

    fn location(&self) -> String {
        self.store.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{Entry, MemoryKvStore, SqliteKvStore};
    use crate::test_support::{minute_series, utc};
    use chrono::Duration;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        utc(2020, 1, 1, hour, minute, 0)
    }

    fn span(start: (u32, u32), end: (u32, u32)) -> Interval {
        Interval::new(at(start.0, start.1), at(end.0, end.1)).expect("interval")
    }

    /// One point per minute over `range`, inclusive.
    fn grid(range: Interval, base: f64) -> Series {
        let minutes = range.duration().num_minutes();
        minute_series(range.start, 0..minutes + 1, base)
    }

    fn key() -> FamilyKey {
        FamilyKey::new("tag1", ReadMode::Interpolated, Some(60))
    }

    #[test]
    fn key_layout_encodes_family_and_range() {
        let key = FamilyKey::new("ASGB.tt-01", ReadMode::Average, Some(60))
            .stepped(true)
            .include_status(true);
        assert_eq!(key.bucket_prefix(), "$ASGB_tt01$AVG$s60$stepped$status");
        let range = span((12, 0), (13, 0));
        let bucket_key = key.bucket_key(range).expect("whole seconds");
        assert_eq!(
            bucket_key,
            "$ASGB_tt01$AVG$s60$stepped$status$_1577880000_1577883600"
        );
        assert_eq!(parse_bucket_range(&bucket_key), Some(range));

        let raw = FamilyKey::new("tag1", ReadMode::Raw, Some(60));
        assert_eq!(raw.bucket_prefix(), "$tag1$RAW");
    }

    #[test]
    fn malformed_ranges_parse_as_none() {
        assert_eq!(parse_bucket_range("$tag1$INT$s60$_abc_1"), None);
        assert_eq!(parse_bucket_range("$tag1$INT$s60"), None);
        assert_eq!(parse_bucket_range("$tag1$INT$s60$_20_10"), None);
    }

    #[test]
    fn missing_intervals_around_two_buckets_then_merge() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let a = span((12, 0), (13, 0));
        let b = span((13, 30), (14, 0));
        let series_a = grid(a, 0.0);
        let series_b = grid(b, 100.0);
        assert_eq!(series_a.len(), 61);
        assert_eq!(series_b.len(), 31);
        cache.store(&key(), a, &series_a).expect("store a");
        cache.store(&key(), b, &series_b).expect("store b");

        let missing = cache
            .missing_intervals(&key(), span((11, 45), (14, 15)))
            .expect("missing");
        assert_eq!(
            missing,
            vec![
                span((11, 45), (12, 0)),
                span((13, 0), (13, 30)),
                span((14, 0), (14, 15)),
            ]
        );

        let c = span((12, 40), (13, 40));
        cache.store(&key(), c, &grid(c, 500.0)).expect("store c");
        let buckets = cache.buckets(&key()).expect("buckets");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].range, span((12, 0), (14, 0)));

        let all = cache.fetch(&key(), span((12, 0), (14, 0))).expect("fetch");
        assert_eq!(all.len(), 121);
        // The most recent write wins inside the overlap.
        assert_eq!(all.get(at(12, 40)).and_then(|p| p.value), Some(500.0));
        assert_eq!(all.get(at(12, 39)).and_then(|p| p.value), Some(39.0));
        assert_eq!(all.get(at(13, 50)).and_then(|p| p.value), Some(120.0));
    }

    #[test]
    fn store_then_fetch_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = BucketCache::new(SqliteKvStore::new(dir.path().join("c.sqlite")));
        let range = span((12, 0), (13, 0));
        let mut points = grid(range, 0.5).into_points();
        points[3].value = None;
        let series = Series::from_points(points);
        cache.store(&key(), range, &series).expect("store");
        assert_eq!(cache.fetch(&key(), range).expect("fetch"), series);
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (13, 0));
        let series = grid(range, 0.0);
        cache.store(&key(), range, &series).expect("store");
        let once = cache.fetch(&key(), range).expect("fetch");
        cache.store(&key(), range, &series).expect("store again");
        assert_eq!(cache.fetch(&key(), range).expect("fetch"), once);
        assert_eq!(cache.buckets(&key()).expect("buckets").len(), 1);
    }

    #[test]
    fn fetch_is_restricted_to_requested_range() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (13, 0));
        cache.store(&key(), range, &grid(range, 0.0)).expect("store");
        let part = cache
            .fetch(&key(), span((12, 10), (12, 20)))
            .expect("fetch");
        assert_eq!(part.len(), 11);
        assert_eq!(part.first_timestamp(), Some(at(12, 10)));
        assert_eq!(part.last_timestamp(), Some(at(12, 20)));
        assert!(cache
            .fetch(&key(), span((14, 0), (15, 0)))
            .expect("fetch")
            .is_empty());
    }

    #[test]
    fn absent_store_reports_everything_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.sqlite");
        let cache = BucketCache::new(SqliteKvStore::new(&path));
        let range = span((12, 0), (13, 0));
        assert!(cache.fetch(&key(), range).expect("fetch").is_empty());
        assert_eq!(
            cache.missing_intervals(&key(), range).expect("missing"),
            vec![range]
        );
        assert!(cache.fetch_metadata("tag1").expect("metadata").is_empty());
        cache.store(&key(), range, &Series::new()).expect("empty store");
        assert!(!path.exists());
        cache.remove().expect("remove absent");
    }

    #[test]
    fn families_do_not_bleed_into_each_other() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (13, 0));
        let s60 = FamilyKey::new("tag1", ReadMode::Interpolated, Some(60));
        let s600 = FamilyKey::new("tag1", ReadMode::Interpolated, Some(600));
        let stepped = s60.clone().stepped(true);
        let other_tag = FamilyKey::new("tag11", ReadMode::Interpolated, Some(60));
        cache.store(&s600, range, &grid(range, 0.0)).expect("store");
        cache.store(&stepped, range, &grid(range, 0.0)).expect("store");
        cache.store(&other_tag, range, &grid(range, 0.0)).expect("store");

        assert_eq!(cache.missing_intervals(&s60, range).expect("missing"), vec![range]);
        assert!(cache.fetch(&s60, range).expect("fetch").is_empty());
        assert!(cache.missing_intervals(&stepped, range).expect("missing").is_empty());
    }

    #[test]
    fn abutting_ranges_merge_into_one_bucket() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let first = span((12, 0), (13, 0));
        let second = span((13, 0), (14, 0));
        cache.store(&key(), first, &grid(first, 0.0)).expect("store");
        cache.store(&key(), second, &grid(second, 0.0)).expect("store");
        let buckets = cache.buckets(&key()).expect("buckets");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].range, span((12, 0), (14, 0)));
    }

    #[test]
    fn entries_with_unparsable_ranges_are_ignored() {
        let store = MemoryKvStore::new();
        store
            .write(|view| view.put(&format!("{}garbage", key().family_prefix()), &Entry::new(vec![])))
            .expect("write");
        let cache = BucketCache::new(store);
        let range = span((12, 0), (13, 0));
        assert!(cache.buckets(&key()).expect("buckets").is_empty());
        assert_eq!(cache.missing_intervals(&key(), range).expect("missing"), vec![range]);
    }

    #[test]
    fn bucket_attributes_describe_payload() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (12, 5));
        cache.store(&key(), range, &grid(range, 0.0)).expect("store");
        let entry = cache
            .backing_store()
            .read(|view| view.get(&key().bucket_key(range).expect("whole seconds")))
            .expect("read")
            .flatten()
            .expect("entry");
        assert_eq!(entry.attributes["points"], serde_json::json!(6));
        assert_eq!(
            entry.attributes["first"],
            serde_json::json!(at(12, 0).to_rfc3339())
        );
    }

    #[test]
    fn invalidate_removes_matching_families_only() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (13, 0));
        let int60 = FamilyKey::new("tag1", ReadMode::Interpolated, Some(60));
        let avg600 = FamilyKey::new("tag1", ReadMode::Average, Some(600));
        let other = FamilyKey::new("tag2", ReadMode::Interpolated, Some(60));
        for family in [&int60, &avg600, &other] {
            cache.store(family, range, &grid(range, 0.0)).expect("store");
        }
        let mut metadata = TagMetadata::new();
        metadata.insert("unit".to_string(), "%".into());
        cache.store_metadata("tag1", &metadata).expect("metadata");

        let removed = cache
            .invalidate(&TagMatch::any().tagname("tag1").mode(ReadMode::Average))
            .expect("invalidate");
        assert_eq!(removed, 1);
        assert!(cache.buckets(&avg600).expect("buckets").is_empty());
        assert_eq!(cache.buckets(&int60).expect("buckets").len(), 1);

        let removed = cache
            .invalidate(&TagMatch::any().tagname("tag1"))
            .expect("invalidate");
        assert_eq!(removed, 1);
        assert_eq!(cache.buckets(&other).expect("buckets").len(), 1);
        assert_eq!(cache.fetch_metadata("tag1").expect("metadata"), metadata);
    }

    #[test]
    fn clear_and_remove_drop_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.sqlite");
        let cache = BucketCache::new(SqliteKvStore::new(&path));
        let range = span((12, 0), (13, 0));
        cache.store(&key(), range, &grid(range, 0.0)).expect("store");
        cache.clear().expect("clear");
        assert!(path.exists());
        assert!(cache.buckets(&key()).expect("buckets").is_empty());

        cache.store(&key(), range, &grid(range, 0.0)).expect("store");
        cache.remove().expect("remove");
        assert!(!path.exists());
        assert_eq!(cache.missing_intervals(&key(), range).expect("missing"), vec![range]);
    }

    #[test]
    fn subsecond_bounds_round_inward() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let start = at(12, 0) + Duration::milliseconds(500);
        let end = at(12, 10) + Duration::milliseconds(500);
        let range = Interval::new(start, end).expect("interval");
        cache.store(&key(), range, &grid(span((12, 1), (12, 10)), 0.0)).expect("store");
        let buckets = cache.buckets(&key()).expect("buckets");
        assert_eq!(buckets[0].range.start, at(12, 0) + Duration::seconds(1));
        assert_eq!(buckets[0].range.end, at(12, 10));

        // The half second before the first whole second was never fetched.
        let missing = cache.missing_intervals(&key(), range).expect("missing");
        assert_eq!(
            missing,
            vec![
                Interval::new(start, at(12, 0) + Duration::seconds(1)).expect("interval"),
                Interval::new(at(12, 10), end).expect("interval"),
            ]
        );
    }

    #[test]
    fn ranges_inside_one_second_are_not_cached() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let start = at(12, 0) + Duration::milliseconds(100);
        let range = Interval::new(start, start + Duration::milliseconds(500)).expect("interval");
        let series = minute_series(start, 0..1, 1.0);
        cache.store(&key(), range, &series).expect("store");
        assert!(cache.buckets(&key()).expect("buckets").is_empty());
        assert_eq!(key().bucket_key(range), None);
    }

    #[test]
    fn stats_track_lookups() {
        let cache = BucketCache::new(MemoryKvStore::new());
        let range = span((12, 0), (13, 0));
        cache.missing_intervals(&key(), range).expect("missing");
        cache.store(&key(), range, &grid(range, 0.0)).expect("store");
        cache.missing_intervals(&key(), range).expect("missing");
        cache.missing_intervals(&key(), span((12, 10), (12, 20))).expect("missing");
        assert_eq!(cache.stats(), CacheStats { hits: 2, misses: 1 });
        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
