//! One ever-growing series per key family.
//!
//! Keys are `<MODE>[$s<seconds>][$stepped][$status]$<tag>`; the interval
//! segment is absent for modes without a sampling grid. Writes append only
//! timestamps that are not stored yet, so the first value written for a
//! timestamp is kept.

use super::matcher::TagMatch;
use super::store::KvStore;
use super::{
    clear_in, decode_series, delete_metadata_in, fetch_metadata_in, is_metadata_key,
    series_entry, store_metadata_in, Cache, CacheKind, CacheStats, FamilyKey, StatsCounter,
};
use crate::error::{ReaderError, ReaderResult};
use crate::interval::Interval;
use crate::metadata::TagMetadata;
use crate::read_mode::ReadMode;
use crate::series::Series;
use chrono::{DateTime, Duration, Utc};

/// Whether `fetch_between` includes points stamped exactly at `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBound {
    #[default]
    Inclusive,
    Exclusive,
}

impl FamilyKey {
    /// `<MODE>[$s<seconds>][$stepped][$status]$<tag>`
    pub fn legacy_key(&self) -> String {
        let mut key = self.mode.canonical_name().to_string();
        if let Some(seconds) = self.sample_interval.filter(|_| self.mode.uses_sample_interval()) {
            key.push_str(&format!("$s{seconds}"));
        }
        if self.stepped {
            key.push_str("$stepped");
        }
        if self.include_status {
            key.push_str("$status");
        }
        key.push('$');
        key.push_str(&self.safe_tagname());
        key
    }
}

/// Sanitized tag, mode and sample interval of a legacy key.
fn parse_legacy_key(key: &str) -> Option<(&str, ReadMode, Option<u64>)> {
    let mut parts: Vec<&str> = key.split('$').collect();
    if parts.len() < 2 {
        return None;
    }
    let tag = parts.pop()?;
    let mode = ReadMode::from_canonical(parts[0])?;
    let mut sample_interval = None;
    for part in &parts[1..] {
        match *part {
            "stepped" | "status" => {}
            other => sample_interval = Some(other.strip_prefix('s')?.parse::<u64>().ok()?),
        }
    }
    Some((tag, mode, sample_interval))
}

/// Grid step in microseconds, if representable.
fn step_micros(seconds: u64) -> Option<i64> {
    i64::try_from(seconds).ok()?.checked_mul(1_000_000)
}

pub struct LegacyCache<S> {
    store: S,
    stats: StatsCounter,
}

impl<S: KvStore> LegacyCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stats: StatsCounter::default(),
        }
    }

    pub fn backing_store(&self) -> &S {
        &self.store
    }

    /// Appends the points of `series` whose timestamps are not cached yet.
    /// Without an explicit interval, grid modes infer it from the spacing of
    /// the first two samples.
    pub fn store_series(&self, key: &FamilyKey, series: &Series) -> ReaderResult<()> {
        if series.is_empty() {
            return Ok(());
        }
        let sample_interval = match key.sample_interval {
            Some(seconds) => Some(seconds),
            None if key.mode.uses_sample_interval() => {
                let spacing = series.leading_spacing().ok_or_else(|| {
                    ReaderError::invalid(format!(
                        "cannot infer sample interval for {} from a single sample",
                        key.tagname
                    ))
                })?;
                Some(spacing.num_seconds().max(1) as u64)
            }
            None => None,
        };
        let name = FamilyKey {
            sample_interval,
            ..key.clone()
        }
        .legacy_key();
        let added = self.store.write(|view| {
            let mut stored = match view.get(&name)? {
                Some(entry) => decode_series(&entry)?,
                None => Series::new(),
            };
            let added = stored.append_missing(series);
            if added > 0 {
                view.put(&name, &series_entry(&stored)?)?;
            }
            Ok(added)
        })?;
        tracing::debug!(key = %name, added, "appended to legacy cache");
        Ok(())
    }

    /// Cached points with `start <= t` and `t <= stop` (or `t < stop`).
    pub fn fetch_between(
        &self,
        key: &FamilyKey,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        bound: StopBound,
    ) -> ReaderResult<Series> {
        if key.mode.uses_sample_interval() && key.sample_interval.is_none() {
            return Err(ReaderError::invalid(format!(
                "sample interval required to fetch {} data for {}",
                key.mode, key.tagname
            )));
        }
        let name = key.legacy_key();
        let stored = self.store.read(|view| match view.get(&name)? {
            Some(entry) => decode_series(&entry),
            None => Ok(Series::new()),
        })?;
        Ok(stored
            .unwrap_or_default()
            .filter_bounds(start, stop, bound == StopBound::Inclusive))
    }

    /// Grid points of `range` the cache lacks, grouped into intervals.
    ///
    /// The grid starts at `range.start`. Aggregate modes produce one window
    /// per grid point before `range.end`, so their grid excludes the end and a
    /// missing run extends to the end of its last window. Other grid modes
    /// report closed `[first_missing, last_missing]` runs.
    ///
    /// Completeness is judged by row count first: when the cached row count in
    /// `range` equals the grid size, nothing is reported missing, even if
    /// some of those rows are off-grid and interior grid points are absent.
    pub fn grid_missing_intervals(
        &self,
        key: &FamilyKey,
        range: Interval,
    ) -> ReaderResult<Vec<Interval>> {
        if !key.mode.uses_sample_interval() {
            return Ok(vec![range]);
        }
        let step = key
            .sample_interval
            .filter(|seconds| *seconds > 0)
            .and_then(step_micros)
            .ok_or_else(|| {
                ReaderError::invalid(format!(
                    "a usable sample interval is required to compute missing {} data for {}",
                    key.mode, key.tagname
                ))
            })?;
        let span = (range.end - range.start).num_microseconds().ok_or_else(|| {
            ReaderError::invalid(format!("range {range} is too long to lay a grid over"))
        })?;

        let aggregate = key.mode.is_aggregate();
        let grid_len = match (aggregate, span) {
            (true, 0) => 0,
            (true, span) => (span - 1) / step + 1,
            (false, span) => span / step + 1,
        };
        let bound = if aggregate {
            StopBound::Exclusive
        } else {
            StopBound::Inclusive
        };
        let cached = self.fetch_between(key, Some(range.start), Some(range.end), bound)?;
        if cached.len() as i64 == grid_len {
            return Ok(Vec::new());
        }

        // Index runs of absent grid points, found from the cached rows alone.
        let mut runs = Vec::new();
        let mut next = 0_i64;
        for timestamp in cached.timestamps() {
            let Some(offset) = (timestamp - range.start).num_microseconds() else {
                continue;
            };
            if offset % step != 0 {
                continue;
            }
            let index = offset / step;
            if index >= grid_len {
                break;
            }
            if index > next {
                runs.push((next, index - 1));
            }
            next = index + 1;
        }
        if next < grid_len {
            runs.push((next, grid_len - 1));
        }

        let grid_point = |index: i64| {
            index
                .checked_mul(step)
                .and_then(|offset| range.start.checked_add_signed(Duration::microseconds(offset)))
                .map_or(range.end, |t| t.min(range.end))
        };
        Ok(runs
            .into_iter()
            .map(|(first, last)| Interval {
                start: grid_point(first),
                end: if aggregate {
                    grid_point(last + 1)
                } else {
                    grid_point(last)
                },
            })
            .collect())
    }
}

impl<S: KvStore> Cache for LegacyCache<S> {
    fn kind(&self) -> CacheKind {
        CacheKind::Legacy
    }

    /// The requested range is not recorded; coverage is derived from the
    /// stored timestamps.
    fn store(&self, key: &FamilyKey, _requested: Interval, series: &Series) -> ReaderResult<()> {
        self.store_series(key, series)
    }

    fn fetch(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Series> {
        self.fetch_between(key, Some(range.start), Some(range.end), StopBound::Inclusive)
    }

    fn missing_intervals(&self, key: &FamilyKey, range: Interval) -> ReaderResult<Vec<Interval>> {
        let missing = self.grid_missing_intervals(key, range)?;
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
            for key in view.keys_with_prefix("")? {
                if is_metadata_key(&key) {
                    continue;
                }
                let Some((tag, mode, sample_interval)) = parse_legacy_key(&key) else {
                    continue;
                };
                if matcher.matches(tag, mode, sample_interval) && view.delete(&key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })?;
        tracing::info!(removed, location = %self.store.location(), "invalidated legacy cache entries");
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
    use crate::cache::store::{MemoryKvStore, SqliteKvStore};
    use crate::test_support::{minute_series, utc};

    fn start() -> DateTime<Utc> {
        utc(2020, 1, 1, 12, 0, 0)
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        start() + Duration::minutes(n)
    }

    fn int(seconds: Option<u64>) -> FamilyKey {
        FamilyKey::new("tag1", ReadMode::Interpolated, seconds)
    }

    fn span(first: i64, last: i64) -> Interval {
        Interval::new(minutes(first), minutes(last)).expect("interval")
    }

    #[test]
    fn key_layout() {
        let key = FamilyKey::new("tag.1", ReadMode::Interpolated, Some(60));
        assert_eq!(key.legacy_key(), "INT$s60$tag_1");
        assert_eq!(key.clone().stepped(true).legacy_key(), "INT$s60$stepped$tag_1");
        assert_eq!(
            key.stepped(true).include_status(true).legacy_key(),
            "INT$s60$stepped$status$tag_1"
        );
        assert_eq!(FamilyKey::new("tag.1", ReadMode::Raw, Some(60)).legacy_key(), "RAW$tag_1");
        assert_eq!(
            parse_legacy_key("AVG$s600$tag_1"),
            Some(("tag_1", ReadMode::Average, Some(600)))
        );
        assert_eq!(
            parse_legacy_key("INT$s60$stepped$tag_1"),
            Some(("tag_1", ReadMode::Interpolated, Some(60)))
        );
        assert_eq!(parse_legacy_key("RAW$tag_1"), Some(("tag_1", ReadMode::Raw, None)));
        assert_eq!(parse_legacy_key("INT$bogus$tag_1"), None);
        assert_eq!(parse_legacy_key("@metadata@tag_1"), None);
    }

    #[test]
    fn stepped_and_linear_series_are_separate() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let linear = int(Some(60));
        let stepped = linear.clone().stepped(true);
        cache
            .store_series(&stepped, &minute_series(start(), 0..11, 100.0))
            .expect("store");

        assert!(cache.fetch(&linear, span(0, 10)).expect("fetch").is_empty());
        assert_eq!(
            cache.missing_intervals(&linear, span(0, 10)).expect("missing"),
            vec![span(0, 10)]
        );
        assert!(cache
            .missing_intervals(&stepped, span(0, 10))
            .expect("missing")
            .is_empty());
    }

    #[test]
    fn overlapping_store_keeps_first_written_values() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let first = minute_series(start(), 0..10, 0.0);
        let second = minute_series(minutes(8), 0..8, 100.0);
        cache.store_series(&int(Some(60)), &first).expect("store");
        cache.store_series(&int(Some(60)), &second).expect("store");

        let fetched = cache
            .fetch_between(&int(Some(60)), None, None, StopBound::Inclusive)
            .expect("fetch");
        assert_eq!(fetched.len(), 16);
        let timestamps: Vec<_> = fetched.timestamps().collect();
        assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(fetched.get(minutes(8)).and_then(|p| p.value), Some(8.0));
        assert_eq!(fetched.get(minutes(9)).and_then(|p| p.value), Some(9.0));
        assert_eq!(fetched.get(minutes(10)).and_then(|p| p.value), Some(102.0));
    }

    #[test]
    fn round_trip_through_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LegacyCache::new(SqliteKvStore::new(dir.path().join("legacy.sqlite")));
        let series = minute_series(start(), 0..30, 1.5);
        let key = FamilyKey::new("tag1", ReadMode::Average, Some(60));
        let range = span(0, 29);
        cache.store(&key, range, &series).expect("store");
        assert_eq!(cache.fetch(&key, range).expect("fetch"), series);
    }

    #[test]
    fn stop_bound_controls_last_point() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        cache
            .store_series(&int(Some(60)), &minute_series(start(), 0..10, 0.0))
            .expect("store");

        let inclusive = cache
            .fetch_between(&int(Some(60)), Some(minutes(2)), Some(minutes(5)), StopBound::Inclusive)
            .expect("fetch");
        assert_eq!(inclusive.len(), 4);
        assert_eq!(inclusive.last_timestamp(), Some(minutes(5)));

        let exclusive = cache
            .fetch_between(&int(Some(60)), Some(minutes(2)), Some(minutes(5)), StopBound::Exclusive)
            .expect("fetch");
        assert_eq!(exclusive.len(), 3);
        assert_eq!(exclusive.last_timestamp(), Some(minutes(4)));
    }

    #[test]
    fn interval_is_inferred_from_leading_samples() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        cache
            .store_series(&int(None), &minute_series(start(), 0..5, 0.0))
            .expect("store");
        let fetched = cache
            .fetch_between(&int(Some(60)), None, None, StopBound::Inclusive)
            .expect("fetch");
        assert_eq!(fetched.len(), 5);

        let single = minute_series(start(), 0..1, 0.0);
        let err = cache
            .store_series(&FamilyKey::new("tag2", ReadMode::Interpolated, None), &single)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let err = cache
            .fetch_between(&int(None), None, None, StopBound::Inclusive)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn grid_gaps_are_grouped() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let points: Vec<_> = minute_series(start(), 0..11, 0.0)
            .into_iter()
            .filter(|p| ![3, 4, 7].contains(&((p.timestamp - start()).num_minutes())))
            .collect();
        cache
            .store_series(&int(Some(60)), &points.into_iter().collect())
            .expect("store");

        let missing = cache
            .grid_missing_intervals(&int(Some(60)), span(0, 10))
            .expect("missing");
        assert_eq!(missing, vec![span(3, 4), span(7, 7)]);

        let missing = cache
            .grid_missing_intervals(&int(Some(60)), span(0, 12))
            .expect("missing");
        assert_eq!(missing.last().copied(), Some(span(11, 12)));
    }

    #[test]
    fn complete_grid_reports_nothing_missing() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        cache
            .store_series(&int(Some(60)), &minute_series(start(), 0..11, 0.0))
            .expect("store");
        assert!(cache
            .grid_missing_intervals(&int(Some(60)), span(0, 10))
            .expect("missing")
            .is_empty());
    }

    #[test]
    fn count_comparison_hides_interior_gaps() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        // 11 rows in [0, 10] minutes, but minute 5 is replaced by an off-grid sample.
        let points: Vec<_> = minute_series(start(), 0..11, 0.0)
            .into_iter()
            .map(|mut p| {
                if p.timestamp == minutes(5) {
                    p.timestamp += Duration::seconds(30);
                }
                p
            })
            .collect();
        cache
            .store_series(&int(Some(60)), &points.into_iter().collect())
            .expect("store");
        assert!(cache
            .grid_missing_intervals(&int(Some(60)), span(0, 10))
            .expect("missing")
            .is_empty());
    }

    #[test]
    fn surplus_off_grid_rows_do_not_hide_the_requested_grid() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        for offset in [30, 15] {
            let shifted = start() + Duration::seconds(offset);
            cache
                .store_series(&int(Some(60)), &minute_series(shifted, 0..11, 0.0))
                .expect("store");
        }
        let cached = cache.fetch(&int(Some(60)), span(0, 10)).expect("fetch");
        assert_eq!(cached.len(), 20);
        assert_eq!(
            cache
                .grid_missing_intervals(&int(Some(60)), span(0, 10))
                .expect("missing"),
            vec![span(0, 10)]
        );
    }

    #[test]
    fn aggregate_grid_stops_before_range_end() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let avg = FamilyKey::new("tag1", ReadMode::Average, Some(600));
        let windows: Series = minute_series(start(), 0..3, 0.0)
            .into_iter()
            .enumerate()
            .map(|(i, mut p)| {
                p.timestamp = minutes(10 * i as i64);
                p
            })
            .collect();
        cache.store_series(&avg, &windows).expect("store");
        assert!(cache
            .grid_missing_intervals(&avg, span(0, 30))
            .expect("missing")
            .is_empty());

        // Missing windows are reported out to the end of the last one.
        assert_eq!(
            cache
                .grid_missing_intervals(&avg, span(0, 50))
                .expect("missing"),
            vec![span(30, 50)]
        );
        assert_eq!(
            cache
                .grid_missing_intervals(&avg, span(0, 45))
                .expect("missing"),
            vec![span(30, 45)]
        );
        assert!(cache
            .grid_missing_intervals(&avg, span(30, 30))
            .expect("missing")
            .is_empty());
    }

    #[test]
    fn long_ranges_are_resolved_from_cached_rows() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let key = int(Some(1));
        cache
            .store_series(&key, &minute_series(start(), 0..3, 0.0))
            .expect("store");
        let epoch = DateTime::<Utc>::default();
        let range = Interval::new(epoch, minutes(10)).expect("interval");
        let missing = cache.grid_missing_intervals(&key, range).expect("missing");
        assert_eq!(missing.len(), 4);
        assert_eq!(missing[0].start, epoch);
        assert_eq!(missing[0].end, start() - Duration::seconds(1));
        assert_eq!(missing[3].end, minutes(10));
    }

    #[test]
    fn unrepresentable_interval_is_rejected() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let err = cache
            .grid_missing_intervals(&int(Some(u64::MAX)), span(0, 10))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn raw_is_always_missing() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let raw = FamilyKey::new("tag1", ReadMode::Raw, None);
        cache
            .store_series(&raw, &minute_series(start(), 0..11, 0.0))
            .expect("store");
        assert_eq!(
            cache.grid_missing_intervals(&raw, span(0, 10)).expect("missing"),
            vec![span(0, 10)]
        );
    }

    #[test]
    fn stats_track_lookups() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        cache.missing_intervals(&int(Some(60)), span(0, 10)).expect("missing");
        cache
            .store_series(&int(Some(60)), &minute_series(start(), 0..11, 0.0))
            .expect("store");
        cache.missing_intervals(&int(Some(60)), span(0, 10)).expect("missing");
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn invalidate_by_interval() {
        let cache = LegacyCache::new(MemoryKvStore::new());
        let series = minute_series(start(), 0..3, 0.0);
        cache.store_series(&int(Some(60)), &series).expect("store");
        cache.store_series(&int(Some(600)), &series).expect("store");
        cache.store_series(&int(Some(60)).stepped(true), &series).expect("store");
        cache
            .store_series(&FamilyKey::new("tag1", ReadMode::Raw, None), &series)
            .expect("store");

        let removed = cache
            .invalidate(&TagMatch::any().sample_interval(600))
            .expect("invalidate");
        assert_eq!(removed, 1);
        let removed = cache.invalidate(&TagMatch::any()).expect("invalidate");
        assert_eq!(removed, 3);
    }
}
