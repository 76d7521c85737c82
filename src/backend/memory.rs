//! In-process historian holding recorded raw samples.
//!
//! Reduction modes are computed on the fly from the raw samples so callers can
//! exercise the full read path without a historian server.

use super::{wildcard_match, Backend, RangeQuery};
use crate::error::{ReaderError, ReaderResult};
use crate::metadata::{text_property, TagInfo, TagMetadata, DESCRIPTION};
use crate::read_mode::ReadMode;
use crate::series::{Series, TimeSeriesPoint};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const DEFAULT_MAX_ROWS: usize = 10_000;

const GOOD_STATUS: i32 = 0;
const BAD_STATUS: i32 = 1;

#[derive(Debug, Default, Clone)]
struct RecordedTag {
    metadata: TagMetadata,
    samples: Series,
}

pub struct MemoryHistorian {
    name: String,
    max_rows: usize,
    tags: RwLock<BTreeMap<String, RecordedTag>>,
}

#[derive(Debug, Deserialize)]
struct CsvSample {
    tag: String,
    timestamp: String,
    value: Option<f64>,
    #[serde(default)]
    status: Option<i32>,
}

impl MemoryHistorian {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_rows: DEFAULT_MAX_ROWS,
            tags: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    fn read_tags(&self) -> ReaderResult<RwLockReadGuard<'_, BTreeMap<String, RecordedTag>>> {
        self.tags
            .read()
            .map_err(|_| ReaderError::Connection("historian state lock poisoned".to_string()))
    }

    fn write_tags(&self) -> ReaderResult<RwLockWriteGuard<'_, BTreeMap<String, RecordedTag>>> {
        self.tags
            .write()
            .map_err(|_| ReaderError::Connection("historian state lock poisoned".to_string()))
    }

    /// Creates the tag if needed and merges `metadata` into its properties.
    pub fn add_tag(&self, tag: &str, metadata: TagMetadata) -> ReaderResult<()> {
        let mut tags = self.write_tags()?;
        tags.entry(tag.to_string())
            .or_default()
            .metadata
            .extend(metadata);
        Ok(())
    }

    /// Records samples for `tag`, creating it if needed. Re-recorded
    /// timestamps take the new value.
    pub fn record(
        &self,
        tag: &str,
        points: impl IntoIterator<Item = TimeSeriesPoint>,
    ) -> ReaderResult<usize> {
        let incoming = Series::from_points(points.into_iter().collect());
        let count = incoming.len();
        let mut tags = self.write_tags()?;
        let recorded = tags.entry(tag.to_string()).or_default();
        let existing = std::mem::take(&mut recorded.samples);
        recorded.samples = Series::merge_keep_first([incoming, existing]);
        Ok(count)
    }

    /// Loads `tag,timestamp,value[,status]` rows with a header line.
    /// Timestamps are RFC 3339; an empty value is recorded as null.
    pub fn load_csv<R: Read>(&self, reader: R) -> ReaderResult<usize> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut by_tag: BTreeMap<String, Vec<TimeSeriesPoint>> = BTreeMap::new();
        for row in csv_reader.deserialize::<CsvSample>() {
            let row = row?;
            let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
                .map_err(|err| {
                    ReaderError::Serialization(format!(
                        "invalid timestamp {:?} for {}: {err}",
                        row.timestamp, row.tag
                    ))
                })?
                .with_timezone(&Utc);
            by_tag.entry(row.tag).or_default().push(TimeSeriesPoint {
                timestamp,
                value: row.value,
                status: row.status,
            });
        }
        let mut total = 0;
        for (tag, points) in by_tag {
            total += self.record(&tag, points)?;
        }
        tracing::debug!(historian = %self.name, rows = total, "loaded samples from csv");
        Ok(total)
    }

    pub fn load_csv_path(&self, path: &Path) -> ReaderResult<usize> {
        let file = std::fs::File::open(path)?;
        self.load_csv(file)
    }

    fn samples(&self, tag: &str) -> ReaderResult<Series> {
        let tags = self.read_tags()?;
        tags.get(tag)
            .map(|recorded| recorded.samples.clone())
            .ok_or_else(|| ReaderError::not_found(tag))
    }
}

fn is_good(point: &TimeSeriesPoint) -> bool {
    point.status.unwrap_or(GOOD_STATUS) == GOOD_STATUS
}

fn grid_step(query: &RangeQuery<'_>) -> ReaderResult<Duration> {
    query
        .sample_interval
        .filter(|seconds| *seconds > 0)
        .and_then(|seconds| i64::try_from(seconds).ok())
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            ReaderError::invalid(format!(
                "{} read of {} needs a sample interval between one second and {} seconds",
                query.mode,
                query.tag,
                Duration::MAX.num_seconds()
            ))
        })
}

fn output_point(timestamp: DateTime<Utc>, value: Option<f64>, include_status: bool) -> TimeSeriesPoint {
    let point = TimeSeriesPoint::new(timestamp, value);
    if include_status {
        point.with_status(if value.is_some() { GOOD_STATUS } else { BAD_STATUS })
    } else {
        point
    }
}

/// At most `limit` grid points from `query.start` through `query.end`.
fn interpolate(
    samples: &Series,
    query: &RangeQuery<'_>,
    limit: usize,
) -> ReaderResult<Vec<TimeSeriesPoint>> {
    let step = grid_step(query)?;
    let points = samples.points();
    let mut out = Vec::new();
    let mut t = query.start;
    while t <= query.end && out.len() < limit {
        let after = points.partition_point(|p| p.timestamp <= t);
        let value = match (after.checked_sub(1).map(|i| &points[i]), points.get(after)) {
            (None, _) => None,
            (Some(prev), _) if prev.timestamp == t || query.stepped => prev.value,
            (Some(prev), None) => prev.value,
            (Some(prev), Some(next)) => match (prev.value, next.value) {
                (Some(a), Some(b)) => {
                    let span = (next.timestamp - prev.timestamp).num_milliseconds() as f64;
                    let offset = (t - prev.timestamp).num_milliseconds() as f64;
                    Some(a + (b - a) * offset / span)
                }
                _ => prev.value,
            },
        };
        out.push(output_point(t, value, query.include_status));
        match t.checked_add_signed(step) {
            Some(next) => t = next,
            None => break,
        }
    }
    Ok(out)
}

/// At most `limit` windows `[t, t + step)` starting before `query.end`.
fn aggregate(
    samples: &Series,
    query: &RangeQuery<'_>,
    limit: usize,
) -> ReaderResult<Vec<TimeSeriesPoint>> {
    let step = grid_step(query)?;
    let mut out = Vec::new();
    let mut t = query.start;
    while t < query.end && out.len() < limit {
        let next = t.checked_add_signed(step);
        let window = samples.filter_bounds(Some(t), next, false);
        let good: Vec<f64> = window
            .iter()
            .filter(|p| is_good(p))
            .filter_map(|p| p.value)
            .collect();
        let n = good.len() as f64;
        let mean = || good.iter().sum::<f64>() / n;
        let variance = || {
            let m = mean();
            good.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n
        };
        let value = match query.mode {
            ReadMode::Count => Some(window.len() as f64),
            ReadMode::Good => Some(window.iter().filter(|p| is_good(p)).count() as f64),
            ReadMode::Bad => Some(window.iter().filter(|p| !is_good(p)).count() as f64),
            _ if good.is_empty() => None,
            ReadMode::Min => good.iter().copied().reduce(f64::min),
            ReadMode::Max => good.iter().copied().reduce(f64::max),
            ReadMode::Average => Some(mean()),
            ReadMode::Variance => Some(variance()),
            ReadMode::StdDev => Some(variance().sqrt()),
            ReadMode::Range => {
                let min = good.iter().copied().fold(f64::INFINITY, f64::min);
                let max = good.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Some(max - min)
            }
            ReadMode::Sum => Some(good.iter().sum()),
            other => {
                return Err(ReaderError::UnsupportedMode {
                    mode: other,
                    backend: "memory".to_string(),
                })
            }
        };
        out.push(output_point(t, value, query.include_status));
        match next {
            Some(next) => t = next,
            None => break,
        }
    }
    Ok(out)
}

impl Backend for MemoryHistorian {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_rows(&self) -> usize {
        self.max_rows
    }

    fn resolve_metadata(&self, tag: &str) -> ReaderResult<Option<TagMetadata>> {
        let tags = self.read_tags()?;
        Ok(tags.get(tag).map(|recorded| recorded.metadata.clone()))
    }

    fn read_range(&self, query: &RangeQuery<'_>) -> ReaderResult<Series> {
        if query.end < query.start {
            return Err(ReaderError::invalid(format!(
                "read of {} ends before it starts",
                query.tag
            )));
        }
        let samples = self.samples(query.tag)?;
        let mut points = match query.mode {
            ReadMode::Raw => samples
                .filter_bounds(Some(query.start), Some(query.end), true)
                .into_points()
                .into_iter()
                .map(|mut p| {
                    if query.include_status {
                        p.status = Some(p.status.unwrap_or(GOOD_STATUS));
                    } else {
                        p.status = None;
                    }
                    p
                })
                .collect(),
            ReadMode::Snapshot => samples
                .filter_bounds(None, Some(query.end), true)
                .points()
                .last()
                .map(|p| output_point(p.timestamp, p.value, query.include_status))
                .into_iter()
                .collect(),
            ReadMode::Interpolated => interpolate(&samples, query, self.max_rows)?,
            ReadMode::ShapePreserving | ReadMode::Total => {
                return Err(ReaderError::UnsupportedMode {
                    mode: query.mode,
                    backend: self.name.clone(),
                })
            }
            _ => aggregate(&samples, query, self.max_rows)?,
        };
        points.truncate(self.max_rows);
        tracing::trace!(
            historian = %self.name,
            tag = %query.tag,
            mode = %query.mode,
            rows = points.len(),
            "served range read"
        );
        Ok(Series::from_points(points))
    }

    fn search(
        &self,
        tag_pattern: Option<&str>,
        description_pattern: Option<&str>,
    ) -> ReaderResult<Vec<TagInfo>> {
        let tags = self.read_tags()?;
        Ok(tags
            .iter()
            .filter_map(|(name, recorded)| {
                let description = text_property(&recorded.metadata, DESCRIPTION);
                if let Some(pattern) = tag_pattern {
                    if !wildcard_match(pattern, name) {
                        return None;
                    }
                }
                if let Some(pattern) = description_pattern {
                    if !wildcard_match(pattern, description.as_deref().unwrap_or("")) {
                        return None;
                    }
                }
                Some(TagInfo {
                    name: name.clone(),
                    description,
                })
            })
            .collect())
    }
}
