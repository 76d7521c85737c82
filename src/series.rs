//! Single-tag time series with a strictly increasing, unique time index.

use crate::interval::Interval;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    #[serde(rename = "t", with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "v")]
    pub value: Option<f64>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl TimeSeriesPoint {
    pub fn new(timestamp: DateTime<Utc>, value: Option<f64>) -> Self {
        Self {
            timestamp,
            value,
            status: None,
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }
}

/// Points sorted ascending by timestamp with no duplicate timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Series {
    points: Vec<TimeSeriesPoint>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts and deduplicates; on duplicate timestamps the earliest point in
    /// `points` wins.
    pub fn from_points(mut points: Vec<TimeSeriesPoint>) -> Self {
        points.sort_by_key(|point| point.timestamp);
        points.dedup_by_key(|point| point.timestamp);
        Self { points }
    }

    /// Concatenates in order and deduplicates keeping the first occurrence of
    /// every timestamp.
    pub fn merge_keep_first(frames: impl IntoIterator<Item = Series>) -> Self {
        let mut points = Vec::new();
        for frame in frames {
            points.extend(frame.points);
        }
        Self::from_points(points)
    }

    /// Adds only the points whose timestamps are not already present; existing
    /// values win on conflict.
    pub fn append_missing(&mut self, other: &Series) -> usize {
        let existing: BTreeSet<DateTime<Utc>> = self.timestamps().collect();
        let before = self.points.len();
        self.points.extend(
            other
                .points
                .iter()
                .filter(|point| !existing.contains(&point.timestamp))
                .copied(),
        );
        self.points.sort_by_key(|point| point.timestamp);
        self.points.len() - before
    }

    /// Points with `start <= t <= end`.
    pub fn slice(&self, range: Interval) -> Series {
        self.filter_bounds(Some(range.start), Some(range.end), true)
    }

    /// Points with `t >= start` and `t <= stop` (or `t < stop` when the stop
    /// bound is exclusive). Missing bounds are open.
    pub fn filter_bounds(
        &self,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        stop_inclusive: bool,
    ) -> Series {
        let lower = match start {
            Some(start) => self.points.partition_point(|p| p.timestamp < start),
            None => 0,
        };
        let upper = match stop {
            Some(stop) if stop_inclusive => self.points.partition_point(|p| p.timestamp <= stop),
            Some(stop) => self.points.partition_point(|p| p.timestamp < stop),
            None => self.points.len(),
        };
        let points = if lower < upper {
            self.points[lower..upper].to_vec()
        } else {
            Vec::new()
        };
        Series { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TimeSeriesPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<TimeSeriesPoint> {
        self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeSeriesPoint> {
        self.points.iter()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.points.iter().map(|point| point.timestamp)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|point| point.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|point| point.timestamp)
    }

    pub fn contains_timestamp(&self, timestamp: DateTime<Utc>) -> bool {
        self.points
            .binary_search_by_key(&timestamp, |point| point.timestamp)
            .is_ok()
    }

    pub fn get(&self, timestamp: DateTime<Utc>) -> Option<&TimeSeriesPoint> {
        self.points
            .binary_search_by_key(&timestamp, |point| point.timestamp)
            .ok()
            .map(|idx| &self.points[idx])
    }

    /// Mean spacing of the first two samples, used when a sampling interval
    /// has to be inferred from data.
    pub fn leading_spacing(&self) -> Option<Duration> {
        match self.points.as_slice() {
            [first, second, ..] => Some(second.timestamp - first.timestamp),
            _ => None,
        }
    }

    pub fn span(&self) -> Option<Interval> {
        Some(Interval {
            start: self.first_timestamp()?,
            end: self.last_timestamp()?,
        })
    }
}

impl FromIterator<TimeSeriesPoint> for Series {
    fn from_iter<I: IntoIterator<Item = TimeSeriesPoint>>(iter: I) -> Self {
        Self::from_points(iter.into_iter().collect())
    }
}

impl IntoIterator for Series {
    type Item = TimeSeriesPoint;
    type IntoIter = std::vec::IntoIter<TimeSeriesPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}
