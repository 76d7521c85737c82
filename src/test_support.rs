use crate::backend::{Backend, RangeQuery};
use crate::error::{ReaderError, ReaderResult};
use crate::metadata::{TagInfo, TagMetadata};
use crate::series::{Series, TimeSeriesPoint};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .expect("valid utc time")
}

/// Points at `start + i` minutes for each `i` in `offsets`, valued `base + i`.
pub fn minute_series(start: DateTime<Utc>, offsets: Range<i64>, base: f64) -> Series {
    offsets
        .map(|i| TimeSeriesPoint::new(start + Duration::minutes(i), Some(base + i as f64)))
        .collect()
}

/// Wraps a backend and records every call made through it.
pub struct CountingBackend<B> {
    inner: B,
    reads: AtomicUsize,
    resolves: AtomicUsize,
    ranges: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl<B: Backend> CountingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.ranges.lock().expect("ranges lock").clone()
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Backend> Backend for CountingBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn max_rows(&self) -> usize {
        self.inner.max_rows()
    }

    fn resolve_metadata(&self, tag: &str) -> ReaderResult<Option<TagMetadata>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_metadata(tag)
    }

    fn read_range(&self, query: &RangeQuery<'_>) -> ReaderResult<Series> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.ranges
            .lock()
            .expect("ranges lock")
            .push((query.start, query.end));
        self.inner.read_range(query)
    }

    fn search(
        &self,
        tag_pattern: Option<&str>,
        description_pattern: Option<&str>,
    ) -> ReaderResult<Vec<TagInfo>> {
        self.inner.search(tag_pattern, description_pattern)
    }
}

/// Serves pre-scripted responses in order, regardless of the query.
pub struct ScriptedBackend {
    max_rows: usize,
    responses: Mutex<VecDeque<ReaderResult<Series>>>,
    starts: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedBackend {
    pub fn new(max_rows: usize, responses: Vec<ReaderResult<Series>>) -> Self {
        Self {
            max_rows,
            responses: Mutex::new(responses.into()),
            starts: Mutex::new(Vec::new()),
        }
    }

    /// Start bounds of every read, in call order.
    pub fn starts(&self) -> Vec<DateTime<Utc>> {
        self.starts.lock().expect("starts lock").clone()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn max_rows(&self) -> usize {
        self.max_rows
    }

    fn resolve_metadata(&self, _tag: &str) -> ReaderResult<Option<TagMetadata>> {
        Ok(Some(TagMetadata::new()))
    }

    fn read_range(&self, query: &RangeQuery<'_>) -> ReaderResult<Series> {
        self.starts.lock().expect("starts lock").push(query.start);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(ReaderError::Connection("script exhausted".to_string())))
    }

    fn search(&self, _: Option<&str>, _: Option<&str>) -> ReaderResult<Vec<TagInfo>> {
        Ok(Vec::new())
    }
}
