//! Historian access seam.
//!
//! Protocol-specific clients (ODBC, REST) implement [`Backend`]; the planner
//! and client only ever talk to this trait.

pub mod memory;

pub use memory::MemoryHistorian;

use crate::error::{ReaderError, ReaderResult};
use crate::metadata::{text_property, TagInfo, TagMetadata, DESCRIPTION, UNIT};
use crate::read_mode::ReadMode;
use crate::series::Series;
use chrono::{DateTime, Utc};

/// One backend read for a single tag.
#[derive(Debug, Clone, Copy)]
pub struct RangeQuery<'a> {
    pub tag: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Seconds between grid points; `None` for RAW and SNAPSHOT.
    pub sample_interval: Option<u64>,
    pub mode: ReadMode,
    pub metadata: &'a TagMetadata,
    pub stepped: bool,
    pub include_status: bool,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Row cap of a single response. A response of exactly this size may be
    /// truncated and is followed up by another read.
    fn max_rows(&self) -> usize;

    /// `None` means the tag does not exist.
    fn resolve_metadata(&self, tag: &str) -> ReaderResult<Option<TagMetadata>>;

    /// Points in ascending order, at most `max_rows()` of them. A range
    /// without data yields an empty series.
    fn read_range(&self, query: &RangeQuery<'_>) -> ReaderResult<Series>;

    /// Tags whose name and description match the `*`/`?` wildcard patterns.
    fn search(
        &self,
        tag_pattern: Option<&str>,
        description_pattern: Option<&str>,
    ) -> ReaderResult<Vec<TagInfo>>;

    fn unit(&self, tag: &str) -> ReaderResult<Option<String>> {
        let metadata = self
            .resolve_metadata(tag)?
            .ok_or_else(|| ReaderError::not_found(tag))?;
        Ok(text_property(&metadata, UNIT))
    }

    fn description(&self, tag: &str) -> ReaderResult<Option<String>> {
        let metadata = self
            .resolve_metadata(tag)?
            .ok_or_else(|| ReaderError::not_found(tag))?;
        Ok(text_property(&metadata, DESCRIPTION))
    }
}

/// Case-insensitive match supporting `*` (any run) and `?` (one char).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
