//! Per-tag read planning: serve what the cache covers, fetch only the gaps,
//! persist fetched pages as they arrive.

use crate::backend::{Backend, RangeQuery};
use crate::cache::{Cache, FamilyKey};
use crate::error::{ReaderError, ReaderResult};
use crate::interval::Interval;
use crate::metadata::TagMetadata;
use crate::read_mode::ReadMode;
use crate::series::Series;

pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// A single-tag read request with resolved UTC bounds.
#[derive(Debug, Clone, Copy)]
pub struct TagRead<'a> {
    pub tag: &'a str,
    pub range: Interval,
    pub sample_interval: Option<u64>,
    pub mode: ReadMode,
    pub stepped: bool,
    pub include_status: bool,
}

impl TagRead<'_> {
    pub fn family_key(&self) -> FamilyKey {
        FamilyKey::new(self.tag, self.mode, self.sample_interval)
            .stepped(self.stepped)
            .include_status(self.include_status)
    }

    fn query<'m>(&'m self, range: Interval, metadata: &'m TagMetadata) -> RangeQuery<'m> {
        RangeQuery {
            tag: self.tag,
            start: range.start,
            end: range.end,
            sample_interval: self.sample_interval,
            mode: self.mode,
            metadata,
            stepped: self.stepped,
            include_status: self.include_status,
        }
    }
}

pub struct QueryPlanner<'a> {
    backend: &'a dyn Backend,
    cache: Option<&'a dyn Cache>,
    max_pages: usize,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            cache: None,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Reads one tag. A fully cached request never reaches the backend.
    /// Non-fatal conditions are appended to `warnings`.
    pub fn read_tag(&self, read: &TagRead<'_>, warnings: &mut Vec<String>) -> ReaderResult<Series> {
        if read.mode == ReadMode::Snapshot {
            let Some(metadata) = self.resolve(read, warnings)? else {
                return Ok(Series::new());
            };
            return self.backend.read_range(&read.query(read.range, &metadata));
        }

        // RAW and status reads are neither served from nor written to the cache.
        let cache = self
            .cache
            .filter(|_| read.mode.is_cacheable() && !read.include_status);
        let key = read.family_key();

        let mut frames = Vec::new();
        let missing = match cache {
            Some(cache) => match covered_part(cache, &key, read.range) {
                Ok((cached, missing)) => {
                    if missing.is_empty() {
                        tracing::debug!(
                            tag = %read.tag,
                            mode = %read.mode,
                            points = cached.len(),
                            "served from cache"
                        );
                        return Ok(cached);
                    }
                    frames.push(cached);
                    missing
                }
                Err(err) => {
                    tracing::warn!(tag = %read.tag, error = %err, "cache lookup failed; reading from backend");
                    vec![read.range]
                }
            },
            None => vec![read.range],
        };
        tracing::debug!(
            tag = %read.tag,
            mode = %read.mode,
            missing = missing.len(),
            "reading missing intervals from backend"
        );

        let Some(metadata) = self.resolve(read, warnings)? else {
            return Ok(Series::merge_keep_first(frames));
        };
        for interval in missing {
            frames.extend(self.drain(read, interval, &metadata, cache.map(|c| (c, &key)))?);
        }
        // Earlier frames win: cached data first, then pages in fetch order.
        Ok(Series::merge_keep_first(frames))
    }

    fn resolve(&self, read: &TagRead<'_>, warnings: &mut Vec<String>) -> ReaderResult<Option<TagMetadata>> {
        let metadata = self.backend.resolve_metadata(read.tag)?;
        if metadata.is_none() {
            tracing::warn!(tag = %read.tag, backend = %self.backend.name(), "tag not found");
            warnings.push(format!("Tag not found: {}", read.tag));
        }
        Ok(metadata)
    }

    /// Reads `interval`, re-issuing from the last returned timestamp while the
    /// backend keeps answering with full pages.
    fn drain(
        &self,
        read: &TagRead<'_>,
        interval: Interval,
        metadata: &TagMetadata,
        persist: Option<(&dyn Cache, &FamilyKey)>,
    ) -> ReaderResult<Vec<Series>> {
        let max_rows = self.backend.max_rows();
        let mut pages = Vec::new();
        let mut page_start = interval.start;
        let mut count = 0;
        loop {
            let page_range = Interval {
                start: page_start,
                end: interval.end,
            };
            let page = self.backend.read_range(&read.query(page_range, metadata))?;
            count += 1;
            let full = max_rows > 0 && page.len() >= max_rows;
            let last = page.last_timestamp();

            if let Some((cache, key)) = persist {
                // A full page only proves coverage up to its last timestamp.
                let covered_end = if full {
                    last.unwrap_or(page_start)
                } else {
                    interval.end
                };
                if let Ok(covered) = Interval::new(page_start, covered_end) {
                    if let Err(err) = cache.store(key, covered, &page) {
                        tracing::warn!(
                            tag = %read.tag,
                            range = %covered,
                            error = %err,
                            "failed to persist page to cache"
                        );
                    }
                }
            }
            pages.push(page);

            if !full {
                break;
            }
            let Some(next_start) = last.filter(|last| *last > page_start) else {
                return Err(ReaderError::PaginationStalled {
                    tag: read.tag.to_string(),
                    at: page_start,
                });
            };
            if count >= self.max_pages {
                return Err(ReaderError::PaginationOverflow {
                    tag: read.tag.to_string(),
                    pages: count,
                });
            }
            tracing::debug!(tag = %read.tag, page = count, next_start = %next_start, "page limit reached; continuing");
            page_start = next_start;
        }
        Ok(pages)
    }
}

fn covered_part(
    cache: &dyn Cache,
    key: &FamilyKey,
    range: Interval,
) -> ReaderResult<(Series, Vec<Interval>)> {
    let cached = cache.fetch(key, range)?;
    let missing = cache.missing_intervals(key, range)?;
    Ok((cached, missing))
}
