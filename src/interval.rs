//! Closed time intervals and the subtraction used to find cache gaps.

use crate::error::{ReaderError, ReaderResult};
use chrono::{DateTime, Duration, Utc};

/// A closed interval `[start, end]` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ReaderResult<Self> {
        if end < start {
            return Err(ReaderError::invalid(format!(
                "interval end {} is before start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.end >= other.start && other.end >= self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    pub fn covers(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Smallest interval containing both.
    pub fn span(&self, other: &Interval) -> Interval {
        Interval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Sub-intervals of `request` not covered by any interval in `covering`,
/// ordered by start.
///
/// Pieces share their endpoints with the covering intervals that bound them,
/// so abutting coverage never produces a zero-length gap.
pub fn subtract(request: Interval, covering: &[Interval]) -> Vec<Interval> {
    let mut missing = vec![request];
    for bucket in covering {
        let mut next = Vec::with_capacity(missing.len() + 1);
        for piece in missing {
            if bucket.end < piece.start || bucket.start > piece.end {
                next.push(piece);
            } else if bucket.start <= piece.start && bucket.end >= piece.end {
                // fully covered
            } else if bucket.start > piece.start && bucket.end < piece.end {
                next.push(Interval {
                    start: piece.start,
                    end: bucket.start,
                });
                next.push(Interval {
                    start: bucket.end,
                    end: piece.end,
                });
            } else if bucket.start <= piece.start {
                // covers the head
                next.push(Interval {
                    start: bucket.end,
                    end: piece.end,
                });
            } else {
                // covers the tail
                next.push(Interval {
                    start: piece.start,
                    end: bucket.start,
                });
            }
        }
        missing = next;
    }
    missing.sort();
    missing
}

/// Smallest interval spanning all inputs, if any.
pub fn union_span<'a>(intervals: impl IntoIterator<Item = &'a Interval>) -> Option<Interval> {
    intervals
        .into_iter()
        .copied()
        .reduce(|acc, interval| acc.span(&interval))
}
