//! Historian data-reduction modes.
//!
//! Every mode has exactly one canonical name. Canonical names are embedded in
//! persisted cache keys, so they must never change; additional spellings are
//! accepted through [`ALIASES`] when parsing.

use crate::error::{ReaderError, ReaderResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadMode {
    Raw,
    ShapePreserving,
    Interpolated,
    Min,
    Max,
    Average,
    Variance,
    StdDev,
    Range,
    Count,
    Good,
    Bad,
    Total,
    Sum,
    Snapshot,
}

/// Every accepted spelling, grouped by mode. The first entry of each group is
/// the canonical name.
pub const ALIASES: &[(&str, ReadMode)] = &[
    ("RAW", ReadMode::Raw),
    ("SAMPLED", ReadMode::Raw),
    ("ACTUAL", ReadMode::Raw),
    ("SHAPEPRESERVING", ReadMode::ShapePreserving),
    ("BESTFIT", ReadMode::ShapePreserving),
    ("INT", ReadMode::Interpolated),
    ("INTERPOLATE", ReadMode::Interpolated),
    ("INTERPOLATED", ReadMode::Interpolated),
    ("MIN", ReadMode::Min),
    ("MINIMUM", ReadMode::Min),
    ("MAX", ReadMode::Max),
    ("MAXIMUM", ReadMode::Max),
    ("AVG", ReadMode::Average),
    ("AVERAGE", ReadMode::Average),
    ("AVERAGED", ReadMode::Average),
    ("VAR", ReadMode::Variance),
    ("VARIANCE", ReadMode::Variance),
    ("STD", ReadMode::StdDev),
    ("STDDEV", ReadMode::StdDev),
    ("RNG", ReadMode::Range),
    ("RANGE", ReadMode::Range),
    ("COUNT", ReadMode::Count),
    ("GOOD", ReadMode::Good),
    ("BAD", ReadMode::Bad),
    ("NOTGOOD", ReadMode::Bad),
    ("TOTAL", ReadMode::Total),
    ("SUM", ReadMode::Sum),
    ("SNAPSHOT", ReadMode::Snapshot),
    ("FINAL", ReadMode::Snapshot),
    ("LAST", ReadMode::Snapshot),
];

impl ReadMode {
    pub const ALL: [ReadMode; 15] = [
        ReadMode::Raw,
        ReadMode::ShapePreserving,
        ReadMode::Interpolated,
        ReadMode::Min,
        ReadMode::Max,
        ReadMode::Average,
        ReadMode::Variance,
        ReadMode::StdDev,
        ReadMode::Range,
        ReadMode::Count,
        ReadMode::Good,
        ReadMode::Bad,
        ReadMode::Total,
        ReadMode::Sum,
        ReadMode::Snapshot,
    ];

    pub fn canonical_name(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::ShapePreserving => "SHAPEPRESERVING",
            Self::Interpolated => "INT",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Average => "AVG",
            Self::Variance => "VAR",
            Self::StdDev => "STD",
            Self::Range => "RNG",
            Self::Count => "COUNT",
            Self::Good => "GOOD",
            Self::Bad => "BAD",
            Self::Total => "TOTAL",
            Self::Sum => "SUM",
            Self::Snapshot => "SNAPSHOT",
        }
    }

    /// 1-based position in declaration order.
    pub fn ordinal(self) -> u8 {
        self as u8 + 1
    }

    /// Resolves any accepted spelling, case-insensitively.
    pub fn from_alias(name: &str) -> Option<Self> {
        let wanted = name.trim();
        ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(wanted))
            .map(|(_, mode)| *mode)
    }

    /// Resolves a canonical name only. Used when parsing persisted keys.
    pub fn from_canonical(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|mode| mode.canonical_name() == name)
    }

    pub fn aliases(self) -> impl Iterator<Item = &'static str> {
        ALIASES
            .iter()
            .filter(move |(_, mode)| *mode == self)
            .map(|(alias, _)| *alias)
    }

    /// RAW and SNAPSHOT have no sampling grid.
    pub fn uses_sample_interval(self) -> bool {
        !matches!(self, Self::Raw | Self::Snapshot)
    }

    /// Modes whose backend results may be written to the cache.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, Self::Raw | Self::Snapshot)
    }

    pub fn is_aggregate(self) -> bool {
        !matches!(
            self,
            Self::Raw | Self::ShapePreserving | Self::Interpolated | Self::Snapshot
        )
    }
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.canonical_name())
    }
}

impl FromStr for ReadMode {
    type Err = ReaderError;

    fn from_str(s: &str) -> ReaderResult<Self> {
        Self::from_alias(s).ok_or_else(|| {
            ReaderError::invalid(format!(
                "unknown read mode {s:?}; expected one of {}",
                Self::ALL
                    .iter()
                    .map(|mode| mode.canonical_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }
}

impl Serialize for ReadMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.canonical_name())
    }
}

impl<'de> Deserialize<'de> for ReadMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
