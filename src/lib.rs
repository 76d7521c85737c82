pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod interval;
pub mod logging;
pub mod metadata;
pub mod planner;
pub mod read_mode;
pub mod series;
pub mod table;
pub mod time;

#[cfg(test)]
pub mod test_support;

pub use backend::{Backend, MemoryHistorian, RangeQuery};
pub use cache::{open_cache, Cache, CacheKind, CacheStats, FamilyKey, TagMatch};
pub use client::{ReadRequest, TagClient, TimeArg};
pub use config::ReaderConfig;
pub use error::{ReaderError, ReaderResult};
pub use interval::Interval;
pub use metadata::{MetadataValue, TagInfo, TagMetadata};
pub use read_mode::ReadMode;
pub use series::{Series, TimeSeriesPoint};
pub use table::{Column, Table};
