use super::safe_tagname;
use crate::read_mode::ReadMode;

/// Selects cached data entries for invalidation.
///
/// Values within one dimension are alternatives; dimensions combine with AND.
/// A dimension with no values matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMatch {
    modes: Vec<ReadMode>,
    sample_intervals: Vec<u64>,
    tagnames: Vec<String>,
}

impl TagMatch {
    /// Matches every data entry.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: ReadMode) -> Self {
        self.modes.push(mode);
        self
    }

    pub fn modes(mut self, modes: impl IntoIterator<Item = ReadMode>) -> Self {
        self.modes.extend(modes);
        self
    }

    pub fn sample_interval(mut self, seconds: u64) -> Self {
        self.sample_intervals.push(seconds);
        self
    }

    pub fn sample_intervals(mut self, seconds: impl IntoIterator<Item = u64>) -> Self {
        self.sample_intervals.extend(seconds);
        self
    }

    pub fn tagname(mut self, tagname: &str) -> Self {
        self.tagnames.push(safe_tagname(tagname));
        self
    }

    pub fn tagnames<'a>(mut self, tagnames: impl IntoIterator<Item = &'a str>) -> Self {
        self.tagnames.extend(tagnames.into_iter().map(safe_tagname));
        self
    }

    /// `safe_tag` is the sanitized name as it appears in a key. Entries without
    /// a sample interval never satisfy an interval filter.
    pub fn matches(&self, safe_tag: &str, mode: ReadMode, sample_interval: Option<u64>) -> bool {
        if !self.modes.is_empty() && !self.modes.contains(&mode) {
            return false;
        }
        if !self.sample_intervals.is_empty() {
            match sample_interval {
                Some(seconds) if self.sample_intervals.contains(&seconds) => {}
                _ => return false,
            }
        }
        if !self.tagnames.is_empty() && !self.tagnames.iter().any(|name| name == safe_tag) {
            return false;
        }
        true
    }
}
