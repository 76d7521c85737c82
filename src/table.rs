//! Column-aligned multi-tag result.

use crate::error::ReaderResult;
use crate::series::Series;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::io::Write;

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<f64>>,
    /// Present only when status was requested.
    pub status: Option<Vec<Option<i32>>>,
}

impl Column {
    pub fn status_name(&self) -> String {
        format!("{}::status", self.name)
    }
}

/// One row per timestamp seen in any column, ascending, in the display
/// timezone. Cells are `None` where a tag has no sample at that row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    timezone: Tz,
    index: Vec<DateTime<Tz>>,
    columns: Vec<Column>,
    warnings: Vec<String>,
}

impl Table {
    pub fn from_series(timezone: Tz, series: Vec<(String, Series)>, include_status: bool) -> Self {
        let timestamps: BTreeSet<DateTime<Utc>> = series
            .iter()
            .flat_map(|(_, s)| s.timestamps())
            .collect();
        let columns = series
            .into_iter()
            .map(|(name, s)| {
                let rows: Vec<_> = timestamps.iter().map(|t| s.get(*t)).collect();
                Column {
                    name,
                    values: rows.iter().map(|p| p.and_then(|p| p.value)).collect(),
                    status: include_status
                        .then(|| rows.iter().map(|p| p.and_then(|p| p.status)).collect()),
                }
            })
            .collect();
        Self {
            timezone,
            index: timestamps
                .into_iter()
                .map(|t| t.with_timezone(&timezone))
                .collect(),
            columns,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn index(&self) -> &[DateTime<Tz>] {
        &self.index
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Non-fatal conditions met while building the table.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn value(&self, column: &str, at: DateTime<Utc>) -> Option<f64> {
        let row = self
            .index
            .binary_search_by(|t| t.with_timezone(&Utc).cmp(&at))
            .ok()?;
        self.column(column)?.values[row]
    }

    /// Writes a header row (`time`, then each column and status column) and
    /// one line per row with RFC 3339 timestamps. Missing cells are empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> ReaderResult<()> {
        let mut out = csv::Writer::from_writer(writer);
        let mut header = vec!["time".to_string()];
        for column in &self.columns {
            header.push(column.name.clone());
            if column.status.is_some() {
                header.push(column.status_name());
            }
        }
        out.write_record(&header)?;
        for (row, timestamp) in self.index.iter().enumerate() {
            let mut record = vec![timestamp.to_rfc3339()];
            for column in &self.columns {
                record.push(column.values[row].map(|v| v.to_string()).unwrap_or_default());
                if let Some(status) = &column.status {
                    record.push(status[row].map(|s| s.to_string()).unwrap_or_default());
                }
            }
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }
}
