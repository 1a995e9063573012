//! Per-column statistics over parsed metadata.

use crate::dataset::MetadataValue;
use std::collections::HashMap;

/// Distinct values above which a column stops recording per-value counts.
pub const TOO_MANY_UNIQUE_VALUES: usize = 50;

/// A distinct column value and how often it occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniqueEntry {
    /// Value in display form; numbers are normalized (`3.0` becomes `3`)
    pub label: String,
    /// Number of points carrying the value
    pub count: usize,
}

/// Summary of one metadata column.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnStats {
    /// Column name from the header, or `"label"`
    pub name: String,
    /// Every non-missing value parsed as a number
    pub is_numeric: bool,
    /// More distinct values were seen than the configured threshold
    pub too_many_unique_values: bool,
    /// Smallest numeric value, `f64::INFINITY` if none
    pub min: f64,
    /// Largest numeric value, `f64::NEG_INFINITY` if none
    pub max: f64,
    /// Per-value counts, present only while the column stayed under the
    /// threshold; sorted by descending count, then label
    pub unique_entries: Option<Vec<UniqueEntry>>,
}

/// Accumulates [`ColumnStats`] one value at a time.
#[derive(Debug)]
pub struct ColumnAnalyzer {
    name: String,
    threshold: usize,
    is_numeric: bool,
    too_many_unique_values: bool,
    min: f64,
    max: f64,
    counts: HashMap<String, usize>,
}

impl ColumnAnalyzer {
    /// Starts an analyzer for column `name`.
    pub fn new(name: &str, threshold: usize) -> Self {
        Self {
            name: name.to_owned(),
            threshold,
            is_numeric: true,
            too_many_unique_values: false,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            counts: HashMap::new(),
        }
    }

    /// Records one observed value.
    pub fn observe(&mut self, value: &MetadataValue) {
        let raw = match value {
            MetadataValue::Missing => return,
            MetadataValue::Number(number) => {
                self.min = self.min.min(*number);
                self.max = self.max.max(*number);
                number.to_string()
            }
            MetadataValue::Text(text) => {
                self.is_numeric = false;
                text.clone()
            }
        };

        if self.too_many_unique_values {
            return;
        }

        *self.counts.entry(raw).or_insert(0) += 1;
        if self.counts.len() > self.threshold {
            self.too_many_unique_values = true;
            self.counts = HashMap::new();
        }
    }

    /// Finalizes the statistics.
    pub fn finish(self) -> ColumnStats {
        let unique_entries = (!self.too_many_unique_values).then(|| {
            let mut entries: Vec<UniqueEntry> = self
                .counts
                .into_iter()
                .map(|(label, count)| UniqueEntry { label, count })
                .collect();
            entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
            entries
        });

        ColumnStats {
            name: self.name,
            is_numeric: self.is_numeric,
            too_many_unique_values: self.too_many_unique_values,
            min: self.min,
            max: self.max,
            unique_entries,
        }
    }
}
