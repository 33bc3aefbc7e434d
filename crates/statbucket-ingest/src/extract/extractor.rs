//! Maps a tabular unit to named output columns per row

use statbucket_common::{Row, Value, ValueKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::handlers::{ColumnHandler, HandlerSpec, IdentityHandler};
use super::types::{Cell, ExtractedRow, Extraction, Provenance, RejectedRow, TabularUnit};
use crate::error::ExtractionError;
use crate::schema::ColumnDescriptor;

/// Normalize a header label into a column name.
///
/// Lowercases, collapses runs of non-alphanumeric characters to `_` and trims
/// underscores. Returns an empty string when nothing is left.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for ch in label.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Normalize every header; empty labels become `col_<index>` and repeats get
/// `_2`, `_3`, ... in header order.
pub fn normalize_headers(labels: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .enumerate()
        .map(|(index, label)| {
            let base = match normalize_label(label) {
                name if name.is_empty() => format!("col_{}", index),
                name => name,
            };
            unique_name(&base, &mut seen)
        })
        .collect()
}

fn unique_name(base: &str, seen: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut n = 2;
    while !seen.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

/// One slot of the output layout: which header feeds which outputs
#[derive(Debug)]
struct LayoutEntry {
    header_index: usize,
    handler: Arc<dyn ColumnHandler>,
    outputs: Vec<String>,
}

/// Per-dataset extractor
#[derive(Debug, Clone)]
pub struct ShapeExtractor {
    dataset: String,
    handlers: HashMap<String, Arc<dyn ColumnHandler>>,
    fallback: Option<Arc<dyn ColumnHandler>>,
    required_columns: Vec<String>,
}

impl ShapeExtractor {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            handlers: HashMap::new(),
            fallback: None,
            required_columns: Vec::new(),
        }
    }

    /// Build from handler specs keyed by header label
    pub fn from_specs(
        dataset: impl Into<String>,
        handlers: &BTreeMap<String, HandlerSpec>,
        fallback: Option<&HandlerSpec>,
        required_columns: &[String],
    ) -> Result<Self, ExtractionError> {
        let mut extractor = Self::new(dataset).with_required_columns(required_columns.to_vec());
        for (label, spec) in handlers {
            let column = normalize_label(label);
            let handler = spec.build(&column)?;
            extractor = extractor.with_handler(label, handler);
        }
        if let Some(spec) = fallback {
            extractor = extractor.with_fallback(spec.build("*")?);
        }
        Ok(extractor)
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Register a handler for a header label (matched after normalization)
    pub fn with_handler(mut self, label: &str, handler: Arc<dyn ColumnHandler>) -> Self {
        self.handlers.insert(normalize_label(label), handler);
        self
    }

    /// Handler used for every column without an exact match
    pub fn with_fallback(mut self, handler: Arc<dyn ColumnHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn with_required_columns(mut self, columns: Vec<String>) -> Self {
        self.required_columns = columns;
        self
    }

    /// Exact label match, then the dataset fallback, then identity
    pub fn resolve(&self, column: &str) -> Arc<dyn ColumnHandler> {
        self.handlers
            .get(column)
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_else(|| Arc::new(IdentityHandler))
    }

    fn layout(&self, headers: &[String]) -> Vec<LayoutEntry> {
        let names = normalize_headers(headers);
        let mut seen = HashSet::new();
        names
            .iter()
            .enumerate()
            .map(|(header_index, name)| {
                let handler = self.resolve(name);
                let outputs = handler
                    .output_names(name)
                    .iter()
                    .map(|out| unique_name(out, &mut seen))
                    .collect();
                LayoutEntry {
                    header_index,
                    handler,
                    outputs,
                }
            })
            .collect()
    }

    /// Output column names for a header list, independent of any row content
    pub fn output_columns(&self, headers: &[String]) -> Vec<String> {
        self.layout(headers)
            .into_iter()
            .flat_map(|entry| entry.outputs)
            .collect()
    }

    /// Extract every row of `unit`.
    ///
    /// Rows with an empty required column are rejected and reported, the
    /// rest of the unit is unaffected.
    pub fn extract(&self, unit: &TabularUnit) -> Extraction {
        let layout = self.layout(&unit.headers);
        let blank = Cell::default();

        let mut rows = Vec::with_capacity(unit.rows.len());
        let mut rejected = Vec::new();

        for (source_index, cells) in unit.rows.iter().enumerate() {
            let mut values = Row::new();
            for entry in &layout {
                let cell = cells.get(entry.header_index).unwrap_or(&blank);
                for (name, value) in entry.outputs.iter().zip(entry.handler.apply(cell)) {
                    values.push(name.clone(), value);
                }
            }

            let missing = self
                .required_columns
                .iter()
                .find(|col| values.get(col).map_or(true, Value::is_empty));
            if let Some(column) = missing {
                let err = ExtractionError::MissingRequired {
                    row: source_index,
                    column: column.clone(),
                };
                warn!(dataset = %self.dataset, error = %err, "Rejected extracted row");
                rejected.push(RejectedRow {
                    source_index,
                    column: column.clone(),
                });
                continue;
            }

            rows.push(ExtractedRow {
                source_index,
                values,
            });
        }

        let mut provenance = BTreeMap::new();
        let mut columns = Vec::new();
        for entry in &layout {
            let source_header = unit.headers[entry.header_index].trim().to_string();
            let expanded = entry.outputs.len() > 1;
            for name in &entry.outputs {
                let kind = rows
                    .iter()
                    .filter_map(|r| r.values.get(name))
                    .fold(ValueKind::Unknown, |acc, v| acc.merge(v.kind()));
                let mut descriptor = ColumnDescriptor::new(name.clone(), entry.handler.name(), kind);
                descriptor.position = columns.len();
                columns.push(descriptor);
                if expanded {
                    provenance.insert(
                        name.clone(),
                        Provenance {
                            source_header: source_header.clone(),
                            handler: entry.handler.name().to_string(),
                        },
                    );
                }
            }
        }

        debug!(
            dataset = %self.dataset,
            columns = columns.len(),
            rows = rows.len(),
            rejected = rejected.len(),
            "Extracted tabular unit"
        );

        Extraction {
            dataset: self.dataset.clone(),
            columns,
            rows,
            rejected,
            provenance,
        }
    }
}
