//! Input and output shapes of the extractor

use serde::{Deserialize, Serialize};
use statbucket_common::Row;
use std::collections::BTreeMap;

use crate::schema::ColumnDescriptor;

/// One raw table cell: display text plus the first link it carried
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cell {
    pub text: String,
    pub link: Option<String>,
}

impl Cell {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link: None,
        }
    }

    pub fn with_link(text: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link: Some(link.into()),
        }
    }
}

/// Header labels and rows of cells, as located on a page
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TabularUnit {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Where an output column came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Header label as it appeared on the page
    pub source_header: String,
    pub handler: String,
}

/// Values of one accepted source row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRow {
    /// Index of the row within the tabular unit
    pub source_index: usize,
    pub values: Row,
}

/// A row dropped because a required column came out empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub source_index: usize,
    pub column: String,
}

/// Output of extracting one tabular unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub dataset: String,
    /// Output columns in deterministic order, with inferred kinds
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<ExtractedRow>,
    pub rejected: Vec<RejectedRow>,
    /// Provenance of columns produced by expanding handlers
    pub provenance: BTreeMap<String, Provenance>,
}

impl Extraction {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into_iter().map(|r| r.values).collect()
    }
}
