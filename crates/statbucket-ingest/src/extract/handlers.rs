//! Column handlers
//!
//! A handler turns one raw cell into one or more named values. The set is
//! closed: [`HandlerSpec`] is the serializable description used in dataset
//! configuration, and [`HandlerSpec::build`] compiles it into a
//! [`ColumnHandler`] trait object.

use regex::Regex;
use serde::{Deserialize, Serialize};
use statbucket_common::Value;
use std::sync::{Arc, LazyLock};

use super::types::Cell;
use crate::error::ExtractionError;

/// Source tokens that mean "no value"
pub const PLACEHOLDER_TOKENS: &[&str] = &["", "-", "—", "–", "N/A", "n/a", "NA"];

/// Default pattern for numeric extraction
pub const DEFAULT_NUMERIC_PATTERN: &str = r"[-+]?\d[\d,]*(?:\.\d+)?|[-+]?\.\d+";

static DEFAULT_NUMERIC: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(DEFAULT_NUMERIC_PATTERN).ok());

/// Converts one cell into a fixed number of output values
pub trait ColumnHandler: Send + Sync + std::fmt::Debug {
    /// Short name recorded in column descriptors and provenance
    fn name(&self) -> &'static str;

    /// Output column names for a source column, in expansion order
    fn output_names(&self, column: &str) -> Vec<String>;

    /// Values for one cell; always as many as `output_names` returns
    fn apply(&self, cell: &Cell) -> Vec<Value>;
}

/// Trim and map placeholder tokens to `None`
pub fn clean_text(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if PLACEHOLDER_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_number(token: &str) -> Value {
    token
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(Value::Number)
        .unwrap_or(Value::Empty)
}

/// First numeric token of `text` with thousands separators removed.
///
/// Text columns retyped to numbers go through the same rule, so `"82 games"`
/// becomes 82 and `"N/A"` becomes empty.
pub fn first_number(text: &str) -> Value {
    let Some(pattern) = DEFAULT_NUMERIC.as_ref() else {
        return Value::Empty;
    };
    clean_text(text)
        .and_then(|t| pattern.find(t))
        .map(|m| parse_number(m.as_str()))
        .unwrap_or(Value::Empty)
}

/// Trimmed text, placeholders become empty
#[derive(Debug, Clone, Default)]
pub struct IdentityHandler;

impl ColumnHandler for IdentityHandler {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn output_names(&self, column: &str) -> Vec<String> {
        vec![column.to_string()]
    }

    fn apply(&self, cell: &Cell) -> Vec<Value> {
        vec![clean_text(&cell.text).map(Value::text).unwrap_or(Value::Empty)]
    }
}

/// Pulls the first numeric token out of the cell text
#[derive(Debug, Clone)]
pub struct NumericHandler {
    pattern: Regex,
}

impl NumericHandler {
    pub fn new(pattern: Option<&str>) -> Result<Self, ExtractionError> {
        Ok(Self {
            pattern: compile(pattern.unwrap_or(DEFAULT_NUMERIC_PATTERN))?,
        })
    }
}

impl ColumnHandler for NumericHandler {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn output_names(&self, column: &str) -> Vec<String> {
        vec![column.to_string()]
    }

    fn apply(&self, cell: &Cell) -> Vec<Value> {
        let Some(text) = clean_text(&cell.text) else {
            return vec![Value::Empty];
        };
        let value = self
            .pattern
            .captures(text)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| parse_number(m.as_str()))
            .unwrap_or(Value::Empty);
        vec![value]
    }
}

/// Splits a linked cell into its text and link target
#[derive(Debug, Clone, Default)]
pub struct LinkSplitHandler {
    text_column: Option<String>,
    url_column: Option<String>,
}

impl LinkSplitHandler {
    pub fn new(text_column: Option<String>, url_column: Option<String>) -> Self {
        Self {
            text_column,
            url_column,
        }
    }
}

impl ColumnHandler for LinkSplitHandler {
    fn name(&self) -> &'static str {
        "link_split"
    }

    fn output_names(&self, column: &str) -> Vec<String> {
        vec![
            self.text_column
                .clone()
                .unwrap_or_else(|| format!("{}_text", column)),
            self.url_column
                .clone()
                .unwrap_or_else(|| format!("{}_url", column)),
        ]
    }

    fn apply(&self, cell: &Cell) -> Vec<Value> {
        let text = clean_text(&cell.text).map(Value::text).unwrap_or(Value::Empty);
        let url = cell
            .link
            .as_deref()
            .map(str::trim)
            .map(Value::text)
            .unwrap_or(Value::Empty);
        vec![text, url]
    }
}

/// Splits one cell into N named values using capture groups
#[derive(Debug, Clone)]
pub struct OneToManyHandler {
    pattern: Regex,
    outputs: Vec<String>,
    numeric: bool,
}

impl OneToManyHandler {
    pub fn new(
        column: &str,
        pattern: &str,
        outputs: Vec<String>,
        numeric: bool,
    ) -> Result<Self, ExtractionError> {
        let pattern = compile(pattern)?;
        let groups = pattern.captures_len() - 1;
        if outputs.is_empty() || groups != outputs.len() {
            return Err(ExtractionError::OutputMismatch {
                column: column.to_string(),
                declared: outputs.len(),
                groups,
            });
        }
        Ok(Self {
            pattern,
            outputs,
            numeric,
        })
    }
}

impl ColumnHandler for OneToManyHandler {
    fn name(&self) -> &'static str {
        "one_to_many"
    }

    fn output_names(&self, _column: &str) -> Vec<String> {
        self.outputs.clone()
    }

    fn apply(&self, cell: &Cell) -> Vec<Value> {
        let captures = clean_text(&cell.text).and_then(|text| self.pattern.captures(text));
        (1..=self.outputs.len())
            .map(|i| {
                let Some(m) = captures.as_ref().and_then(|c| c.get(i)) else {
                    return Value::Empty;
                };
                if self.numeric {
                    parse_number(m.as_str().trim())
                } else {
                    clean_text(m.as_str()).map(Value::text).unwrap_or(Value::Empty)
                }
            })
            .collect()
    }
}

fn compile(pattern: &str) -> Result<Regex, ExtractionError> {
    Regex::new(pattern).map_err(|e| ExtractionError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Serializable handler description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerSpec {
    Identity,
    Numeric {
        #[serde(default)]
        pattern: Option<String>,
    },
    LinkSplit {
        #[serde(default)]
        text_column: Option<String>,
        #[serde(default)]
        url_column: Option<String>,
    },
    OneToMany {
        pattern: String,
        outputs: Vec<String>,
        #[serde(default)]
        numeric: bool,
    },
}

impl HandlerSpec {
    /// Compile into a handler for `column`; fails on bad patterns
    pub fn build(&self, column: &str) -> Result<Arc<dyn ColumnHandler>, ExtractionError> {
        Ok(match self {
            HandlerSpec::Identity => Arc::new(IdentityHandler),
            HandlerSpec::Numeric { pattern } => Arc::new(NumericHandler::new(pattern.as_deref())?),
            HandlerSpec::LinkSplit {
                text_column,
                url_column,
            } => Arc::new(LinkSplitHandler::new(text_column.clone(), url_column.clone())),
            HandlerSpec::OneToMany {
                pattern,
                outputs,
                numeric,
            } => Arc::new(OneToManyHandler::new(column, pattern, outputs.clone(), *numeric)?),
        })
    }
}
