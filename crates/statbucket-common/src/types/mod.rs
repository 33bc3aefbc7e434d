//! Value types that flow from extraction into storage
//!
//! The column set of a dataset is only known after a page has been extracted,
//! so rows are ordered lists of `(column, Value)` pairs instead of compiled
//! records. Destination structure still only changes through migrations.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single extracted cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Free text
    Text(String),
    /// Numeric value (integers are stored as whole floats)
    Number(f64),
    /// Missing value; serialized as JSON `null`
    #[default]
    Empty,
}

impl Value {
    /// Build a text value, mapping an empty string to [`Value::Empty`]
    pub fn text(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.is_empty() {
            Value::Empty
        } else {
            Value::Text(s)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Number(_) => ValueKind::Number,
            Value::Empty => ValueKind::Unknown,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert a JSON scalar into a value. Booleans become text, nested
    /// structures are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Empty,
            serde_json::Value::String(s) => Value::text(s.clone()),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Empty),
            serde_json::Value::Bool(b) => Value::Text(b.to_string()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Empty => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::Empty => Ok(()),
        }
    }
}

/// Kind of values observed in a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Number,
    /// Only empty values have been observed
    #[default]
    Unknown,
}

impl ValueKind {
    pub fn as_str(&self) -> &str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Number => "number",
            ValueKind::Unknown => "unknown",
        }
    }

    /// Widen two observed kinds: text absorbs numbers, unknown absorbs nothing.
    pub fn merge(self, other: ValueKind) -> ValueKind {
        match (self, other) {
            (ValueKind::Unknown, k) | (k, ValueKind::Unknown) => k,
            (ValueKind::Number, ValueKind::Number) => ValueKind::Number,
            _ => ValueKind::Text,
        }
    }
}

impl std::str::FromStr for ValueKind {
    type Err = crate::StatbucketError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "string" => Ok(ValueKind::Text),
            "number" | "numeric" | "float" => Ok(ValueKind::Number),
            "unknown" => Ok(ValueKind::Unknown),
            _ => Err(crate::StatbucketError::Parse(format!("Invalid value kind: {}", s))),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion-ordered mapping from column name to value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, replacing the value in place if the column already exists
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.values.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let idx = self.values.iter().position(|(name, _)| name == column)?;
        Some(self.values.remove(idx).1)
    }

    /// Rename a column in place; no-op if `from` is absent
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some((name, _)) = self.values.iter_mut().find(|(name, _)| name == from) {
            *name = to.to_string();
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Build a row from a JSON object; non-object input yields an empty row
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut row = Row::new();
        if let serde_json::Value::Object(map) = value {
            for (name, v) in map {
                row.push(name.clone(), Value::from_json(v));
            }
        }
        row
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.push(name, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Row, A::Error> {
                let mut row = Row::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    row.push(name, value);
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}
