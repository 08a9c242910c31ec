use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CytoError, Result};

// ---------------------------------------------------------------------------
// Value – a single cell of the event table
// ---------------------------------------------------------------------------

/// A dynamically-typed cell value. Group keys are `Value`s kept in
/// `BTreeMap`s, so `Value` must be `Ord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Null,
}

// -- Manual Eq/Ord so we can put Value in BTreeSet / BTreeMap --

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Value::*;
        fn discriminant(v: &Value) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::String(s) => s.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Null => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "<null>"),
        }
    }
}

impl Value {
    /// Try to interpret the value as an `f64` for numeric comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Name of the runtime type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Null => "null",
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

// ---------------------------------------------------------------------------
// ConditionType – declared type of an experimental condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    Float,
    Int,
    Bool,
    String,
}

impl ConditionType {
    /// Convert `value` to this type, widening ints to floats.
    /// Returns `None` when the runtime type is incompatible.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ConditionType::Float, Value::Float(v)) => Some(Value::Float(*v)),
            (ConditionType::Float, Value::Integer(i)) => Some(Value::Float(*i as f64)),
            (ConditionType::Int, Value::Integer(i)) => Some(Value::Integer(*i)),
            (ConditionType::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (ConditionType::String, Value::String(s)) => Some(Value::String(s.clone())),
            _ => None,
        }
    }

    /// Parse a raw text cell (e.g. from a setup file) as this type.
    pub fn parse_value(self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        let bad = || CytoError::Configuration(format!("'{raw}' is not a valid {self} value"));
        match self {
            ConditionType::Float => raw.parse::<f64>().map(Value::Float).map_err(|_| bad()),
            ConditionType::Int => raw.parse::<i64>().map(Value::Integer).map_err(|_| bad()),
            ConditionType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            ConditionType::String => Ok(Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionType::Float => "float",
            ConditionType::Int => "int",
            ConditionType::Bool => "bool",
            ConditionType::String => "string",
        };
        f.write_str(s)
    }
}

impl FromStr for ConditionType {
    type Err = CytoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" | "double" => Ok(ConditionType::Float),
            "int" | "integer" => Ok(ConditionType::Int),
            "bool" | "boolean" => Ok(ConditionType::Bool),
            "str" | "string" => Ok(ConditionType::String),
            other => Err(CytoError::Configuration(format!(
                "unknown condition type '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Column – one typed column of the event table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl Column {
    /// A column holding `n` copies of an already-coerced value.
    pub fn repeat(value: &Value, n: usize) -> Self {
        match value {
            Value::Float(v) => Column::Float(vec![*v; n]),
            Value::Integer(i) => Column::Int(vec![*i; n]),
            Value::Bool(b) => Column::Bool(vec![*b; n]),
            Value::String(s) => Column::Str(vec![s.clone(); n]),
            Value::Null => Column::Float(vec![f64::NAN; n]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at `row`, or `None` past the end.
    pub fn get(&self, row: usize) -> Option<Value> {
        match self {
            Column::Float(v) => v.get(row).map(|x| Value::Float(*x)),
            Column::Int(v) => v.get(row).map(|x| Value::Integer(*x)),
            Column::Bool(v) => v.get(row).map(|x| Value::Bool(*x)),
            Column::Str(v) => v.get(row).map(|x| Value::String(x.clone())),
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Column::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Column::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            Column::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn dtype(&self) -> ConditionType {
        match self {
            Column::Float(_) => ConditionType::Float,
            Column::Int(_) => ConditionType::Int,
            Column::Bool(_) => ConditionType::Bool,
            Column::Str(_) => ConditionType::String,
        }
    }

    /// Append another column of the same type.
    fn extend(&mut self, other: Column) -> Result<()> {
        match (self, other) {
            (Column::Float(a), Column::Float(b)) => a.extend(b),
            (Column::Int(a), Column::Int(b)) => a.extend(b),
            (Column::Bool(a), Column::Bool(b)) => a.extend(b),
            (Column::Str(a), Column::Str(b)) => a.extend(b),
            (a, b) => {
                return Err(CytoError::Configuration(format!(
                    "cannot append a {} column to a {} column",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventTable – rows (events) × named columns
// ---------------------------------------------------------------------------

/// Column-oriented event table. All columns always have `len()` rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    names: Vec<String>,
    columns: Vec<Column>,
    rows: usize,
}

impl EventTable {
    /// Number of events (rows).
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.position(name).map(|i| &self.columns[i])
    }

    /// Iterate over `(name, column)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(String::as_str).zip(self.columns.iter())
    }

    /// Cell lookup by row index and column name.
    pub fn value(&self, row: usize, name: &str) -> Option<Value> {
        self.column(name)?.get(row)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Append a new column. The table is left untouched on error.
    pub(crate) fn push_column(&mut self, name: &str, column: Column) -> Result<()> {
        if self.contains(name) {
            return Err(CytoError::Configuration(format!(
                "column '{name}' already exists"
            )));
        }
        if !self.names.is_empty() && column.len() != self.rows {
            return Err(CytoError::Configuration(format!(
                "column '{name}' has {} values but the table has {} rows",
                column.len(),
                self.rows
            )));
        }
        self.rows = column.len();
        self.names.push(name.to_string());
        self.columns.push(column);
        Ok(())
    }

    /// Replace the contents of an existing column with a same-length column.
    pub(crate) fn replace_column(&mut self, name: &str, column: Column) -> Result<()> {
        let idx = self.position(name).ok_or_else(|| {
            CytoError::Configuration(format!("no column named '{name}'"))
        })?;
        if column.len() != self.rows {
            return Err(CytoError::Configuration(format!(
                "replacement for '{name}' has {} values, expected {}",
                column.len(),
                self.rows
            )));
        }
        self.columns[idx] = column;
        Ok(())
    }

    /// Append a block of rows. `chunk` must name every existing column
    /// exactly once (or define the columns if the table is still empty),
    /// and all its columns must share one length.
    pub(crate) fn append_rows(&mut self, chunk: Vec<(String, Column)>) -> Result<()> {
        let n = chunk.first().map(|(_, c)| c.len()).unwrap_or(0);
        if let Some((name, _)) = chunk.iter().find(|(_, c)| c.len() != n) {
            return Err(CytoError::Configuration(format!(
                "column '{name}' length differs from the rest of the block"
            )));
        }

        if self.names.is_empty() {
            let mut table = EventTable::default();
            for (name, column) in chunk {
                table.push_column(&name, column)?;
            }
            *self = table;
            return Ok(());
        }

        let chunk_names: BTreeSet<&str> = chunk.iter().map(|(n, _)| n.as_str()).collect();
        let own_names: BTreeSet<&str> = self.names.iter().map(String::as_str).collect();
        if chunk_names != own_names || chunk.len() != self.names.len() {
            return Err(CytoError::Configuration(
                "appended rows must supply exactly the existing columns".to_string(),
            ));
        }
        for (name, column) in &chunk {
            let existing = self.column(name).map(Column::dtype);
            if existing != Some(column.dtype()) {
                return Err(CytoError::Configuration(format!(
                    "column '{name}' type mismatch: expected {:?}, got {}",
                    existing,
                    column.dtype()
                )));
            }
        }

        // Everything checked; the extends below cannot fail.
        for (name, column) in chunk {
            if let Some(idx) = self.position(&name) {
                self.columns[idx].extend(column)?;
            }
        }
        self.rows += n;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tube – one imported sample
// ---------------------------------------------------------------------------

/// The events of one sample: equal-length numeric channel columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Tube {
    pub id: String,
    channels: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl Tube {
    /// Build a tube from `(channel, values)` pairs.
    pub fn new(id: impl Into<String>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let id = id.into();
        let n = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut seen = BTreeSet::new();
        for (name, values) in &columns {
            if !seen.insert(name.as_str()) {
                return Err(CytoError::Configuration(format!(
                    "tube '{id}' has duplicate channel '{name}'"
                )));
            }
            if values.len() != n {
                return Err(CytoError::Configuration(format!(
                    "tube '{id}': channel '{name}' has {} events, expected {n}",
                    values.len()
                )));
            }
        }
        let (channels, columns) = columns.into_iter().unzip();
        Ok(Tube {
            id,
            channels,
            columns,
        })
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn column(&self, channel: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .map(|i| self.columns[i].as_slice())
    }

    pub(crate) fn into_columns(self) -> impl Iterator<Item = (String, Vec<f64>)> {
        self.channels.into_iter().zip(self.columns)
    }
}
