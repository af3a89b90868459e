//! Typed rows & weighted row batches.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The data type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
        }
    }
}

/// A single field of a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

/// The ordered set of fields which all rows of a pipeline conform to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check that the given row conforms to this schema.
    pub fn check(&self, row: &Row) -> Result<(), String> {
        if row.len() != self.fields.len() {
            return Err(format!("expected {} fields, got {}", self.fields.len(), row.len()));
        }
        for (field, value) in self.fields.iter().zip(row.iter()) {
            field.check(value)?;
        }
        Ok(())
    }
}

impl Field {
    /// Check that the given value conforms to this field.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match (self.data_type, value) {
            (_, Value::Null) if self.nullable => Ok(()),
            (_, Value::Null) => Err(format!("field {} is not nullable", self.name)),
            (DataType::Bool, Value::Bool(_)) | (DataType::Int, Value::Int(_)) | (DataType::String, Value::String(_)) => Ok(()),
            (DataType::Float, Value::Float(val)) if val.is_finite() => Ok(()),
            (DataType::Float, Value::Float(val)) => Err(format!("field {} holds non-finite float {}", self.name, val)),
            (expected, value) => Err(format!("field {} expects {}, got {}", self.name, expected, value.type_name())),
        }
    }
}

/// A single typed value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Parse a text representation of a value of the given type.
    pub fn parse(text: &str, data_type: DataType) -> Result<Self, String> {
        match data_type {
            DataType::Bool => match text {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(format!("invalid bool {:?}", text)),
            },
            DataType::Int => text.parse().map(Self::Int).map_err(|_| format!("invalid int {:?}", text)),
            DataType::Float => text.parse().map(Self::Float).map_err(|_| format!("invalid float {:?}", text)),
            DataType::String => Ok(Self::String(text.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    /// A total order over values, used for consolidation.
    ///
    /// Values of different types order by type, with nulls first.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        fn rank(val: &Value) -> u8 {
            match val {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) => 2,
                Value::Float(_) => 3,
                Value::String(_) => 4,
            }
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(val) => write!(f, "{}", val),
            Self::Int(val) => write!(f, "{}", val),
            Self::Float(val) => write!(f, "{}", val),
            Self::String(val) => write!(f, "{}", val),
        }
    }
}

/// A row of values, ordered as the fields of its schema.
pub type Row = Vec<Value>;

/// Compare two rows under the total value order.
pub fn cmp_rows(a: &Row, b: &Row) -> Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        match va.total_cmp(vb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// An ordered sequence of rows, each carrying a signed weight.
///
/// Positive weights are insertions, negative weights are retractions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<(Row, i64)>,
}

impl RowBatch {
    pub fn new(rows: Vec<(Row, i64)>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Row, weight: i64) {
        self.rows.push((row, weight));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Row, i64)> {
        self.rows.iter()
    }
}

impl FromIterator<(Row, i64)> for RowBatch {
    fn from_iter<T: IntoIterator<Item = (Row, i64)>>(iter: T) -> Self {
        Self { rows: iter.into_iter().collect() }
    }
}
