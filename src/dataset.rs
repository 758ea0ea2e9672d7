//! In-memory datasets accepted by the fingerprinter
//!
//! Three shapes cover what statistical modules hand over:
//! - [`Dataset::Table`]: named, typed, nullable columns (a data frame)
//! - [`Dataset::Series`]: a single named column
//! - [`Dataset::Matrix`]: an n-dimensional `f64` array in row- or column-major layout
//!
//! Missing values follow data-frame conventions: `None` and `NaN` are both
//! null in float data.
//!
//! # Example
//!
//! ```
//! use reprobundle::dataset::{Column, Dataset};
//!
//! let ds = Dataset::table(vec![
//!     Column::float("dose", vec![0.5, 1.0, 2.0]),
//!     Column::text("arm", vec!["a", "b", "b"]),
//! ])
//! .unwrap();
//! assert_eq!(ds.shape(), vec![3, 2]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::{ReproError, Result};

/// Element type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Float,
    Int,
    Bool,
    Text,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Float => "float",
            ColumnType::Int => "int",
            ColumnType::Bool => "bool",
            ColumnType::Text => "text",
        }
    }
}

/// Typed, nullable column storage
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
}

/// A named column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn float(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, ColumnData::Float(values.into_iter().map(Some).collect()))
    }

    pub fn int(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(name, ColumnData::Int(values.into_iter().map(Some).collect()))
    }

    pub fn bool(name: impl Into<String>, values: Vec<bool>) -> Self {
        Self::new(name, ColumnData::Bool(values.into_iter().map(Some).collect()))
    }

    pub fn text<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        Self::new(
            name,
            ColumnData::Text(values.into_iter().map(|s| Some(s.into())).collect()),
        )
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ColumnData::Float(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> ColumnType {
        match &self.data {
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Int(_) => ColumnType::Int,
            ColumnData::Bool(_) => ColumnType::Bool,
            ColumnData::Text(_) => ColumnType::Text,
        }
    }

    /// Whether the cell at `row` is missing
    pub fn is_null(&self, row: usize) -> bool {
        match &self.data {
            ColumnData::Float(v) => v[row].map_or(true, f64::is_nan),
            ColumnData::Int(v) => v[row].is_none(),
            ColumnData::Bool(v) => v[row].is_none(),
            ColumnData::Text(v) => v[row].is_none(),
        }
    }

    pub fn null_count(&self) -> usize {
        (0..self.len()).filter(|&row| self.is_null(row)).count()
    }
}

/// Memory layout of a [`Matrix`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    RowMajor,
    ColumnMajor,
}

/// Dense n-dimensional `f64` array
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    shape: Vec<usize>,
    values: Vec<f64>,
    layout: Layout,
}

impl Matrix {
    /// Create a matrix, checking that `shape` accounts for every value
    pub fn new(shape: Vec<usize>, values: Vec<f64>, layout: Layout) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected != values.len() {
            return Err(ReproError::shape(format!(
                "matrix shape {:?} holds {} elements, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self {
            shape,
            values,
            layout,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at position `index` of the logical row-major order
    pub fn value_row_major(&self, index: usize) -> f64 {
        match self.layout {
            Layout::RowMajor => self.values[index],
            Layout::ColumnMajor => {
                // Decompose the row-major index, then recombine with column-major strides.
                let mut rem = index;
                let mut multi = vec![0usize; self.shape.len()];
                for (axis, &dim) in self.shape.iter().enumerate().rev() {
                    multi[axis] = rem % dim;
                    rem /= dim;
                }
                let mut offset = 0;
                let mut stride = 1;
                for (axis, &dim) in self.shape.iter().enumerate() {
                    offset += multi[axis] * stride;
                    stride *= dim;
                }
                self.values[offset]
            }
        }
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }
}

/// Any dataset the fingerprinter understands
#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Table(Vec<Column>),
    Series(Column),
    Matrix(Matrix),
}

impl Dataset {
    /// Build a table, rejecting ragged or duplicate columns
    pub fn table(columns: Vec<Column>) -> Result<Self> {
        let table = Dataset::Table(columns);
        table.validate()?;
        Ok(table)
    }

    pub fn series(column: Column) -> Self {
        Dataset::Series(column)
    }

    pub fn matrix(shape: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        Ok(Dataset::Matrix(Matrix::new(shape, values, Layout::RowMajor)?))
    }

    /// Check the invariants the constructors enforce
    ///
    /// The variants are public, so a hand-built table may hold columns of
    /// different lengths or repeated names. Both are `ShapeMismatch`.
    pub fn validate(&self) -> Result<()> {
        let Dataset::Table(columns) = self else {
            return Ok(());
        };
        if let Some(first) = columns.first() {
            let rows = first.len();
            if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
                return Err(ReproError::shape(format!(
                    "column '{}' has {} rows, expected {}",
                    bad.name,
                    bad.len(),
                    rows
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for column in columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ReproError::shape(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// Short name of the dataset kind, part of the canonical encoding
    pub fn kind(&self) -> &'static str {
        match self {
            Dataset::Table(_) => "table",
            Dataset::Series(_) => "series",
            Dataset::Matrix(_) => "matrix",
        }
    }

    /// `[rows, columns]` for tables, `[len]` for series, the array shape for matrices
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Dataset::Table(columns) => {
                let rows = columns.first().map_or(0, Column::len);
                vec![rows, columns.len()]
            }
            Dataset::Series(column) => vec![column.len()],
            Dataset::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Number of cells the canonical encoding visits
    pub fn cell_count(&self) -> usize {
        self.shape().iter().product()
    }

    /// Interpret a JSON document as a dataset
    ///
    /// Accepted forms:
    /// - array of row objects → table (columns sorted by name, absent keys are null)
    /// - object of column arrays → table
    /// - nested arrays of numbers → matrix
    /// - flat array of scalars → series named `values`
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) if items.is_empty() => {
                Ok(Dataset::Series(Column::new("values", ColumnData::Float(vec![]))))
            }
            Value::Array(items) if items.iter().all(Value::is_object) => rows_to_table(items),
            Value::Array(items) if items.iter().all(Value::is_array) => json_matrix(value),
            Value::Array(items) => {
                let refs: Vec<&Value> = items.iter().collect();
                Ok(Dataset::Series(Column::new("values", infer_column("values", &refs)?)))
            }
            Value::Object(map) => {
                let mut columns = Vec::with_capacity(map.len());
                for (name, cells) in map {
                    let cells = cells.as_array().ok_or_else(|| {
                        ReproError::unsupported(format!("column '{}' is not an array", name))
                    })?;
                    let refs: Vec<&Value> = cells.iter().collect();
                    columns.push(Column::new(name.clone(), infer_column(name, &refs)?));
                }
                Dataset::table(columns)
            }
            other => Err(ReproError::unsupported(format!(
                "cannot fingerprint a bare {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn rows_to_table(rows: &[Value]) -> Result<Dataset> {
    let names: BTreeSet<&String> = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|row| row.keys())
        .collect();

    let mut columns = Vec::with_capacity(names.len());
    for name in names {
        let cells: Vec<&Value> = rows
            .iter()
            .map(|row| row.get(name.as_str()).unwrap_or(&Value::Null))
            .collect();
        columns.push(Column::new(name.clone(), infer_column(name, &cells)?));
    }
    Dataset::table(columns)
}

/// Pick the narrowest column type that holds every non-null cell
fn infer_column(name: &str, cells: &[&Value]) -> Result<ColumnData> {
    let mut kinds = BTreeSet::new();
    for cell in cells {
        match cell {
            Value::Null => {}
            Value::Bool(_) => {
                kinds.insert("bool");
            }
            Value::Number(n) if n.is_i64() => {
                kinds.insert("int");
            }
            Value::Number(_) => {
                kinds.insert("float");
            }
            Value::String(_) => {
                kinds.insert("text");
            }
            nested => {
                return Err(ReproError::unsupported(format!(
                    "column '{}' contains a nested {}",
                    name,
                    json_kind(nested)
                )))
            }
        }
    }

    let numeric_only = kinds.iter().all(|k| *k == "int" || *k == "float");
    let data = if kinds.is_empty() || (numeric_only && kinds.contains("float")) {
        ColumnData::Float(cells.iter().map(|c| c.as_f64()).collect())
    } else if kinds.len() == 1 && kinds.contains("int") {
        ColumnData::Int(cells.iter().map(|c| c.as_i64()).collect())
    } else if kinds.len() == 1 && kinds.contains("bool") {
        ColumnData::Bool(cells.iter().map(|c| c.as_bool()).collect())
    } else if kinds.len() == 1 && kinds.contains("text") {
        ColumnData::Text(cells.iter().map(|c| c.as_str().map(str::to_string)).collect())
    } else {
        return Err(ReproError::unsupported(format!(
            "column '{}' mixes element types {:?}",
            name, kinds
        )));
    };
    Ok(data)
}

fn json_matrix(value: &Value) -> Result<Dataset> {
    let mut shape = Vec::new();
    let mut probe = value;
    while let Value::Array(items) = probe {
        shape.push(items.len());
        match items.first() {
            Some(first) => probe = first,
            None => break,
        }
    }

    let mut values = Vec::with_capacity(shape.iter().product());
    collect_matrix(value, &shape, 0, &mut values)?;
    Ok(Dataset::Matrix(Matrix::new(shape, values, Layout::RowMajor)?))
}

fn collect_matrix(value: &Value, shape: &[usize], depth: usize, out: &mut Vec<f64>) -> Result<()> {
    if depth == shape.len() {
        return match value {
            Value::Number(n) => {
                out.push(n.as_f64().unwrap_or(f64::NAN));
                Ok(())
            }
            Value::Null => {
                out.push(f64::NAN);
                Ok(())
            }
            other => Err(ReproError::unsupported(format!(
                "matrix element is a {}, expected a number",
                json_kind(other)
            ))),
        };
    }

    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                collect_matrix(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        Value::Array(items) => Err(ReproError::shape(format!(
            "ragged matrix: axis {} has length {}, expected {}",
            depth,
            items.len(),
            shape[depth]
        ))),
        _ => Err(ReproError::shape(format!(
            "ragged matrix: expected an array at depth {}",
            depth
        ))),
    }
}
