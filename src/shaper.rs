//! Result shaping
//!
//! Turns raw rows and column keys into a table that is safe to serialize.
//! Shaping never fails a request: every problem degrades to an empty table
//! and is logged under its own code. Repeated column keys are not a problem;
//! later repeats get a numeric suffix so no value is lost.

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

/// Ordered columns plus rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as `{column: value}` records in column order
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let records = self.to_records();
        let mut seq = serializer.serialize_seq(Some(records.len()))?;
        for record in &records {
            seq.serialize_element(record)?;
        }
        seq.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("no rows returned")]
    EmptyInput,

    #[error("{expected} column keys but the first row has {found} fields")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("{0}")]
    Unexpected(String),
}

impl ShapeError {
    pub fn code(&self) -> &'static str {
        match self {
            ShapeError::EmptyInput => "shape.empty_input",
            ShapeError::ShapeMismatch { .. } => "shape.mismatch",
            ShapeError::Unexpected(_) => "shape.unexpected",
        }
    }
}

/// Build a table, or say exactly why it cannot be built.
pub fn try_shape(rows: &[Vec<Value>], col_keys: &[String]) -> Result<Table, ShapeError> {
    let first = rows.first().ok_or(ShapeError::EmptyInput)?;
    if first.len() != col_keys.len() {
        return Err(ShapeError::ShapeMismatch {
            expected: col_keys.len(),
            found: first.len(),
        });
    }

    if let Some((idx, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != col_keys.len()) {
        return Err(ShapeError::Unexpected(format!(
            "row {} has {} fields, expected {}",
            idx,
            row.len(),
            col_keys.len()
        )));
    }

    Ok(Table {
        columns: unique_keys(col_keys),
        rows: rows.to_vec(),
    })
}

/// `sum, sum` becomes `sum, sum_1`; a suffix already taken moves to the next.
fn unique_keys(col_keys: &[String]) -> Vec<String> {
    let taken: HashSet<&str> = col_keys.iter().map(String::as_str).collect();
    if taken.len() == col_keys.len() {
        return col_keys.to_vec();
    }

    let mut used = HashSet::new();
    let mut columns = Vec::with_capacity(col_keys.len());
    for key in col_keys {
        let mut column = key.clone();
        let mut n = 1;
        while (column != *key && taken.contains(column.as_str())) || !used.insert(column.clone()) {
            column = format!("{}_{}", key, n);
            n += 1;
        }
        columns.push(column);
    }

    warn!(code = "shape.duplicate_key", columns = ?columns, "Renamed repeated column keys");
    columns
}

/// Build a table, degrading to an empty one on any shaping problem.
pub fn shape(rows: &[Vec<Value>], col_keys: &[String]) -> Table {
    match try_shape(rows, col_keys) {
        Ok(table) => table,
        Err(e) => {
            warn!(code = e.code(), rows = rows.len(), columns = col_keys.len(), "Returning empty table: {}", e);
            Table::empty()
        }
    }
}
