//! Decoded result sets.

use crate::error::{DbError, DbResult};
use crate::models::value::{FromValue, Value};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// One result row; column names are shared with the rest of the result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.position(name).and_then(|idx| self.values.get(idx))
    }

    /// Decode column `idx` into `T`.
    pub fn try_get<T: FromValue>(&self, idx: usize) -> DbResult<T> {
        let column = self
            .columns
            .get(idx)
            .cloned()
            .unwrap_or_else(|| idx.to_string());
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| DbError::decode(&column, "column index out of range"))?;
        T::from_value(value).map_err(|message| DbError::decode(column, message))
    }

    /// Decode the column called `name` into `T`.
    pub fn try_get_named<T: FromValue>(&self, name: &str) -> DbResult<T> {
        let idx = self
            .position(name)
            .ok_or_else(|| DbError::decode(name, "no such column"))?;
        self.try_get(idx)
    }

    /// Column name to JSON value map.
    pub fn to_json_map(&self) -> Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// A fully buffered result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl Default for Rows {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl Rows {
    pub fn new(columns: Vec<String>, values: Vec<Vec<Value>>) -> Self {
        let columns: Arc<[String]> = Arc::from(columns);
        let rows = values
            .into_iter()
            .map(|v| Row::new(Arc::clone(&columns), v))
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
}

impl ExecResult {
    pub fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }
}
