//! Database driver seam. A connection lives for exactly one step.

use super::ConnectionTarget;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Rows captured from a row-returning statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Row `index` as a column-name mapping.
    pub fn record(&self, index: usize) -> Option<Value> {
        let row = self.rows.get(index)?;
        let mut map = Map::new();
        for (column, value) in self.columns.iter().zip(row) {
            map.insert(column.clone(), value.clone());
        }
        Some(Value::Object(map))
    }

    pub fn records(&self) -> Vec<Value> {
        (0..self.rows.len())
            .filter_map(|index| self.record(index))
            .collect()
    }

    /// Cell lookup by column name, falling back to column position.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let row = self.rows.get(row)?;
        let position = self
            .columns
            .iter()
            .position(|name| name == column)
            .or_else(|| crate::extract::parse_index(column))?;
        row.get(position)
    }
}

pub trait DatabaseDriver: Send + Sync {
    fn connect(
        &self,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, DriverError>;
}

pub trait Connection {
    fn query(&mut self, sql: &str) -> Result<RowSet, DriverError>;

    /// Executes for effect, returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    fn close(&mut self) {}
}

/// Closes the wrapped connection when dropped.
pub struct ConnectionGuard {
    inner: Box<dyn Connection>,
}

impl ConnectionGuard {
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner }
    }

    pub fn query(&mut self, sql: &str) -> Result<RowSet, DriverError> {
        self.inner.query(sql)
    }

    pub fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.inner.execute(sql)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.close();
    }
}
