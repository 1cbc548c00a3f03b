//! Warehouse capability used by the pipeline

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One row of the period control table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRecord {
    pub periodcode: Option<String>,
    pub is_current: bool,
}

impl PeriodRecord {
    pub fn new(periodcode: &str, is_current: bool) -> Self {
        Self {
            periodcode: Some(periodcode.to_string()),
            is_current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// Rows exactly as returned by the database, before shaping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRows {
    pub col_keys: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// A live database handle scoped to one request
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// All rows of the period control table
    async fn fetch_periods(&self) -> Result<Vec<PeriodRecord>>;

    /// Columns of `table` in ordinal order; errors if the table does not exist
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Run a statement and return its rows
    async fn execute(&self, sql: &str) -> Result<RawRows>;

    async fn close(&self);
}

/// Connects a warehouse through an already-open local forward
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    async fn connect(&self, local_addr: SocketAddr) -> Result<Box<dyn Warehouse>>;
}
