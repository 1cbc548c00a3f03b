//! Warehouse access
//!
//! PostgreSQL connectivity through the tunnel, the period control table
//! lookup, and raw execution of generated SQL.

pub mod connection;
pub mod period;
pub mod warehouse;

pub use connection::PgWarehouseConnector;
pub use period::{resolve_current_table, select_current, table_name_for, TABLE_PREFIX};
pub use warehouse::{ColumnInfo, PeriodRecord, RawRows, Warehouse, WarehouseConnector};
