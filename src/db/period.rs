//! Current period resolution
//!
//! Weekly data lives in one table per reporting period. The control table
//! flags which period is current; exactly one row must carry the flag.

use crate::db::warehouse::{PeriodRecord, Warehouse};
use crate::error::{QueryError, Result};
use tracing::{info, warn};

pub const TABLE_PREFIX: &str = "expanded_hts_weekly_";

/// Pick the single row flagged current.
pub fn select_current(records: &[PeriodRecord]) -> Result<&PeriodRecord> {
    let mut flagged = records.iter().filter(|r| r.is_current);
    match (flagged.next(), flagged.next()) {
        (Some(record), None) => Ok(record),
        (None, _) => Err(QueryError::AmbiguousPeriod { matches: 0 }),
        (Some(_), Some(_)) => Err(QueryError::AmbiguousPeriod {
            matches: records.iter().filter(|r| r.is_current).count(),
        }),
    }
}

/// Weekly table name for a period code, e.g. `2024W32` -> `expanded_hts_weekly_2024w32`
pub fn table_name_for(periodcode: &str) -> Result<String> {
    let code = periodcode.trim();
    if code.is_empty() {
        return Err(QueryError::InvalidPeriodCode(periodcode.to_string()));
    }
    Ok(format!("{}{}", TABLE_PREFIX, code.to_lowercase()))
}

/// Read the control table and derive the current weekly table name.
pub async fn resolve_current_table(warehouse: &dyn Warehouse) -> Result<String> {
    let records = warehouse.fetch_periods().await?;
    let current = select_current(&records).map_err(|e| {
        warn!(periods = records.len(), "Could not resolve current period: {}", e);
        e
    })?;

    let code = current.periodcode.as_deref().unwrap_or_default();
    let table = table_name_for(code)?;
    info!(periodcode = %code, table = %table, "Resolved current period");
    Ok(table)
}
