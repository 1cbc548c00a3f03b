//! PostgreSQL warehouse connection using sqlx

use crate::config::DatabaseConfig;
use crate::db::warehouse::{ColumnInfo, PeriodRecord, RawRows, Warehouse, WarehouseConnector};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::net::SocketAddr;
use tracing::debug;

/// Opens one single-connection pool per request against the tunnel's local port
pub struct PgWarehouseConnector {
    config: DatabaseConfig,
}

impl PgWarehouseConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WarehouseConnector for PgWarehouseConnector {
    async fn connect(&self, local_addr: SocketAddr) -> Result<Box<dyn Warehouse>> {
        let cfg = &self.config;
        let mut options = PgConnectOptions::new()
            .host(&local_addr.ip().to_string())
            .port(local_addr.port())
            .username(&cfg.user)
            .database(&cfg.database)
            .options([
                ("search_path", cfg.search_path.as_str()),
                ("default_transaction_read_only", "on"),
            ]);
        if let Some(password) = &cfg.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(cfg.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| QueryError::Database(format!("Failed to connect to {}: {}", cfg.database, e)))?;

        // Test the connection
        sqlx::query("SELECT 1").execute(&pool).await?;

        debug!(database = %cfg.database, local = %local_addr, "Warehouse connected");
        Ok(Box::new(PgWarehouse {
            pool,
            period_table: cfg.period_table.clone(),
        }))
    }
}

pub struct PgWarehouse {
    pool: PgPool,
    period_table: String,
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn fetch_periods(&self) -> Result<Vec<PeriodRecord>> {
        let sql = format!("SELECT periodcode::text, is_current FROM {}", self.period_table);
        let rows: Vec<(Option<String>, Option<bool>)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryError::Database(format!("Failed to read {}: {}", self.period_table, e)))?;

        Ok(rows
            .into_iter()
            .map(|(periodcode, is_current)| PeriodRecord {
                periodcode,
                is_current: is_current.unwrap_or(false),
            })
            .collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_name = $1
              AND table_schema = ANY (current_schemas(false))
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(QueryError::Database(format!(
                "Table {} does not exist on the search path",
                table
            )));
        }

        Ok(rows
            .into_iter()
            .map(|(name, data_type)| ColumnInfo { name, data_type })
            .collect())
    }

    async fn execute(&self, sql: &str) -> Result<RawRows> {
        // Simple query protocol: every value comes back in text format
        let rows = sqlx::raw_sql(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryError::Database(format!("Query execution failed: {}", e)))?;

        let col_keys = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = rows.iter().map(row_to_values).collect::<Result<Vec<_>>>()?;
        Ok(RawRows { col_keys, rows })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_values(row: &PgRow) -> Result<Vec<Value>> {
    row.columns()
        .iter()
        .map(|column| {
            let text: Option<String> = row
                .try_get_unchecked(column.ordinal())
                .map_err(|e| QueryError::Database(format!("Failed to read column {}: {}", column.name(), e)))?;
            Ok(match text {
                Some(text) => coerce_text(column.type_info().name(), &text),
                None => Value::Null,
            })
        })
        .collect()
}

/// Convert a text-format Postgres value into JSON by its type name
pub(crate) fn coerce_text(type_name: &str, text: &str) -> Value {
    match type_name {
        "INT2" | "INT4" | "INT8" | "OID" => text
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => match text.parse::<f64>() {
            Ok(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Err(_) => Value::String(text.to_string()),
        },
        "BOOL" => Value::Bool(text == "t" || text.eq_ignore_ascii_case("true")),
        "JSON" | "JSONB" => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}
