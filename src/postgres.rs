//! PostgreSQL backend over `may_postgres`
//!
//! [`Value`] parameters are bound by their own type (`Int` binds as
//! `BIGINT`, `Text` as `TEXT`, `Timestamp` as `TIMESTAMPTZ`), so parameterized
//! statements must use matching column types or explicit casts.

use chrono::{DateTime, NaiveDateTime, Utc};
use may_postgres::types::{ToSql, Type};
use may_postgres::Client;
use std::time::Instant;

use crate::connection::{self, ConnectionError};
use crate::executor::{
    compact_sql, Backend, HealthStatus, IsolationLevel, Store, StoreError, TransactionHandle,
};
use crate::value::{Row, Value};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// [`Store`] backed by a single `may_postgres` client
///
/// The client is one connection, so at most one transaction is open at a
/// time; the [`crate::transaction::TransactionCoordinator`] enforces that.
#[derive(Clone)]
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Validate `connection_string` and connect
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the string is malformed or the server
    /// cannot be reached.
    pub fn connect(connection_string: &str) -> Result<Self, ConnectionError> {
        log::info!("Connecting to {}", connection::redact(connection_string));
        connection::connect(connection_string).map(Self::new)
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn run_execute(client: &Client, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        let boxed = bind_params(params);
        let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
        client.execute(sql, &refs).map_err(|e| statement_error(sql, &e))
    }
}

fn statement_error(sql: &str, err: &may_postgres::Error) -> StoreError {
    log::error!("Statement failed: {err} (sql: {})", compact_sql(sql));
    StoreError::statement(sql, err.to_string())
}

fn bind_params(params: &[Value]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|value| -> Box<dyn ToSql> {
            match value {
                Value::Null => Box::new(Option::<String>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Int(i) => Box::new(*i),
                Value::Float(f) => Box::new(*f),
                Value::Text(s) => Box::new(s.clone()),
                Value::Timestamp(ts) => Box::new(*ts),
            }
        })
        .collect()
}

fn decode_row(row: &may_postgres::Row) -> Result<Row, StoreError> {
    let mut cells = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_cell(row, idx, column.type_())
            .map_err(|e| StoreError::Decode(format!("column '{}': {e}", column.name())))?;
        cells.push((column.name().to_string(), value));
    }
    Ok(Row::new(cells))
}

fn decode_cell(row: &may_postgres::Row, idx: usize, ty: &Type) -> Result<Value, String> {
    fn get<'a, T>(row: &'a may_postgres::Row, idx: usize) -> Result<Option<T>, String>
    where
        T: may_postgres::types::FromSql<'a>,
    {
        row.try_get::<usize, Option<T>>(idx).map_err(|e| e.to_string())
    }

    let value = if *ty == Type::BOOL {
        get::<bool>(row, idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        get::<i16>(row, idx)?.map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT4 {
        get::<i32>(row, idx)?.map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT8 {
        get::<i64>(row, idx)?.map(Value::Int)
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, idx)?.map(|v| Value::Float(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, idx)?.map(Value::Float)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        get::<String>(row, idx)?.map(Value::Text)
    } else if *ty == Type::TIMESTAMPTZ {
        get::<DateTime<Utc>>(row, idx)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        get::<NaiveDateTime>(row, idx)?.map(|v| Value::Timestamp(v.and_utc()))
    } else {
        return Err(format!("unsupported column type {ty}"));
    };
    Ok(value.unwrap_or(Value::Null))
}

struct PostgresTransaction {
    client: Client,
}

impl TransactionHandle for PostgresTransaction {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        PostgresStore::run_execute(&self.client, "COMMIT", &[]).map(|_| ())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        PostgresStore::run_execute(&self.client, "ROLLBACK", &[]).map(|_| ())
    }
}

impl Store for PostgresStore {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::statement_span(sql).entered();

        let start = Instant::now();
        let result = Self::run_execute(&self.client, sql, params);
        log::trace!("execute took {:?}: {}", start.elapsed(), compact_sql(sql));
        result
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::statement_span(sql).entered();

        let start = Instant::now();
        let boxed = bind_params(params);
        let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
        let rows = self
            .client
            .query(sql, &refs)
            .map_err(|e| statement_error(sql, &e))?;
        log::trace!("query took {:?}: {}", start.elapsed(), compact_sql(sql));
        rows.iter().map(decode_row).collect()
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TransactionHandle>, StoreError> {
        Self::run_execute(&self.client, "BEGIN", &[])?;
        if isolation != IsolationLevel::ReadCommitted {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.to_sql());
            if let Err(e) = Self::run_execute(&self.client, &sql, &[]) {
                // Do not leave the session inside a half-configured transaction
                if let Err(rollback_err) = Self::run_execute(&self.client, "ROLLBACK", &[]) {
                    log::warn!("Rollback after failed SET TRANSACTION also failed: {rollback_err}");
                }
                return Err(e);
            }
        }
        Ok(Box::new(PostgresTransaction {
            client: self.client.clone(),
        }))
    }

    fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        match self.client.query("SELECT 1", &[]) {
            Ok(_) => HealthStatus::healthy(start.elapsed()),
            Err(e) => {
                log::warn!("Health check failed: {e}");
                HealthStatus::unhealthy(start.elapsed(), e.to_string())
            }
        }
    }

    fn backend(&self) -> Backend {
        Backend::Postgres
    }
}
