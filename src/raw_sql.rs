//! Raw SQL helpers over any [`Store`].
//!
//! These are free functions rather than trait methods so [`Store`] stays
//! object safe while callers still get typed results.

use crate::executor::{Store, StoreError};
use crate::value::{FromRow, FromValue, Row, Value};

/// Execute a statement without parameters
///
/// # Errors
///
/// Returns `StoreError` if the statement fails.
pub fn execute_unprepared(store: &dyn Store, sql: &str) -> Result<u64, StoreError> {
    store.execute(sql, &[])
}

/// Run a query and decode every row into `T`
///
/// # Errors
///
/// Returns `StoreError` if the query fails or any row fails to decode.
pub fn query_as<T: FromRow>(
    store: &dyn Store,
    sql: &str,
    params: &[Value],
) -> Result<Vec<T>, StoreError> {
    store
        .query(sql, params)?
        .iter()
        .map(|row| T::from_row(row).map_err(StoreError::from))
        .collect()
}

/// Run a query that must return exactly one row
///
/// # Errors
///
/// Returns `StoreError` if the query fails or returns zero or several rows.
pub fn query_one(store: &dyn Store, sql: &str, params: &[Value]) -> Result<Row, StoreError> {
    let mut rows = store.query(sql, params)?;
    match rows.len() {
        1 => Ok(rows.remove(0)),
        0 => Err(StoreError::statement(sql, "expected one row, got none")),
        n => Err(StoreError::statement(sql, format!("expected one row, got {n}"))),
    }
}

/// Run a query and extract the first column of its single row
///
/// # Errors
///
/// Returns `StoreError` if the query fails, does not return exactly one row,
/// or the value has the wrong type.
pub fn query_value<T: FromValue>(
    store: &dyn Store,
    sql: &str,
    params: &[Value],
) -> Result<T, StoreError> {
    let row = query_one(store, sql, params)?;
    let value = row
        .get(0)
        .ok_or_else(|| StoreError::Decode("query returned a row with no columns".to_string()))?;
    T::from_value(value).map_err(|found| {
        StoreError::Decode(format!(
            "failed to extract value: expected {}, found {found}",
            T::EXPECTED
        ))
    })
}
