//! Typed reads over a [`Store`]

use std::marker::PhantomData;
use std::sync::Arc;

use crate::executor::Store;
use crate::query::compiler::{CompiledQuery, SelectQuery};
use crate::query::error::QueryError;
use crate::query::expr::{Entity, Predicate};
use crate::raw_sql;
use crate::value::FromRow;

/// Runs compiled [`SelectQuery`]s for entity `E` and decodes the rows
pub struct Repository<E> {
    store: Arc<dyn Store>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity + FromRow> Repository<E> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    /// All rows matching `query`
    ///
    /// # Errors
    ///
    /// Returns `QueryError` if compilation, execution or decoding fails.
    pub fn find(&self, query: &SelectQuery<E>) -> Result<Vec<E>, QueryError> {
        let compiled = query.compile()?;
        let sql = compiled.select_sql(E::TABLE, E::COLUMNS);
        self.fetch(&compiled, &sql)
    }

    /// First row matching `query`, if any
    ///
    /// # Errors
    ///
    /// Returns `QueryError` if compilation, execution or decoding fails.
    pub fn find_first(&self, query: &SelectQuery<E>) -> Result<Option<E>, QueryError> {
        let rows = self.find(&query.clone().limit(1))?;
        Ok(rows.into_iter().next())
    }

    /// Number of rows matching `filter`, or all rows when `None`
    ///
    /// # Errors
    ///
    /// Returns `QueryError` if compilation or execution fails.
    pub fn count(&self, filter: Option<Predicate<E>>) -> Result<i64, QueryError> {
        let query = match filter {
            Some(predicate) => SelectQuery::<E>::new().filter(predicate),
            None => SelectQuery::<E>::new(),
        };
        let compiled = query.compile()?;
        let (sql, params) = compiled.to_positional(&compiled.count_sql(E::TABLE))?;
        log::debug!("count on {}: {sql}", E::TABLE);
        Ok(raw_sql::query_value::<i64>(self.store.as_ref(), &sql, &params)?)
    }

    fn fetch(&self, compiled: &CompiledQuery, sql: &str) -> Result<Vec<E>, QueryError> {
        let (sql, params) = compiled.to_positional(sql)?;
        log::debug!("find on {}: {sql}", E::TABLE);
        Ok(raw_sql::query_as::<E>(self.store.as_ref(), &sql, &params)?)
    }
}
