//! Persistence surface for migration definitions and history
//!
//! The registry keeps its in-memory map as a cache; the ledger is the source
//! of truth. Every method takes the store it should run on, so ledger writes
//! issued inside a coordinator transaction commit or roll back with the
//! migration script itself.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::executor::{Store, StoreError};
use crate::raw_sql;
use crate::value::{FromRow, Row, Value, DecodeError};

use super::definition::{MigrationDefinition, Version};
use super::record::{HistoryOperation, MigrationHistoryEntry};
use super::state_table::{schema_statements, LedgerTables};

/// Durable record of definitions, applied state and history
pub trait MigrationLedger: Send + Sync {
    /// Create ledger tables if missing
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the DDL fails.
    fn ensure_schema(&self, store: &dyn Store) -> Result<(), StoreError>;

    /// All persisted definitions, ordered by version
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read or decoding fails.
    fn load_definitions(&self, store: &dyn Store) -> Result<Vec<MigrationDefinition>, StoreError>;

    /// Insert a definition, or update its descriptive fields if it exists
    ///
    /// Applied state of an existing row is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails.
    fn save_definition(&self, store: &dyn Store, definition: &MigrationDefinition) -> Result<(), StoreError>;

    /// Record that a migration is applied
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails or the id is unknown.
    fn mark_applied(
        &self,
        store: &dyn Store,
        id: &str,
        at: DateTime<Utc>,
        by: &str,
    ) -> Result<(), StoreError>;

    /// Record that a migration is no longer applied
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails or the id is unknown.
    fn mark_reverted(&self, store: &dyn Store, id: &str) -> Result<(), StoreError>;

    /// Append a history entry and return its assigned id
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails.
    fn append_history(&self, store: &dyn Store, entry: &MigrationHistoryEntry) -> Result<i64, StoreError>;

    /// Full history, oldest first
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read or decoding fails.
    fn history(&self, store: &dyn Store) -> Result<Vec<MigrationHistoryEntry>, StoreError>;
}

/// Ledger stored in two PostgreSQL tables
#[derive(Debug, Clone, Default)]
pub struct SqlLedger {
    tables: LedgerTables,
}

const DEFINITION_COLUMNS: &str = "id, version, name, description, up_script, down_script, \
     dependencies, metadata, created_at, applied, applied_at, applied_by";

const HISTORY_COLUMNS: &str =
    "id, migration_id, migration_name, operation, applied_at, applied_by, duration_ms, success, error";

impl SqlLedger {
    pub fn new(tables: LedgerTables) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &LedgerTables {
        &self.tables
    }
}

impl MigrationLedger for SqlLedger {
    fn ensure_schema(&self, store: &dyn Store) -> Result<(), StoreError> {
        for sql in schema_statements(&self.tables) {
            raw_sql::execute_unprepared(store, &sql)?;
        }
        Ok(())
    }

    fn load_definitions(&self, store: &dyn Store) -> Result<Vec<MigrationDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM {} ORDER BY version, id",
            self.tables.migrations_table
        );
        let rows: Vec<StoredDefinition> = raw_sql::query_as(store, &sql, &[])?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    fn save_definition(&self, store: &dyn Store, definition: &MigrationDefinition) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&definition.metadata)
            .map_err(|e| StoreError::Decode(format!("failed to serialize metadata: {e}")))?;

        let mut params = vec![
            Value::from(definition.id.as_str()),
            Value::from(definition.version.0),
            Value::from(definition.name.as_str()),
            Value::from(definition.description.as_str()),
            Value::from(definition.up_script.as_str()),
            Value::from(definition.down_script.as_str()),
            Value::from(join_dependencies(&definition.dependencies)),
            Value::from(metadata),
            Value::from(definition.created_at),
            Value::from(definition.applied),
        ];
        // NULLs are written as literals so no untyped parameter is ever bound
        let mut applied_cols = String::from("NULL, NULL");
        if let (Some(at), Some(by)) = (definition.applied_at, definition.applied_by.as_deref()) {
            params.push(Value::from(at));
            params.push(Value::from(by));
            applied_cols = "$11, $12".to_string();
        }

        let sql = format!(
            "INSERT INTO {} ({DEFINITION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, {applied_cols}) \
             ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, description = EXCLUDED.description, \
             up_script = EXCLUDED.up_script, down_script = EXCLUDED.down_script, \
             dependencies = EXCLUDED.dependencies, metadata = EXCLUDED.metadata",
            self.tables.migrations_table
        );
        store.execute(&sql, &params)?;
        Ok(())
    }

    fn mark_applied(
        &self,
        store: &dyn Store,
        id: &str,
        at: DateTime<Utc>,
        by: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET applied = TRUE, applied_at = $2, applied_by = $3 WHERE id = $1",
            self.tables.migrations_table
        );
        let affected = store.execute(&sql, &[Value::from(id), Value::from(at), Value::from(by)])?;
        expect_one_row(&sql, id, affected)
    }

    fn mark_reverted(&self, store: &dyn Store, id: &str) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET applied = FALSE, applied_at = NULL, applied_by = NULL WHERE id = $1",
            self.tables.migrations_table
        );
        let affected = store.execute(&sql, &[Value::from(id)])?;
        expect_one_row(&sql, id, affected)
    }

    fn append_history(&self, store: &dyn Store, entry: &MigrationHistoryEntry) -> Result<i64, StoreError> {
        let mut params = vec![
            Value::from(entry.migration_id.as_str()),
            Value::from(entry.migration_name.as_str()),
            Value::from(entry.operation.as_str()),
            Value::from(entry.applied_at),
            Value::from(entry.applied_by.as_str()),
            Value::from(entry.duration_ms),
            Value::from(entry.success),
        ];
        let error_col = match &entry.error {
            Some(error) => {
                params.push(Value::from(error.as_str()));
                "$8"
            }
            None => "NULL",
        };
        let sql = format!(
            "INSERT INTO {} (migration_id, migration_name, operation, applied_at, applied_by, \
             duration_ms, success, error) VALUES ($1, $2, $3, $4, $5, $6, $7, {error_col}) RETURNING id",
            self.tables.history_table
        );
        raw_sql::query_value(store, &sql, &params)
    }

    fn history(&self, store: &dyn Store) -> Result<Vec<MigrationHistoryEntry>, StoreError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM {} ORDER BY id",
            self.tables.history_table
        );
        raw_sql::query_as(store, &sql, &[])
    }
}

fn expect_one_row(sql: &str, id: &str, affected: u64) -> Result<(), StoreError> {
    if affected == 0 {
        return Err(StoreError::statement(sql, format!("no ledger row for migration '{id}'")));
    }
    Ok(())
}

pub(crate) fn join_dependencies(dependencies: &BTreeSet<String>) -> String {
    dependencies.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

pub(crate) fn split_dependencies(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct StoredDefinition(MigrationDefinition);

impl FromRow for StoredDefinition {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        let raw_metadata: String = row.try_get("metadata")?;
        let metadata: BTreeMap<String, String> = if raw_metadata.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&raw_metadata)
                .map_err(|e| DecodeError::Invalid(format!("metadata is not a JSON object: {e}")))?
        };
        let dependencies: String = row.try_get("dependencies")?;

        Ok(StoredDefinition(MigrationDefinition {
            id: row.try_get("id")?,
            version: Version(row.try_get("version")?),
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            up_script: row.try_get("up_script")?,
            down_script: row.try_get("down_script")?,
            dependencies: split_dependencies(&dependencies),
            applied: row.try_get("applied")?,
            applied_at: row.try_get("applied_at")?,
            applied_by: row.try_get("applied_by")?,
            metadata,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl FromRow for MigrationHistoryEntry {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        let operation: String = row.try_get("operation")?;
        Ok(MigrationHistoryEntry {
            id: row.try_get("id")?,
            migration_id: row.try_get("migration_id")?,
            migration_name: row.try_get("migration_name")?,
            operation: operation.parse::<HistoryOperation>().map_err(DecodeError::Invalid)?,
            applied_at: row.try_get("applied_at")?,
            applied_by: row.try_get("applied_by")?,
            duration_ms: row.try_get("duration_ms")?,
            success: row.try_get("success")?,
            error: row.try_get("error")?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn test_dependencies_round_trip_through_delimited_string() {
        let deps: BTreeSet<String> = ["1_a".to_string(), "2_b".to_string()].into();
        assert_eq!(join_dependencies(&deps), "1_a,2_b");
        assert_eq!(split_dependencies("1_a, 2_b,,"), deps);
        assert!(split_dependencies("").is_empty());
    }

    #[test]
    fn test_ensure_schema_runs_ddl() {
        let store = MemoryStore::new();
        SqlLedger::default().ensure_schema(&store).unwrap();
        let statements = store.executed_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn test_save_pending_definition_writes_null_applied_columns() {
        let store = MemoryStore::new();
        let def = MigrationDefinition::new(1, "a").with_up("CREATE TABLE a (id INT)").depends_on("0_base");
        SqlLedger::default().save_definition(&store, &def).unwrap();
        let sql = &store.executed_statements()[0];
        assert!(sql.starts_with("INSERT INTO driftguard_migrations"));
        assert!(sql.contains("NULL, NULL"));
        assert!(sql.contains("ON CONFLICT (id)"));
    }

    #[test]
    fn test_load_definitions_decodes_rows() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap();
        store.push_query_result(
            "SELECT id, version",
            vec![Row::new([
                ("id", Value::from("1_a")),
                ("version", Value::Int(1)),
                ("name", Value::from("a")),
                ("description", Value::from("")),
                ("up_script", Value::from("CREATE TABLE a (id INT)")),
                ("down_script", Value::from("DROP TABLE a")),
                ("dependencies", Value::from("0_base,0_seed")),
                ("metadata", Value::from(r#"{"checksum":"abc"}"#)),
                ("created_at", Value::Timestamp(at)),
                ("applied", Value::Bool(true)),
                ("applied_at", Value::Timestamp(at)),
                ("applied_by", Value::from("ci")),
            ])],
        );
        let defs = SqlLedger::default().load_definitions(&store).unwrap();
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert_eq!(def.version, Version(1));
        assert!(def.applied);
        assert_eq!(def.applied_by.as_deref(), Some("ci"));
        assert_eq!(def.dependencies.len(), 2);
        assert_eq!(def.stored_checksum(), Some("abc"));
    }

    #[test]
    fn test_history_decodes_rows() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap();
        store.push_query_result(
            "SELECT id, migration_id",
            vec![Row::new([
                ("id", Value::Int(4)),
                ("migration_id", Value::from("1_a")),
                ("migration_name", Value::from("a")),
                ("operation", Value::from("rollback")),
                ("applied_at", Value::Timestamp(at)),
                ("applied_by", Value::from("ci")),
                ("duration_ms", Value::Int(12)),
                ("success", Value::Bool(false)),
                ("error", Value::from("boom")),
            ])],
        );
        let history = SqlLedger::default().history(&store).unwrap();
        assert_eq!(history[0].id, Some(4));
        assert_eq!(history[0].operation, HistoryOperation::Rollback);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_append_history_returns_assigned_id() {
        let store = MemoryStore::new();
        store.push_query_result("INSERT INTO driftguard_history", vec![Row::new([("id", Value::Int(9))])]);
        let entry = MigrationHistoryEntry::succeeded("1_a", "a", HistoryOperation::Apply, "ci", 3);
        assert_eq!(SqlLedger::default().append_history(&store, &entry).unwrap(), 9);
    }
}
