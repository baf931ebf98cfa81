//! Ledger table definitions
//!
//! The migrations table is keyed by migration id and holds the full
//! definition plus its applied state. The history table is append-only.

use sea_query::{ColumnDef, Index, IndexCreateStatement, PostgresQueryBuilder, Table, TableCreateStatement};
use serde::{Deserialize, Serialize};

/// Names of the two ledger tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerTables {
    /// Definitions and applied state (default `driftguard_migrations`)
    pub migrations_table: String,
    /// Append-only history (default `driftguard_history`)
    pub history_table: String,
}

impl Default for LedgerTables {
    fn default() -> Self {
        Self {
            migrations_table: "driftguard_migrations".to_string(),
            history_table: "driftguard_history".to_string(),
        }
    }
}

/// `CREATE TABLE IF NOT EXISTS` for the migrations table
pub fn create_migrations_table(name: &str) -> TableCreateStatement {
    Table::create()
        .table(name.to_string())
        .if_not_exists()
        .col(ColumnDef::new("id").string().string_len(255).not_null().primary_key())
        .col(ColumnDef::new("version").big_integer().not_null())
        .col(ColumnDef::new("name").string().string_len(255).not_null())
        .col(ColumnDef::new("description").text().not_null().default(""))
        .col(ColumnDef::new("up_script").text().not_null())
        .col(ColumnDef::new("down_script").text().not_null().default(""))
        .col(ColumnDef::new("dependencies").text().not_null().default(""))
        .col(ColumnDef::new("metadata").text().not_null().default("{}"))
        .col(ColumnDef::new("created_at").timestamp_with_time_zone().not_null())
        .col(ColumnDef::new("applied").boolean().not_null().default(false))
        .col(ColumnDef::new("applied_at").timestamp_with_time_zone().null())
        .col(ColumnDef::new("applied_by").string().string_len(255).null())
        .to_owned()
}

/// `CREATE TABLE IF NOT EXISTS` for the history table
pub fn create_history_table(name: &str) -> TableCreateStatement {
    Table::create()
        .table(name.to_string())
        .if_not_exists()
        .col(
            ColumnDef::new("id")
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new("migration_id").string().string_len(255).not_null())
        .col(ColumnDef::new("migration_name").string().string_len(255).not_null())
        .col(ColumnDef::new("operation").string().string_len(16).not_null())
        .col(ColumnDef::new("applied_at").timestamp_with_time_zone().not_null())
        .col(ColumnDef::new("applied_by").string().string_len(255).not_null())
        .col(ColumnDef::new("duration_ms").big_integer().not_null())
        .col(ColumnDef::new("success").boolean().not_null())
        .col(ColumnDef::new("error").text().null())
        .to_owned()
}

/// Index on `migration_id` for per-migration history lookups
pub fn create_history_index(history_table: &str) -> IndexCreateStatement {
    Index::create()
        .if_not_exists()
        .name(format!("idx_{history_table}_migration_id"))
        .table(history_table.to_string())
        .col(sea_query::Expr::col("migration_id"))
        .to_owned()
}

/// All DDL needed before the ledger can be used, in execution order
pub fn schema_statements(tables: &LedgerTables) -> Vec<String> {
    vec![
        create_migrations_table(&tables.migrations_table).build(PostgresQueryBuilder),
        create_history_table(&tables.history_table).build(PostgresQueryBuilder),
        create_history_index(&tables.history_table).build(PostgresQueryBuilder),
    ]
}
