//! In-memory storage backend
//!
//! `MemoryStore` implements [`Store`], [`MigrationLedger`] and
//! [`BackupProvider`] over shared in-process state. Transactions are
//! snapshots: `begin` copies the committed state, `commit` replaces it and
//! `rollback` discards the copy. It backs the test suite and dry runs.
//!
//! Statements are not interpreted. They are appended to a statement log,
//! which is what tests inspect. Failures can be injected by substring match
//! with [`MemoryStore::fail_on`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::executor::{
    compact_sql, Backend, BackupProvider, HealthStatus, IsolationLevel, Store, StoreError,
    TransactionHandle,
};
use crate::migration::ledger::MigrationLedger;
use crate::migration::{MigrationDefinition, MigrationHistoryEntry};
use crate::value::{Row, Value};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    statements: Vec<String>,
    definitions: BTreeMap<String, MigrationDefinition>,
    history: Vec<MigrationHistoryEntry>,
    next_history_id: i64,
}

#[derive(Debug)]
struct MemoryState {
    committed: Snapshot,
    pending: Option<Snapshot>,
    failures: Vec<String>,
    query_results: Vec<(String, Vec<Row>)>,
    healthy: bool,
    fail_backups: bool,
    backups: Vec<(String, Snapshot)>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            committed: Snapshot::default(),
            pending: None,
            failures: Vec::new(),
            query_results: Vec::new(),
            healthy: true,
            fail_backups: false,
            backups: Vec::new(),
            begins: 0,
            commits: 0,
            rollbacks: 0,
        }
    }
}

impl MemoryState {
    /// Snapshot that writes land in: the open transaction, or committed state
    fn current(&mut self) -> &mut Snapshot {
        match self.pending {
            Some(ref mut pending) => pending,
            None => &mut self.committed,
        }
    }

    fn check(&self, sql: &str) -> Result<(), StoreError> {
        if !self.healthy {
            return Err(StoreError::Connection("memory store is marked unavailable".to_string()));
        }
        if let Some(pattern) = self.failures.iter().find(|p| sql.contains(p.as_str())) {
            return Err(StoreError::statement(sql, format!("injected failure matching '{pattern}'")));
        }
        Ok(())
    }
}

/// Shared in-process store; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // State stays consistent between statements, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every statement or query containing `pattern` fail
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state().failures.push(pattern.into());
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Toggle availability; an unavailable store fails every call
    pub fn set_healthy(&self, healthy: bool) {
        self.state().healthy = healthy;
    }

    /// Make `create_backup` fail
    pub fn set_fail_backups(&self, fail: bool) {
        self.state().fail_backups = fail;
    }

    /// Return `rows` for queries whose SQL starts with `prefix`
    ///
    /// The most recently pushed matching prefix wins.
    pub fn push_query_result(&self, prefix: impl Into<String>, rows: Vec<Row>) {
        self.state().query_results.push((prefix.into(), rows));
    }

    /// Committed statements, in execution order
    pub fn executed_statements(&self) -> Vec<String> {
        self.state().committed.statements.clone()
    }

    /// Locations of backups taken so far
    pub fn backups(&self) -> Vec<String> {
        self.state().backups.iter().map(|(loc, _)| loc.clone()).collect()
    }

    /// Replace committed state with a backup
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unsupported` if no backup exists at `location`.
    pub fn restore_backup(&self, location: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let snapshot = state
            .backups
            .iter()
            .find(|(loc, _)| loc == location)
            .map(|(_, snap)| snap.clone())
            .ok_or_else(|| StoreError::Unsupported(format!("no backup at {location}")))?;
        state.committed = snapshot;
        Ok(())
    }

    pub fn begin_count(&self) -> usize {
        self.state().begins
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.state().rollbacks
    }

    /// Whether a transaction is open on this store
    pub fn in_transaction(&self) -> bool {
        self.state().pending.is_some()
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransaction {
    fn finish(self: Box<Self>, commit: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = state
            .pending
            .take()
            .ok_or_else(|| StoreError::TransactionState("no open transaction".to_string()))?;
        if commit {
            state.committed = pending;
            state.commits += 1;
        } else {
            state.rollbacks += 1;
        }
        Ok(())
    }
}

impl TransactionHandle for MemoryTransaction {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let healthy = self.state.lock().unwrap_or_else(PoisonError::into_inner).healthy;
        if !healthy {
            // The open snapshot is lost with the connection
            self.finish(false)?;
            return Err(StoreError::Connection("memory store is marked unavailable".to_string()));
        }
        self.finish(true)
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish(false)
    }
}

impl Store for MemoryStore {
    fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.check(sql)?;
        state.current().statements.push(compact_sql(sql));
        Ok(0)
    }

    fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let state = self.state();
        state.check(sql)?;
        let trimmed = sql.trim();
        if trimmed.eq_ignore_ascii_case("SELECT 1") {
            return Ok(vec![Row::new([("?column?", Value::Int(1))])]);
        }
        Ok(state
            .query_results
            .iter()
            .rev()
            .find(|(prefix, _)| trimmed.starts_with(prefix.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TransactionHandle>, StoreError> {
        let mut state = self.state();
        if !state.healthy {
            return Err(StoreError::Connection("memory store is marked unavailable".to_string()));
        }
        if state.pending.is_some() {
            return Err(StoreError::TransactionState(
                "a transaction is already open on this store".to_string(),
            ));
        }
        log::trace!("memory store: BEGIN ({})", isolation.to_sql());
        state.pending = Some(state.committed.clone());
        state.begins += 1;
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
        }))
    }

    fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let healthy = self.state().healthy;
        let elapsed = started.elapsed().max(Duration::from_micros(1));
        if healthy {
            HealthStatus::healthy(elapsed)
        } else {
            HealthStatus::unhealthy(elapsed, "memory store is marked unavailable")
        }
    }

    fn backend(&self) -> Backend {
        Backend::Memory
    }
}

impl MigrationLedger for MemoryStore {
    fn ensure_schema(&self, _store: &dyn Store) -> Result<(), StoreError> {
        self.state().check("ensure_schema")
    }

    fn load_definitions(&self, _store: &dyn Store) -> Result<Vec<MigrationDefinition>, StoreError> {
        let mut state = self.state();
        state.check("load_definitions")?;
        let mut defs: Vec<MigrationDefinition> = state.current().definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));
        Ok(defs)
    }

    fn save_definition(&self, _store: &dyn Store, definition: &MigrationDefinition) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check("save_definition")?;
        let definitions = &mut state.current().definitions;
        match definitions.get_mut(&definition.id) {
            Some(existing) => {
                existing.name.clone_from(&definition.name);
                existing.description.clone_from(&definition.description);
                existing.up_script.clone_from(&definition.up_script);
                existing.down_script.clone_from(&definition.down_script);
                existing.dependencies.clone_from(&definition.dependencies);
                existing.metadata.clone_from(&definition.metadata);
            }
            None => {
                definitions.insert(definition.id.clone(), definition.clone());
            }
        }
        Ok(())
    }

    fn mark_applied(
        &self,
        _store: &dyn Store,
        id: &str,
        at: DateTime<Utc>,
        by: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check(&format!("mark_applied {id}"))?;
        let def = state
            .current()
            .definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::statement("mark_applied", format!("no ledger row for migration '{id}'")))?;
        def.mark_applied(at, by);
        Ok(())
    }

    fn mark_reverted(&self, _store: &dyn Store, id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check(&format!("mark_reverted {id}"))?;
        let def = state
            .current()
            .definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::statement("mark_reverted", format!("no ledger row for migration '{id}'")))?;
        def.mark_reverted();
        Ok(())
    }

    fn append_history(&self, _store: &dyn Store, entry: &MigrationHistoryEntry) -> Result<i64, StoreError> {
        let mut state = self.state();
        state.check("append_history")?;
        let snapshot = state.current();
        snapshot.next_history_id += 1;
        let id = snapshot.next_history_id;
        let mut stored = entry.clone();
        stored.id = Some(id);
        snapshot.history.push(stored);
        Ok(id)
    }

    fn history(&self, _store: &dyn Store) -> Result<Vec<MigrationHistoryEntry>, StoreError> {
        let mut state = self.state();
        state.check("history")?;
        Ok(state.current().history.clone())
    }
}

impl BackupProvider for MemoryStore {
    fn create_backup(&self, label: &str) -> Result<String, StoreError> {
        let mut state = self.state();
        if state.fail_backups {
            return Err(StoreError::Unsupported("backups are disabled on this store".to_string()));
        }
        let location = format!("memory://backup/{}-{label}", state.backups.len() + 1);
        let snapshot = state.committed.clone();
        state.backups.push((location.clone(), snapshot));
        log::info!("Backup written to {location}");
        Ok(location)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::migration::HistoryOperation;

    #[test]
    fn test_rollback_discards_transaction_writes() {
        let store = MemoryStore::new();
        store.execute("CREATE TABLE kept (id INT)", &[]).unwrap();

        let tx = store.begin(IsolationLevel::default()).unwrap();
        store.execute("CREATE TABLE dropped (id INT)", &[]).unwrap();
        tx.rollback().unwrap();

        assert_eq!(store.executed_statements(), vec!["CREATE TABLE kept (id INT)".to_string()]);
        assert_eq!(store.rollback_count(), 1);
    }

    #[test]
    fn test_commit_publishes_transaction_writes() {
        let store = MemoryStore::new();
        let tx = store.begin(IsolationLevel::Serializable).unwrap();
        store.execute("CREATE TABLE t (id INT)", &[]).unwrap();
        assert!(store.executed_statements().is_empty());
        tx.commit().unwrap();
        assert_eq!(store.executed_statements().len(), 1);
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_second_begin_is_rejected() {
        let store = MemoryStore::new();
        let _tx = store.begin(IsolationLevel::default()).unwrap();
        assert!(matches!(
            store.begin(IsolationLevel::default()),
            Err(StoreError::TransactionState(_))
        ));
    }

    #[test]
    fn test_injected_failure_names_statement() {
        let store = MemoryStore::new();
        store.fail_on("users");
        let err = store.execute("CREATE TABLE users (id INT)", &[]).unwrap_err();
        assert!(err.to_string().contains("CREATE TABLE users"));
        store.clear_failures();
        assert!(store.execute("CREATE TABLE users (id INT)", &[]).is_ok());
    }

    #[test]
    fn test_unhealthy_store_fails_calls_and_probe() {
        let store = MemoryStore::new();
        store.set_healthy(false);
        assert!(!store.health_check().healthy);
        assert!(matches!(store.query("SELECT 1", &[]), Err(StoreError::Connection(_))));
        store.set_healthy(true);
        assert_eq!(store.query("SELECT 1", &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_ledger_writes_follow_transactions() {
        let store = MemoryStore::new();
        let def = MigrationDefinition::new(1, "a").with_up("CREATE TABLE a (id INT)");
        store.save_definition(&store, &def).unwrap();

        let tx = store.begin(IsolationLevel::default()).unwrap();
        store.mark_applied(&store, &def.id, Utc::now(), "ci").unwrap();
        let entry = MigrationHistoryEntry::succeeded(&def.id, "a", HistoryOperation::Apply, "ci", 1);
        assert_eq!(store.append_history(&store, &entry).unwrap(), 1);
        tx.rollback().unwrap();

        let defs = store.load_definitions(&store).unwrap();
        assert!(!defs[0].applied);
        assert!(store.history(&store).unwrap().is_empty());
    }

    #[test]
    fn test_backup_and_restore() {
        let store = MemoryStore::new();
        store.execute("CREATE TABLE a (id INT)", &[]).unwrap();
        let location = store.create_backup("pre-deploy").unwrap();
        assert_eq!(location, "memory://backup/1-pre-deploy");

        store.execute("DROP TABLE a", &[]).unwrap();
        store.restore_backup(&location).unwrap();
        assert_eq!(store.executed_statements(), vec!["CREATE TABLE a (id INT)".to_string()]);

        store.set_fail_backups(true);
        assert!(store.create_backup("again").is_err());
    }
}
