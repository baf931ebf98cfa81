//! Transaction coordinator
//!
//! Enforces single-active-transaction discipline over a [`Store`]:
//!
//! ```text
//! Idle --begin--> Open --commit/rollback--> Idle
//! ```
//!
//! Compensating actions registered while a transaction is open run only if
//! it rolls back, newest first. The action list is cleared after every commit
//! or rollback.
//!
//! [`TransactionCoordinator::execute_in_transaction`] is re-entrant: when a
//! transaction is already open it runs the operation inside it and leaves
//! commit/rollback to whoever opened it.

use crate::executor::{IsolationLevel, Store, StoreError, TransactionHandle};
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Compensating side effect run when the enclosing transaction rolls back
pub type RollbackAction = Box<dyn FnOnce() + Send>;

/// Transaction error type
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// `begin` while a transaction is open
    #[error("A transaction is already active")]
    TransactionAlreadyActive,
    /// `commit`, `rollback` or `add_rollback_action` while idle
    #[error("No active transaction")]
    NoActiveTransaction,
    /// The backend failed to begin, commit or roll back
    #[error("Transaction storage error: {0}")]
    Storage(#[from] StoreError),
    /// Coordinator state lock was poisoned by a panicking thread
    #[error("Transaction state unavailable: {0}")]
    StatePoisoned(String),
}

#[derive(Default)]
struct CoordinatorState {
    handle: Option<Box<dyn TransactionHandle>>,
    isolation: IsolationLevel,
    actions: Vec<RollbackAction>,
}

/// Demarcates atomic units of work against one store
///
/// At most one transaction is open per coordinator. Methods take `&self`, so
/// an operation running inside [`execute_in_transaction`](Self::execute_in_transaction)
/// can still reach the coordinator (to nest or register compensations).
pub struct TransactionCoordinator {
    store: Arc<dyn Store>,
    state: Mutex<CoordinatorState>,
}

impl TransactionCoordinator {
    /// Create an idle coordinator over a store
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// The store transactions are opened on
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, CoordinatorState>, TransactionError> {
        self.state
            .lock()
            .map_err(|e| TransactionError::StatePoisoned(e.to_string()))
    }

    /// Whether a transaction is currently open
    pub fn is_active(&self) -> bool {
        self.lock().map(|s| s.handle.is_some()).unwrap_or(false)
    }

    /// Isolation level of the open transaction, if any
    pub fn active_isolation(&self) -> Option<IsolationLevel> {
        self.lock()
            .ok()
            .and_then(|s| s.handle.as_ref().map(|_| s.isolation))
    }

    /// Open a transaction with the default isolation level (ReadCommitted)
    ///
    /// # Errors
    ///
    /// Returns `TransactionAlreadyActive` if a transaction is open, or
    /// `Storage` if the backend cannot begin one.
    pub fn begin(&self) -> Result<(), TransactionError> {
        self.begin_with_isolation(IsolationLevel::default())
    }

    /// Open a transaction with a specific isolation level
    ///
    /// # Errors
    ///
    /// Returns `TransactionAlreadyActive` if a transaction is open, or
    /// `Storage` if the backend cannot begin one.
    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("begin").entered();

        let mut state = self.lock()?;
        if state.handle.is_some() {
            return Err(TransactionError::TransactionAlreadyActive);
        }
        let handle = self.store.begin(isolation)?;
        state.handle = Some(handle);
        state.isolation = isolation;
        state.actions.clear();
        log::debug!("Transaction opened ({})", isolation.to_sql());
        Ok(())
    }

    /// Commit the open transaction
    ///
    /// Registered compensations are discarded. If the backend rejects the
    /// commit nothing was made durable, so compensations run before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` if idle, or `Storage` if the commit fails.
    pub fn commit(&self) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("commit").entered();

        let (handle, actions) = self.take_open()?;
        match handle.commit() {
            Ok(()) => {
                log::debug!("Transaction committed");
                Ok(())
            }
            Err(e) => {
                log::error!("Commit failed: {e}");
                run_compensations(actions);
                Err(e.into())
            }
        }
    }

    /// Roll back the open transaction, then run compensations newest first
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` if idle, or `Storage` if the backend
    /// rollback fails (compensations still run).
    pub fn rollback(&self) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("rollback").entered();

        let (handle, actions) = self.take_open()?;
        let result = handle.rollback();
        run_compensations(actions);
        match result {
            Ok(()) => {
                log::debug!("Transaction rolled back");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a compensating action for the open transaction
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` if idle.
    pub fn add_rollback_action<F>(&self, action: F) -> Result<(), TransactionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock()?;
        if state.handle.is_none() {
            return Err(TransactionError::NoActiveTransaction);
        }
        state.actions.push(Box::new(action));
        Ok(())
    }

    /// Run `op` atomically with the default isolation level
    ///
    /// See [`execute_in_transaction_with`](Self::execute_in_transaction_with).
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or a transaction error converted into `E`.
    pub fn execute_in_transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Store) -> Result<T, E>,
        E: From<TransactionError> + std::fmt::Display,
    {
        self.execute_in_transaction_with(IsolationLevel::default(), op)
    }

    /// Run `op` atomically
    ///
    /// If a transaction is already open, `op` simply runs inside it and the
    /// outer owner decides whether to commit. Otherwise a transaction is opened,
    /// committed when `op` succeeds, and rolled back (running compensations)
    /// when it fails. A failing rollback is logged and the original error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or a transaction error converted into `E`.
    pub fn execute_in_transaction_with<T, E, F>(
        &self,
        isolation: IsolationLevel,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&dyn Store) -> Result<T, E>,
        E: From<TransactionError> + std::fmt::Display,
    {
        if self.is_active() {
            return op(self.store.as_ref());
        }

        self.begin_with_isolation(isolation)?;
        match op(self.store.as_ref()) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    log::error!("Rollback after failed operation also failed: {rollback_err} (original error: {err})");
                }
                Err(err)
            }
        }
    }

    fn take_open(
        &self,
    ) -> Result<(Box<dyn TransactionHandle>, Vec<RollbackAction>), TransactionError> {
        let mut state = self.lock()?;
        let handle = state
            .handle
            .take()
            .ok_or(TransactionError::NoActiveTransaction)?;
        let actions = std::mem::take(&mut state.actions);
        Ok((handle, actions))
    }
}

fn run_compensations(actions: Vec<RollbackAction>) {
    if !actions.is_empty() {
        log::debug!("Running {} compensating action(s)", actions.len());
    }
    for action in actions.into_iter().rev() {
        action();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> (Arc<MemoryStore>, TransactionCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TransactionCoordinator::new(store.clone());
        (store, coordinator)
    }

    #[test]
    fn test_second_begin_is_rejected_until_commit() {
        let (_, tx) = coordinator();
        tx.begin().unwrap();
        assert!(matches!(tx.begin(), Err(TransactionError::TransactionAlreadyActive)));
        tx.commit().unwrap();
        tx.begin().unwrap();
        tx.rollback().unwrap();
        assert!(!tx.is_active());
    }

    #[test]
    fn test_commit_and_rollback_require_open_transaction() {
        let (_, tx) = coordinator();
        assert!(matches!(tx.commit(), Err(TransactionError::NoActiveTransaction)));
        assert!(matches!(tx.rollback(), Err(TransactionError::NoActiveTransaction)));
        assert!(matches!(
            tx.add_rollback_action(|| {}),
            Err(TransactionError::NoActiveTransaction)
        ));
    }

    #[test]
    fn test_compensations_run_lifo_on_rollback_only() {
        let (_, tx) = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));

        tx.begin().unwrap();
        for n in 1..=3 {
            let order = order.clone();
            tx.add_rollback_action(move || order.lock().unwrap().push(n)).unwrap();
        }
        tx.rollback().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);

        tx.begin().unwrap();
        let o = order.clone();
        tx.add_rollback_action(move || o.lock().unwrap().push(99)).unwrap();
        tx.commit().unwrap();
        // Cleared by the commit: a later rollback must not run it
        tx.begin().unwrap();
        tx.rollback().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_execute_in_transaction_commits_on_success() {
        let (store, tx) = coordinator();
        let value: Result<i32, TransactionError> = tx.execute_in_transaction(|s| {
            s.execute("CREATE TABLE t (id INT)", &[])?;
            Ok(7)
        });
        assert_eq!(value.unwrap(), 7);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.executed_statements(), vec!["CREATE TABLE t (id INT)".to_string()]);
    }

    #[test]
    fn test_execute_in_transaction_rolls_back_and_surfaces_error() {
        let (store, tx) = coordinator();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let result: Result<(), TransactionError> = tx.execute_in_transaction(|s| {
            s.execute("CREATE TABLE t (id INT)", &[])?;
            tx.add_rollback_action(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })?;
            Err(StoreError::statement("INSERT", "constraint violated").into())
        });
        assert!(matches!(result, Err(TransactionError::Storage(_))));
        assert_eq!(store.rollback_count(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(store.executed_statements().is_empty());
        assert!(!tx.is_active());
    }

    #[test]
    fn test_nested_execute_does_not_commit() {
        let (store, tx) = coordinator();
        let result: Result<(), TransactionError> = tx.execute_in_transaction(|_| {
            let inner: Result<u64, TransactionError> =
                tx.execute_in_transaction(|s| Ok(s.execute("SELECT 1", &[])?));
            inner?;
            assert_eq!(store.commit_count(), 0);
            assert!(tx.is_active());
            Ok(())
        });
        result.unwrap();
        assert_eq!(store.begin_count(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_nested_failure_is_not_swallowed() {
        let (store, tx) = coordinator();
        let result: Result<(), TransactionError> = tx.execute_in_transaction(|_| {
            let inner: Result<(), TransactionError> =
                tx.execute_in_transaction(|_| Err(TransactionError::StatePoisoned("inner".into())));
            assert_eq!(store.rollback_count(), 0);
            inner
        });
        assert!(result.is_err());
        assert_eq!(store.rollback_count(), 1);
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_isolation_is_tracked() {
        let (_, tx) = coordinator();
        assert_eq!(tx.active_isolation(), None);
        tx.begin_with_isolation(IsolationLevel::Serializable).unwrap();
        assert_eq!(tx.active_isolation(), Some(IsolationLevel::Serializable));
        tx.commit().unwrap();
    }
}
