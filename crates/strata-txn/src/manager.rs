use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_store::StoreResult;
use tracing::{debug, warn};

use crate::error::{TxnError, TxnResult};

/// Identifier of a transaction, unique within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Something that takes part in a transaction's outcome.
pub trait TransactionResource: Send + Sync {
    /// Make the transaction's changes permanent. An error aborts the
    /// commit; the resource must have discarded its pending state either way.
    fn commit(&self, txn: TxnId) -> StoreResult<()>;

    /// Discard the transaction's changes.
    fn rollback(&self, txn: TxnId);
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Manager id -> transaction bound to this thread.
    static BOUND: RefCell<HashMap<u64, TxnId>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct TxnRecord {
    resources: Vec<Arc<dyn TransactionResource>>,
    rollback_only: bool,
}

struct ManagerInner {
    id: u64,
    next_txn: AtomicU64,
    active: Mutex<HashMap<TxnId, TxnRecord>>,
}

/// Hands out transactions and binds them to the calling thread.
///
/// Cloning is cheap; clones share the same transactions.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.inner.id)
            .field("active", &self.inner.active.lock().len())
            .finish()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
                next_txn: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a transaction on the calling thread.
    pub fn begin(&self) -> TxnResult<Transaction> {
        if self.current().is_some() {
            return Err(TxnError::AlreadyActive);
        }
        let id = self.allocate_id();
        self.inner.active.lock().insert(id, TxnRecord::default());
        BOUND.with(|bound| bound.borrow_mut().insert(self.inner.id, id));
        debug!(txn = %id, "transaction started");
        Ok(Transaction {
            manager: self.clone(),
            id,
            finished: false,
            _thread_bound: PhantomData,
        })
    }

    /// The transaction bound to the calling thread, if any.
    pub fn current(&self) -> Option<TxnId> {
        BOUND.with(|bound| bound.borrow().get(&self.inner.id).copied())
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.inner.active.lock().contains_key(&txn)
    }

    /// Register `resource` with `txn`. Enlisting the same resource twice is
    /// a no-op. Returns `false` if `txn` is not active.
    pub fn enlist(&self, txn: TxnId, resource: Arc<dyn TransactionResource>) -> bool {
        let mut active = self.inner.active.lock();
        let Some(record) = active.get_mut(&txn) else {
            return false;
        };
        let ptr = Arc::as_ptr(&resource) as *const ();
        if !record
            .resources
            .iter()
            .any(|r| Arc::as_ptr(r) as *const () == ptr)
        {
            record.resources.push(resource);
        }
        true
    }

    /// Doom the current transaction: its commit will roll back instead.
    pub fn set_rollback_only(&self) -> TxnResult<()> {
        let txn = self.current().ok_or(TxnError::NotActive)?;
        let mut active = self.inner.active.lock();
        let record = active.get_mut(&txn).ok_or(TxnError::NotActive)?;
        record.rollback_only = true;
        Ok(())
    }

    /// A fresh id for work outside any bound transaction.
    pub(crate) fn allocate_id(&self) -> TxnId {
        TxnId(self.inner.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    fn finish(&self, txn: TxnId, commit: bool) -> TxnResult<()> {
        BOUND.with(|bound| {
            let mut bound = bound.borrow_mut();
            if bound.get(&self.inner.id) == Some(&txn) {
                bound.remove(&self.inner.id);
            }
        });
        let record = self
            .inner
            .active
            .lock()
            .remove(&txn)
            .ok_or(TxnError::NotActive)?;

        if !commit || record.rollback_only {
            for resource in &record.resources {
                resource.rollback(txn);
            }
            debug!(txn = %txn, resources = record.resources.len(), "transaction rolled back");
            return if commit {
                Err(TxnError::RolledBack(txn))
            } else {
                Ok(())
            };
        }

        for (i, resource) in record.resources.iter().enumerate() {
            if let Err(source) = resource.commit(txn) {
                warn!(txn = %txn, error = %source, "commit failed, rolling back remaining resources");
                for rest in &record.resources[i + 1..] {
                    rest.rollback(txn);
                }
                return Err(TxnError::CommitFailed { txn, source });
            }
        }
        debug!(txn = %txn, resources = record.resources.len(), "transaction committed");
        Ok(())
    }
}

/// A transaction bound to the thread that began it.
///
/// Dropping the guard without calling [`commit`](Self::commit) rolls the
/// transaction back.
#[must_use = "dropping a transaction rolls it back"]
pub struct Transaction {
    manager: TransactionManager,
    id: TxnId,
    finished: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn set_rollback_only(&self) {
        if let Some(record) = self.manager.inner.active.lock().get_mut(&self.id) {
            record.rollback_only = true;
        }
    }

    pub fn commit(mut self) -> TxnResult<()> {
        self.finished = true;
        self.manager.finish(self.id, true)
    }

    pub fn rollback(mut self) -> TxnResult<()> {
        self.finished = true;
        self.manager.finish(self.id, false)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.manager.finish(self.id, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::StoreError;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        fail_commit: bool,
    }

    impl TransactionResource for Recorder {
        fn commit(&self, txn: TxnId) -> StoreResult<()> {
            self.log.lock().push(format!("commit {txn}"));
            if self.fail_commit {
                return Err(StoreError::ConcurrentUpdate { key: "k".into() });
            }
            Ok(())
        }

        fn rollback(&self, txn: TxnId) {
            self.log.lock().push(format!("rollback {txn}"));
        }
    }

    #[test]
    fn one_transaction_per_thread() {
        let manager = TransactionManager::new();
        let txn = manager.begin().unwrap();
        assert_eq!(manager.current(), Some(txn.id()));
        assert!(matches!(manager.begin(), Err(TxnError::AlreadyActive)));

        // Another manager is independent.
        let other = TransactionManager::new();
        assert_eq!(other.current(), None);

        txn.commit().unwrap();
        assert_eq!(manager.current(), None);
        manager.begin().unwrap().rollback().unwrap();
    }

    #[test]
    fn transactions_do_not_leak_across_threads() {
        let manager = TransactionManager::new();
        let _txn = manager.begin().unwrap();
        let clone = manager.clone();
        std::thread::spawn(move || assert_eq!(clone.current(), None))
            .join()
            .unwrap();
    }

    #[test]
    fn commit_and_drop_drive_resources() {
        let manager = TransactionManager::new();
        let resource = Arc::new(Recorder::default());

        let txn = manager.begin().unwrap();
        let id = txn.id();
        assert!(manager.enlist(id, resource.clone()));
        assert!(manager.enlist(id, resource.clone()));
        txn.commit().unwrap();

        {
            let txn = manager.begin().unwrap();
            manager.enlist(txn.id(), resource.clone());
        }
        let log = resource.log.lock().clone();
        assert_eq!(log, vec![format!("commit {id}"), format!("rollback {}", TxnId(id.0 + 1))]);
        assert!(!manager.enlist(id, resource));
    }

    #[test]
    fn rollback_only_commit_fails() {
        let manager = TransactionManager::new();
        let resource = Arc::new(Recorder::default());
        let txn = manager.begin().unwrap();
        let id = txn.id();
        manager.enlist(id, resource.clone());
        manager.set_rollback_only().unwrap();
        assert!(matches!(txn.commit(), Err(TxnError::RolledBack(t)) if t == id));
        assert_eq!(resource.log.lock().as_slice(), [format!("rollback {id}")]);
        assert!(matches!(manager.set_rollback_only(), Err(TxnError::NotActive)));
    }

    #[test]
    fn failed_commit_rolls_back_the_rest() {
        let manager = TransactionManager::new();
        let failing = Arc::new(Recorder {
            fail_commit: true,
            ..Default::default()
        });
        let other = Arc::new(Recorder::default());
        let txn = manager.begin().unwrap();
        let id = txn.id();
        manager.enlist(id, failing.clone());
        manager.enlist(id, other.clone());

        let err = txn.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(other.log.lock().as_slice(), [format!("rollback {id}")]);
        assert!(!manager.is_active(id));
    }
}
