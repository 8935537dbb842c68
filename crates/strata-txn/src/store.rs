use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_crypto::{KeyStrategy, VERSION_SEPARATOR};
use strata_store::{
    BlobStore, LocalBlobStore, PathStrategy, StoreError, StoreKind, StoreResult, Tracer,
};
use strata_types::{BlobContext, BlobStatus, BlobUpdate};
use tracing::{debug, info, warn};

use crate::manager::{TransactionManager, TransactionResource, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingOp {
    Write,
    Delete,
    /// Only metadata updates are pending.
    Unmodified,
}

#[derive(Debug)]
struct Pending {
    /// Generation of the key when this transaction first touched it.
    base_generation: u64,
    op: PendingOp,
    updates: Vec<BlobUpdate>,
}

/// Staged changes of one transaction. The staging directory goes away with
/// the state, whatever path ends the transaction.
struct TxnState {
    transient: LocalBlobStore,
    dir: PathBuf,
    pending: BTreeMap<String, Pending>,
}

impl Drop for TxnState {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "could not remove transient area"),
        }
    }
}

impl TxnState {
    fn touch(&mut self, key: &str, generation: u64) -> &mut Pending {
        self.pending.entry(key.to_string()).or_insert(Pending {
            base_generation: generation,
            op: PendingOp::Unmodified,
            updates: Vec::new(),
        })
    }

    fn op(&self, key: &str) -> PendingOp {
        self.pending.get(key).map_or(PendingOp::Unmodified, |p| p.op)
    }
}

/// Per-key commit bookkeeping, for conflict detection.
#[derive(Default)]
struct KeyTable {
    /// Number of committed changes per key.
    generations: HashMap<String, u64>,
    /// Keys a commit is currently promoting into the permanent store.
    promoting: HashSet<String>,
}

/// How to take back one promotion step of a failed commit.
#[derive(Debug)]
enum Undo {
    /// The key did not exist before; remove what the commit put there.
    Remove(String),
    /// The previous content was saved aside under the same key.
    Restore(String),
    /// The previous content was archived to `version`.
    Unarchive { key: String, version: String },
}

impl Undo {
    fn key(&self) -> &str {
        match self {
            Self::Remove(key) | Self::Restore(key) | Self::Unarchive { key, .. } => key,
        }
    }
}

struct TxnStoreInner {
    name: String,
    permanent: Arc<dyn BlobStore>,
    transient_root: PathBuf,
    manager: TransactionManager,
    record_mode: bool,
    tracer: Tracer,
    txns: Mutex<HashMap<TxnId, Arc<Mutex<TxnState>>>>,
    keys: Mutex<KeyTable>,
}

/// Gives a non-transactional store transaction semantics.
///
/// Inside a transaction, writes and deletes are staged in a per-transaction
/// area under the transient root and only reach the permanent store on
/// commit. The transaction reads its own staged changes; everyone else sees
/// only committed state. A commit that touched a key another transaction
/// committed in the meantime, or is promoting right now, fails with
/// [`StoreError::ConcurrentUpdate`]. A commit that fails while promoting
/// puts back what it already changed in the permanent store.
///
/// Outside a transaction every operation commits on its own.
///
/// In record mode nothing is overwritten or deleted for good: the previous
/// content of a key is moved to `{key}@{n}` first.
#[derive(Clone)]
pub struct TransactionalBlobStore {
    inner: Arc<TxnStoreInner>,
}

impl TransactionalBlobStore {
    /// Wrap `permanent`. Leftover staging areas under `transient_root` from
    /// a previous run are removed.
    pub fn open(
        name: impl Into<String>,
        permanent: Arc<dyn BlobStore>,
        transient_root: impl Into<PathBuf>,
        manager: TransactionManager,
    ) -> StoreResult<Self> {
        let name = name.into();
        let transient_root = transient_root.into();
        match fs::remove_dir_all(&transient_root) {
            Ok(()) => info!(store = %name, dir = %transient_root.display(), "removed stale transient area"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&transient_root)?;
        Ok(Self {
            inner: Arc::new(TxnStoreInner {
                name,
                permanent,
                transient_root,
                manager,
                record_mode: false,
                tracer: Tracer::disabled(),
                txns: Mutex::new(HashMap::new()),
                keys: Mutex::new(KeyTable::default()),
            }),
        })
    }

    /// Preserve previous generations instead of overwriting or deleting.
    pub fn with_record_mode(self, record_mode: bool) -> Self {
        self.map_inner(|inner| inner.record_mode = record_mode)
    }

    pub fn with_tracer(self, tracer: Tracer) -> Self {
        self.map_inner(|inner| inner.tracer = tracer)
    }

    fn map_inner(self, f: impl FnOnce(&mut TxnStoreInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            // Already shared; builder methods only apply before that.
            Err(inner) => Self { inner },
        }
    }

    pub fn permanent(&self) -> &Arc<dyn BlobStore> {
        &self.inner.permanent
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.inner.manager
    }

    pub fn is_record_mode(&self) -> bool {
        self.inner.record_mode
    }

    /// Number of transactions with staged changes in this store.
    pub fn pending_transactions(&self) -> usize {
        self.inner.txns.lock().len()
    }

    /// State of the current transaction, created and enlisted on first use.
    fn current_state(&self) -> StoreResult<Option<Arc<Mutex<TxnState>>>> {
        let Some(txn) = self.inner.manager.current() else {
            return Ok(None);
        };
        if let Some(state) = self.inner.txns.lock().get(&txn) {
            return Ok(Some(state.clone()));
        }
        let state = Arc::new(Mutex::new(self.inner.new_state(txn)?));
        self.inner.txns.lock().insert(txn, state.clone());
        let resource: Arc<dyn TransactionResource> = self.inner.clone();
        if !self.inner.manager.enlist(txn, resource) {
            self.inner.txns.lock().remove(&txn);
            return Err(StoreError::Config(format!("{txn} is no longer active")));
        }
        debug!(store = %self.inner.name, txn = %txn, "store enlisted in transaction");
        Ok(Some(state))
    }

    /// Run `f` against the current transaction, or against a one-off
    /// transaction that commits immediately.
    fn staged<T>(&self, f: impl FnOnce(&mut TxnState) -> StoreResult<T>) -> StoreResult<T> {
        if let Some(state) = self.current_state()? {
            return f(&mut state.lock());
        }
        let mut state = self.inner.new_state(self.inner.manager.allocate_id())?;
        let value = f(&mut state)?;
        self.inner.commit_state(&state)?;
        Ok(value)
    }

    fn generation(&self, key: &str) -> u64 {
        self.inner.keys.lock().generations.get(key).copied().unwrap_or(0)
    }
}

impl TxnStoreInner {
    fn new_state(&self, txn: TxnId) -> StoreResult<TxnState> {
        let dir = self.transient_root.join(txn.to_string());
        let transient = LocalBlobStore::open(
            format!("{}-{txn}", self.name),
            &dir,
            PathStrategy::Flat,
            self.permanent.key_strategy().clone(),
        )?;
        Ok(TxnState {
            transient,
            dir,
            pending: BTreeMap::new(),
        })
    }

    /// Move the current content of `key` aside to the first free
    /// `{key}@{n}`.
    fn archive(&self, key: &str) -> StoreResult<Option<String>> {
        if !self.permanent.exists(key)? {
            return Ok(None);
        }
        let mut n: u64 = 1;
        loop {
            let version = format!("{key}{VERSION_SEPARATOR}{n}");
            if !self.permanent.exists(&version)? {
                self.permanent
                    .copy_blob(&version, self.permanent.as_ref(), key, true)?;
                self.tracer
                    .record(&self.name, "archive", format_args!("{key} -> {version}"));
                return Ok(Some(version));
            }
            n += 1;
        }
    }

    fn commit_state(&self, state: &TxnState) -> StoreResult<()> {
        let dedup = self.permanent.key_strategy().use_dedup();
        // Identical digest writes cannot lose anything, so they race freely.
        let guarded = |op: PendingOp| match op {
            PendingOp::Unmodified => false,
            PendingOp::Write => !dedup,
            PendingOp::Delete => true,
        };
        let reserved: Vec<String> = {
            let mut keys = self.keys.lock();
            for (key, pending) in &state.pending {
                if !guarded(pending.op) {
                    continue;
                }
                let current = keys.generations.get(key).copied().unwrap_or(0);
                if keys.promoting.contains(key) || current != pending.base_generation {
                    warn!(store = %self.name, key, "commit lost a concurrent update");
                    self.tracer.record(&self.name, "conflict", key);
                    return Err(StoreError::ConcurrentUpdate { key: key.clone() });
                }
            }
            let reserved: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| guarded(p.op))
                .map(|(k, _)| k.clone())
                .collect();
            keys.promoting.extend(reserved.iter().cloned());
            reserved
        };
        let _reserved = scopeguard::guard(reserved, |reserved| {
            let mut keys = self.keys.lock();
            for key in &reserved {
                keys.promoting.remove(key);
            }
        });

        self.promote(state)?;

        let mut keys = self.keys.lock();
        for (key, pending) in &state.pending {
            if pending.op != PendingOp::Unmodified {
                *keys.generations.entry(key.clone()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Apply staged changes to the permanent store, undoing the content
    /// steps already taken if one fails.
    fn promote(&self, state: &TxnState) -> StoreResult<()> {
        let dir = state.dir.with_extension("undo");
        let saved = LocalBlobStore::open(
            format!("{}.undo", self.name),
            &dir,
            PathStrategy::Flat,
            self.permanent.key_strategy().clone(),
        )?;
        let _saved_dir = scopeguard::guard(dir, |dir| {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "could not remove undo area");
                }
            }
        });
        let mut undo = Vec::new();
        let result = self.promote_steps(state, &saved, &mut undo);
        if let Err(e) = &result {
            warn!(store = %self.name, steps = undo.len(), error = %e, "promotion failed, reverting");
            self.revert(&saved, undo);
        }
        result
    }

    fn promote_steps(
        &self,
        state: &TxnState,
        saved: &LocalBlobStore,
        undo: &mut Vec<Undo>,
    ) -> StoreResult<()> {
        let dedup = self.permanent.key_strategy().use_dedup();
        for (key, pending) in &state.pending {
            match pending.op {
                PendingOp::Write => {
                    if self.record_mode {
                        if let Some(version) = self.archive(key)? {
                            undo.push(Undo::Unarchive {
                                key: key.clone(),
                                version,
                            });
                        }
                        undo.push(Undo::Remove(key.clone()));
                    } else if !dedup {
                        undo.push(self.save_previous(saved, key, false)?);
                    }
                    if !self
                        .permanent
                        .copy_blob(key, &state.transient, key, true)?
                    {
                        return Err(StoreError::NotFound(key.clone()));
                    }
                    self.tracer.record(&self.name, "commit-write", key);
                }
                PendingOp::Delete => {
                    if self.record_mode {
                        if let Some(version) = self.archive(key)? {
                            undo.push(Undo::Unarchive {
                                key: key.clone(),
                                version,
                            });
                        }
                    } else {
                        undo.push(self.save_previous(saved, key, true)?);
                    }
                    self.tracer.record(&self.name, "commit-delete", key);
                }
                PendingOp::Unmodified => {}
            }
        }
        // Status changes cannot be taken back, so they go last.
        for (key, pending) in &state.pending {
            if pending.op == PendingOp::Delete {
                continue;
            }
            for update in &pending.updates {
                self.permanent.update_blob(key, update)?;
            }
        }
        Ok(())
    }

    /// Copy (or with `take`, move) the committed content of `key` into the
    /// undo area.
    fn save_previous(&self, saved: &LocalBlobStore, key: &str, take: bool) -> StoreResult<Undo> {
        if saved.copy_blob(key, self.permanent.as_ref(), key, take)? {
            Ok(Undo::Restore(key.to_string()))
        } else {
            Ok(Undo::Remove(key.to_string()))
        }
    }

    fn revert(&self, saved: &LocalBlobStore, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::Remove(key) => self.permanent.delete_blob(key),
                Undo::Restore(key) => self.permanent.copy_blob(key, saved, key, true).map(drop),
                Undo::Unarchive { key, version } => self
                    .permanent
                    .copy_blob(key, self.permanent.as_ref(), version, true)
                    .map(drop),
            };
            match result {
                Ok(()) => self.tracer.record(&self.name, "revert", step.key()),
                Err(e) => {
                    warn!(store = %self.name, key = step.key(), error = %e, "could not revert promotion step")
                }
            }
        }
    }
}

impl TransactionResource for TxnStoreInner {
    fn commit(&self, txn: TxnId) -> StoreResult<()> {
        let Some(state) = self.txns.lock().remove(&txn) else {
            return Ok(());
        };
        let state = state.lock();
        let result = self.commit_state(&state);
        if result.is_ok() {
            debug!(store = %self.name, txn = %txn, keys = state.pending.len(), "transaction promoted");
        }
        result
    }

    fn rollback(&self, txn: TxnId) {
        if let Some(state) = self.txns.lock().remove(&txn) {
            let keys = state.lock().pending.len();
            debug!(store = %self.name, txn = %txn, keys, "staged changes discarded");
            self.tracer.record(&self.name, "rollback", txn);
        }
    }
}

impl BlobStore for TransactionalBlobStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Transactional(Box::new(self.inner.permanent.kind()))
    }

    fn key_strategy(&self) -> &KeyStrategy {
        self.inner.permanent.key_strategy()
    }

    fn write_blob(&self, context: &BlobContext) -> StoreResult<String> {
        self.staged(|state| {
            let key = state.transient.write_blob(context)?;
            let generation = self.generation(&key);
            state.touch(&key, generation).op = PendingOp::Write;
            self.inner.tracer.record(&self.inner.name, "write", &key);
            Ok(key)
        })
    }

    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        self.staged(|state| {
            state.transient.write_file(key, file)?;
            let generation = self.generation(key);
            state.touch(key, generation).op = PendingOp::Write;
            self.inner.tracer.record(&self.inner.name, "write", key);
            Ok(())
        })
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        if let Some(state) = self.current_state()? {
            let state = state.lock();
            match state.op(key) {
                PendingOp::Write => return state.transient.read_blob(key, dest),
                PendingOp::Delete => return Ok(false),
                PendingOp::Unmodified => {}
            }
        }
        self.inner.permanent.read_blob(key, dest)
    }

    fn get_file(&self, key: &str) -> StoreResult<Option<PathBuf>> {
        if let Some(state) = self.current_state()? {
            let state = state.lock();
            match state.op(key) {
                PendingOp::Write => return state.transient.get_file(key),
                PendingOp::Delete => return Ok(None),
                PendingOp::Unmodified => {}
            }
        }
        self.inner.permanent.get_file(key)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        if let Some(state) = self.current_state()? {
            match state.lock().op(key) {
                PendingOp::Write => return Ok(true),
                PendingOp::Delete => return Ok(false),
                PendingOp::Unmodified => {}
            }
        }
        self.inner.permanent.exists(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.inner.manager.current().is_none() && self.inner.permanent.copy_blob_is_optimized(source)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        let copied = self.staged(|state| {
            if !state.transient.copy_blob(key, source, source_key, false)? {
                return Ok(false);
            }
            let generation = self.generation(key);
            state.touch(key, generation).op = PendingOp::Write;
            self.inner.tracer.record(
                &self.inner.name,
                "copy",
                format_args!("{}:{source_key} -> {key}", source.name()),
            );
            Ok(true)
        })?;
        if copied && atomic_move {
            source.delete_blob(source_key)?;
        }
        Ok(copied)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.staged(|state| {
            state.transient.delete_blob(key)?;
            let generation = self.generation(key);
            let pending = state.touch(key, generation);
            pending.op = PendingOp::Delete;
            pending.updates.clear();
            self.inner.tracer.record(&self.inner.name, "delete", key);
            Ok(())
        })
    }

    fn update_blob(&self, key: &str, update: &BlobUpdate) -> StoreResult<()> {
        if !self.exists(key)? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.staged(|state| {
            let generation = self.generation(key);
            state.touch(key, generation).updates.push(update.clone());
            Ok(())
        })
    }

    fn status(&self, key: &str) -> StoreResult<BlobStatus> {
        if let Some(state) = self.current_state()? {
            let state = state.lock();
            if let Some(pending) = state.pending.get(key) {
                let base = match pending.op {
                    PendingOp::Delete => return Err(StoreError::NotFound(key.to_string())),
                    PendingOp::Write => BlobStatus::hot(),
                    PendingOp::Unmodified => self.inner.permanent.status(key)?,
                };
                return Ok(pending.updates.iter().fold(base, |status, u| status.apply(u)));
            }
        }
        self.inner.permanent.status(key)
    }

    fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys = self.inner.permanent.list_keys()?;
        if let Some(state) = self.current_state()? {
            let state = state.lock();
            keys.retain(|k| state.op(k) != PendingOp::Delete);
            keys.extend(
                state
                    .pending
                    .iter()
                    .filter(|(_, p)| p.op == PendingOp::Write)
                    .map(|(k, _)| k.clone()),
            );
            keys.sort();
            keys.dedup();
        }
        Ok(keys)
    }

    /// Discard all staged changes of every transaction and clear the
    /// permanent store.
    fn clear(&self) -> StoreResult<()> {
        self.inner.txns.lock().clear();
        *self.inner.keys.lock() = KeyTable::default();
        self.inner.permanent.clear()?;
        self.inner.tracer.record(&self.inner.name, "clear", "*");
        Ok(())
    }
}
