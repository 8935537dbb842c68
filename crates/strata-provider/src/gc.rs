use std::collections::HashSet;
use std::fs;

use strata_store::{BlobStore, StoreResult};
use tracing::debug;

/// Outcome of a garbage collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Keys listed by the store.
    pub examined: usize,
    /// Unmarked keys removed (or that would be, on a dry run).
    pub deleted: usize,
    pub kept: usize,
    /// Keys that are not digests of a dedup store and were left alone.
    pub ignored: usize,
    /// Bytes freed, where the store exposes local files.
    pub deleted_bytes: u64,
}

/// Mark-and-sweep over `store`: every listed key absent from `marked` is
/// deleted. Marking is the caller's job.
///
/// In a digest store only well-formed digest keys are candidates; anything
/// else in the namespace belongs to someone else.
pub fn collect_garbage(
    store: &dyn BlobStore,
    marked: &HashSet<String>,
    dry_run: bool,
) -> StoreResult<GcReport> {
    let strategy = store.key_strategy().clone();
    let mut report = GcReport::default();
    for key in store.list_keys()? {
        report.examined += 1;
        if strategy.use_dedup() && !strategy.is_valid_digest(&key) {
            report.ignored += 1;
            continue;
        }
        if marked.contains(&key) {
            report.kept += 1;
            continue;
        }
        if let Some(path) = store.get_file(&key)? {
            if let Ok(meta) = fs::metadata(&path) {
                report.deleted_bytes += meta.len();
            }
        }
        if !dry_run {
            store.delete_blob(&key)?;
        }
        debug!(store = store.name(), key = %key, dry_run, "unreferenced blob");
        report.deleted += 1;
    }
    Ok(report)
}
