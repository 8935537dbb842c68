use strata_store::StoreError;
use thiserror::Error;

use crate::manager::TxnId;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("a transaction is already active on this thread")]
    AlreadyActive,

    #[error("no active transaction")]
    NotActive,

    #[error("{0} was marked rollback-only and has been rolled back")]
    RolledBack(TxnId),

    #[error("commit of {txn} failed")]
    CommitFailed {
        txn: TxnId,
        #[source]
        source: StoreError,
    },
}

impl TxnError {
    /// Returns `true` if the commit lost a race with another transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::CommitFailed {
                source: StoreError::ConcurrentUpdate { .. },
                ..
            }
        )
    }

    /// The store error behind a failed commit.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::CommitFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type TxnResult<T> = Result<T, TxnError>;
