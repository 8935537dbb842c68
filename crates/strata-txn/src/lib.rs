//! Transactions for Strata blob stores.
//!
//! A [`TransactionManager`] binds at most one transaction to each thread.
//! Resources such as [`TransactionalBlobStore`] enlist in the current
//! transaction on first use and are committed or rolled back with it.
//!
//! ```text
//! let txn = manager.begin()?;
//! store.write_blob(&ctx)?;   // staged, visible only to this transaction
//! txn.commit()?;             // promoted to the permanent store
//! ```

pub mod error;
pub mod manager;
pub mod store;

pub use error::{TxnError, TxnResult};
pub use manager::{Transaction, TransactionManager, TransactionResource, TxnId};
pub use store::TransactionalBlobStore;
