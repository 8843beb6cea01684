//! Cross-replica coordination for pool scans.

mod lock;
mod store;

pub use lock::Coordinator;
pub use store::{KvStores, MemoryKvStore, SqlKvStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store database error: {0}")]
    Database(#[from] sqlx::Error),
}
