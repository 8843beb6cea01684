//! Domain types shared by the store, the reconciler and the CLI.

mod audit;
mod claim;
mod error;
mod registration;

pub use audit::*;
pub use claim::*;
pub use error::{PoolError, PoolResult};
pub use registration::*;
