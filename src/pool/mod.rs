//! The tenant pool: claim bookkeeping, lifecycle operations and the
//! reconciler that keeps every registration's pool sized.

pub mod audit;
pub mod clock;
pub mod config;
pub mod db;
pub mod filter;
pub mod lifecycle;
pub mod models;
pub mod reconciler;
pub mod stats;

#[cfg(test)]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use config::PoolConfig;
pub use db::ClaimStore;
pub use lifecycle::{ClaimLookup, PoolManager};
pub use models::{AuditQuery, CreateRegistration, PageQuery, UpdateRegistration};
