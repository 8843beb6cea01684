//! CLI command implementations.

mod audit;
mod claim;
mod config;
mod registration;
mod serve;

pub use audit::AuditCmd;
pub use claim::ClaimCmd;
#[cfg(test)]
pub use claim::ClaimSubCmd;
pub use config::ConfigCmd;
pub use registration::RegistrationCmd;
pub use serve::ServeCmd;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::account::{AccountClients, HttpAccountService, MemoryAccountService};
use crate::coord::{Coordinator, KvStores, MemoryKvStore, SqlKvStore};
use crate::pool::{ClaimStore, PageQuery, PoolConfig, PoolManager, SystemClock};
use crate::provision::{FakeProvisioner, HttpProvisioner, Provisioners};

pub type Manager = PoolManager<Provisioners, AccountClients>;

/// Where the shared database lives.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Database file (default: from config)
    #[arg(long, env = "TPM_DATABASE")]
    pub database: Option<PathBuf>,
}

/// Paging and filtering shared by list commands.
#[derive(Args, Debug, Clone)]
pub struct PageArgs {
    /// Zero-based page index
    #[arg(long, default_value = "0")]
    pub page: u32,

    /// Rows per page (default 50, at most 1000)
    #[arg(long, default_value = "0")]
    pub page_size: u32,

    /// Filter expression, e.g. "trial = true and created_at < '2026-01-01T00:00:00Z'"
    #[arg(long)]
    pub filter: Option<String>,

    /// Sort order, e.g. "created_at desc"
    #[arg(long)]
    pub order_by: Option<String>,
}

impl PageArgs {
    pub fn query(&self) -> PageQuery {
        PageQuery {
            page_index: self.page,
            page_size: self.page_size,
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
        }
    }
}

/// Open the store and wire a manager against the configured backends.
pub async fn open_manager(store_args: &StoreArgs, fake_backends: bool) -> Result<Arc<Manager>> {
    let config = PoolConfig::load()?;
    let db_path = store_args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path.clone());

    let store = ClaimStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let (provisioner, accounts) = if fake_backends {
        (
            Provisioners::Fake(FakeProvisioner::new()),
            AccountClients::Memory(MemoryAccountService::new()),
        )
    } else {
        (
            Provisioners::Http(HttpProvisioner::with_base_url(
                &config.provisioner_url,
                config.provisioner_token_secret(),
            )?),
            AccountClients::Http(HttpAccountService::with_base_url(&config.account_url)?),
        )
    };

    // Replicas share scan locks through the database unless running alone
    let kv = if config.disable_scale_out {
        KvStores::Memory(MemoryKvStore::new())
    } else {
        KvStores::Sql(SqlKvStore::new(store.pool().clone()).await?)
    };

    let clock = Arc::new(SystemClock);
    let coordinator = Coordinator::new(kv, config.lock_ttl(), clock.clone());
    info!(database = %db_path.display(), fake_backends, "pool manager ready");

    Ok(Arc::new(PoolManager::new(
        store,
        provisioner,
        accounts,
        coordinator,
        config,
        clock,
    )))
}
