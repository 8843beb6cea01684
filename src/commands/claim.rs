//! Claim command - inspect and drive tenant claims.

use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use super::{Manager, PageArgs, StoreArgs, open_manager};
use crate::pool::ClaimLookup;
use crate::pool::models::ClaimQuery;
use crate::types::{ClaimState, PoolError, TenantClaim};

#[derive(Args)]
pub struct ClaimCmd {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub command: ClaimSubCmd,
}

#[derive(Subcommand)]
pub enum ClaimSubCmd {
    /// Create a trial claim, or a claim for an existing tenant
    Create(CreateCmd),

    /// List claims
    Get(GetCmd),

    /// List claims together with their registration policy
    Scan(ScanCmd),

    /// Reserve an available trial claim
    Reserve(RegistrationArg),

    /// Confirm a reservation
    Confirm(TenantArgs),

    /// Change trial flag or expiry
    Update(UpdateCmd),

    /// Tear a claim down
    Delete(TenantArg),

    /// Replace available claims, optionally only those matching a filter
    Recreate(RecreateCmd),

    /// Give a claim to a user by email
    Assign(AssignCmd),

    /// Hard-delete every claim of a registration without draining edges
    Purge(PurgeCmd),
}

#[derive(Args)]
pub struct RegistrationArg {
    pub registration: String,
}

#[derive(Args)]
pub struct TenantArg {
    pub tenant: String,
}

#[derive(Args)]
pub struct TenantArgs {
    pub registration: String,
    pub tenant: String,
}

#[derive(Args)]
pub struct CreateCmd {
    pub registration: String,

    /// Existing tenant to provision for (skips the pool)
    #[arg(long)]
    pub tenant: Option<String>,
}

#[derive(Args)]
pub struct GetCmd {
    #[arg(long, short = 'r')]
    pub registration: Option<String>,

    #[arg(long, short = 't')]
    pub tenant: Option<String>,

    /// Filter by state; repeatable
    #[arg(long = "state")]
    pub states: Vec<String>,

    /// Find the tenant of this user
    #[arg(long)]
    pub email: Option<String>,

    /// Include backend details for every edge
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(flatten)]
    pub page: PageArgs,

    /// Print full JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ScanCmd {
    #[arg(long, short = 'r')]
    pub registration: Option<String>,

    /// Filter by state; repeatable
    #[arg(long = "state")]
    pub states: Vec<String>,

    #[command(flatten)]
    pub page: PageArgs,
}

#[derive(Args)]
pub struct UpdateCmd {
    pub tenant: String,

    #[arg(long)]
    pub trial: Option<bool>,

    /// New expiry, RFC 3339
    #[arg(long)]
    pub expires_at: Option<String>,
}

#[derive(Args)]
pub struct RecreateCmd {
    pub registration: String,

    /// Only claims matching, e.g. "created_at < '2026-01-01T00:00:00Z'"
    #[arg(long)]
    pub filter: Option<String>,
}

#[derive(Args)]
pub struct AssignCmd {
    pub registration: String,
    pub tenant: String,
    pub email: String,
}

#[derive(Args)]
pub struct PurgeCmd {
    pub registration: String,

    /// Required; edges are left behind on the backend
    #[arg(long)]
    pub yes: bool,
}

fn parse_states(raw: &[String]) -> Result<Vec<ClaimState>> {
    raw.iter()
        .map(|s| {
            s.to_uppercase().parse().map_err(|e: String| {
                anyhow!("{}. Use: creating, available, reserved, assigned, deleting, failed", e)
            })
        })
        .collect()
}

fn print_claim(claim: &TenantClaim) {
    let expires = claim
        .expires_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<9}  {}  trial={} edges={} expires={}",
        claim.id,
        claim.state,
        claim.registration_id,
        claim.trial,
        claim.edge_contexts.len(),
        expires,
    );
}

/// Tell the caller when waiting and asking again may succeed.
fn with_retry_hint(err: PoolError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow::Error::new(err).context("No tenant claim could be reserved right now; retry shortly")
    } else {
        err.into()
    }
}

impl ClaimCmd {
    pub async fn run(&self) -> Result<()> {
        let manager = open_manager(&self.store, false).await?;
        let result = self.execute(&manager).await;
        // Failed operations are audited too
        manager.flush_audit().await;
        result
    }

    async fn execute(&self, manager: &Manager) -> Result<()> {
        match &self.command {
            ClaimSubCmd::Create(cmd) => {
                let claim = manager
                    .create_tenant_claim(&cmd.registration, cmd.tenant.clone())
                    .await?;
                print_claim(&claim);
            }
            ClaimSubCmd::Get(cmd) => {
                let lookup = ClaimLookup {
                    registration_id: cmd.registration.clone(),
                    tenant_id: cmd.tenant.clone(),
                    states: parse_states(&cmd.states)?,
                    email: cmd.email.clone(),
                    verbose: cmd.verbose,
                };
                let (claims, info) = manager.get_tenant_claims(&lookup, &cmd.page.query()).await?;

                if cmd.json || cmd.verbose {
                    println!("{}", serde_json::to_string_pretty(&claims)?);
                    return Ok(());
                }
                if claims.is_empty() {
                    println!("No tenant claims found.");
                    return Ok(());
                }
                for claim in &claims {
                    print_claim(claim);
                }
                println!(
                    "\nPage {} ({} per page), {} total",
                    info.page_index, info.page_size, info.total_count
                );
            }
            ClaimSubCmd::Scan(cmd) => {
                let query = ClaimQuery {
                    registration_id: cmd.registration.clone(),
                    tenant_id: None,
                    states: parse_states(&cmd.states)?,
                };
                let lines = Mutex::new(Vec::new());
                let info = manager
                    .store()
                    .scan_tenant_claims(&query, &cmd.page.query(), |registration, claim| {
                        let cfg = registration.config.v1();
                        if let Ok(mut lines) = lines.lock() {
                            lines.push(format!(
                                "{}  {:<9}  {} [{}] {} x {}",
                                claim.id,
                                claim.state,
                                registration.id,
                                registration.state,
                                cfg.edge_count,
                                cfg.instance_type,
                            ));
                        }
                        async { Ok(()) }
                    })
                    .await?;
                for line in lines.into_inner().unwrap_or_default() {
                    println!("{}", line);
                }
                println!("\n{} matching claims", info.total_count);
            }
            ClaimSubCmd::Reserve(cmd) => {
                let tenant = manager
                    .reserve_tenant_claim(&cmd.registration)
                    .await
                    .map_err(with_retry_hint)?;
                println!("{}", tenant);
            }
            ClaimSubCmd::Confirm(cmd) => {
                let claim = manager
                    .confirm_tenant_claim(&cmd.registration, &cmd.tenant)
                    .await?;
                print_claim(&claim);
            }
            ClaimSubCmd::Update(cmd) => {
                if cmd.trial.is_none() && cmd.expires_at.is_none() {
                    bail!("Nothing to update: pass --trial or --expires-at");
                }
                let expires_at = cmd
                    .expires_at
                    .as_deref()
                    .map(|raw| {
                        DateTime::parse_from_rfc3339(raw)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|e| anyhow!("Invalid --expires-at {}: {}", raw, e))
                    })
                    .transpose()?;
                manager
                    .update_tenant_claim(&cmd.tenant, cmd.trial, expires_at)
                    .await?;
                println!("Updated tenant claim {}.", cmd.tenant);
            }
            ClaimSubCmd::Delete(cmd) => {
                manager.delete_tenant_claim(&cmd.tenant).await?;
                println!("Tenant claim {} marked for deletion.", cmd.tenant);
            }
            ClaimSubCmd::Recreate(cmd) => {
                let count = manager
                    .recreate_tenant_claims(&cmd.registration, cmd.filter.as_deref())
                    .await?;
                println!("{} tenant claims marked for recreation.", count);
            }
            ClaimSubCmd::Assign(cmd) => {
                manager
                    .assign_tenant_claim(&cmd.registration, &cmd.tenant, &cmd.email)
                    .await?;
                println!("Assigned {} to {}.", cmd.tenant, cmd.email);
            }
            ClaimSubCmd::Purge(cmd) => {
                if !cmd.yes {
                    bail!("Purging skips edge teardown; pass --yes to confirm");
                }
                let purged = manager.purge_tenants(&cmd.registration).await?;
                println!("Purged {} tenant claims.", purged.len());
            }
        }
        Ok(())
    }
}
