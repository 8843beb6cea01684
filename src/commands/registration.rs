//! Registration command - manage pool policies.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Subcommand};

use super::{PageArgs, StoreArgs, open_manager};
use crate::pool::{CreateRegistration, UpdateRegistration};
use crate::types::{Registration, RegistrationConfig, RegistrationState};

#[derive(Args)]
pub struct RegistrationCmd {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub command: RegistrationSubCmd,
}

#[derive(Subcommand)]
pub enum RegistrationSubCmd {
    /// Create a registration
    Create(CreateCmd),

    /// List registrations
    Get(GetCmd),

    /// Update description, policy or state
    Update(UpdateCmd),

    /// Mark a registration for deletion; its claims are drained first
    Delete(DeleteCmd),
}

/// Policy as inline JSON or from a file.
#[derive(Args)]
pub struct ConfigSource {
    /// Policy JSON, e.g. '{"version":"v1","edgeCount":1,...}'
    #[arg(long, conflicts_with = "config_file")]
    pub config: Option<String>,

    /// File holding the policy JSON
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

impl ConfigSource {
    fn load(&self) -> Result<Option<RegistrationConfig>> {
        let json = match (&self.config, &self.config_file) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            (None, None) => return Ok(None),
        };
        Ok(Some(RegistrationConfig::parse(&json)?))
    }
}

#[derive(Args)]
pub struct CreateCmd {
    /// Registration id
    pub id: String,

    #[arg(long, default_value = "")]
    pub description: String,

    #[command(flatten)]
    pub source: ConfigSource,

    /// Create without filling the pool
    #[arg(long)]
    pub inactive: bool,
}

#[derive(Args)]
pub struct GetCmd {
    /// Only this registration
    pub id: Option<String>,

    /// Filter by state (active, inactive, deleting); repeatable
    #[arg(long = "state")]
    pub states: Vec<String>,

    #[command(flatten)]
    pub page: PageArgs,

    /// Print full JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct UpdateCmd {
    pub id: String,

    #[arg(long)]
    pub description: Option<String>,

    #[command(flatten)]
    pub source: ConfigSource,

    /// New state (active, inactive)
    #[arg(long)]
    pub state: Option<String>,
}

#[derive(Args)]
pub struct DeleteCmd {
    pub id: String,
}

fn parse_state(raw: &str) -> Result<RegistrationState> {
    raw.to_uppercase()
        .parse()
        .map_err(|e: String| anyhow!("{}. Use: active, inactive, deleting", e))
}

fn print_registration(registration: &Registration) {
    let cfg = registration.config.v1();
    println!(
        "{}  {:<8}  edges={} pool={}..{} pending={} trial={}s  {}",
        registration.id,
        registration.state,
        cfg.edge_count,
        cfg.min_tenant_pool_size,
        cfg.max_tenant_pool_size,
        cfg.max_pending_tenant_count,
        cfg.trial_expiry,
        registration.description,
    );
}

impl RegistrationCmd {
    pub async fn run(&self) -> Result<()> {
        let manager = open_manager(&self.store, false).await?;

        match &self.command {
            RegistrationSubCmd::Create(cmd) => {
                let Some(config) = cmd.source.load()? else {
                    bail!("A policy is required: pass --config or --config-file");
                };
                let state = if cmd.inactive {
                    RegistrationState::Inactive
                } else {
                    RegistrationState::Active
                };
                let registration = manager
                    .create_registration(&CreateRegistration {
                        id: cmd.id.clone(),
                        description: cmd.description.clone(),
                        config,
                        state,
                    })
                    .await?;
                println!("Created registration {} ({}).", registration.id, registration.state);
            }
            RegistrationSubCmd::Get(cmd) => {
                let states = cmd
                    .states
                    .iter()
                    .map(|s| parse_state(s))
                    .collect::<Result<Vec<_>>>()?;
                let (registrations, info) = manager
                    .get_registrations(cmd.id.as_deref(), &states, &cmd.page.query())
                    .await?;

                if cmd.json {
                    println!("{}", serde_json::to_string_pretty(&registrations)?);
                    return Ok(());
                }
                if registrations.is_empty() {
                    println!("No registrations found.");
                    return Ok(());
                }
                for registration in &registrations {
                    print_registration(registration);
                }
                println!(
                    "\nPage {} ({} per page), {} total",
                    info.page_index, info.page_size, info.total_count
                );
            }
            RegistrationSubCmd::Update(cmd) => {
                let registration = manager
                    .update_registration(&UpdateRegistration {
                        id: cmd.id.clone(),
                        description: cmd.description.clone(),
                        config: cmd.source.load()?,
                        state: cmd.state.as_deref().map(parse_state).transpose()?,
                    })
                    .await?;
                print_registration(&registration);
            }
            RegistrationSubCmd::Delete(cmd) => {
                manager.delete_registration(&cmd.id).await?;
                println!("Registration {} marked for deletion.", cmd.id);
            }
        }
        Ok(())
    }
}
