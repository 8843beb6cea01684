//! Config command - manage service configuration.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::pool::PoolConfig;

#[derive(Args)]
pub struct ConfigCmd {
    #[command(subcommand)]
    pub command: ConfigSubCmd,
}

#[derive(Subcommand)]
pub enum ConfigSubCmd {
    /// Set a value by key, e.g. `scan_delay_secs 30` or `pool_stats.enabled true`
    Set(SetCmd),

    /// Show current configuration
    Show,

    /// Print the config file location
    Path,
}

#[derive(Args)]
pub struct SetCmd {
    pub key: String,
    pub value: String,
}

impl ConfigCmd {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            ConfigSubCmd::Set(cmd) => {
                let mut config = PoolConfig::load()?;
                config.set(&cmd.key, &cmd.value)?;
                config.save()?;
                println!("{} set to: {}", cmd.key, cmd.value);
            }
            ConfigSubCmd::Show => {
                let mut config = PoolConfig::load()?;
                println!("Config: {}", PoolConfig::config_path()?.display());
                println!();
                // Never echo the token itself
                if config.provisioner_token.is_some() {
                    config.provisioner_token = Some("(set)".to_string());
                }
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigSubCmd::Path => {
                println!("{}", PoolConfig::config_path()?.display());
            }
        }
        Ok(())
    }
}
