//! CLI argument definitions.

use clap::{Parser, Subcommand};

use crate::commands::{AuditCmd, ClaimCmd, ConfigCmd, RegistrationCmd, ServeCmd};

#[derive(Parser)]
#[command(name = "tpm")]
#[command(about = "Tenant pool manager - keeps pre-provisioned tenant environments ready to claim")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pool reconciler
    Serve(ServeCmd),

    /// Manage registrations (pool policies)
    Registration(RegistrationCmd),

    /// Inspect and drive tenant claims
    Claim(ClaimCmd),

    /// List audit records
    Audit(AuditCmd),

    /// Manage configuration
    Config(ConfigCmd),
}

impl Command {
    pub async fn execute(&self) -> anyhow::Result<()> {
        match self {
            Command::Serve(cmd) => cmd.run().await,
            Command::Registration(cmd) => cmd.run().await,
            Command::Claim(cmd) => cmd.run().await,
            Command::Audit(cmd) => cmd.run().await,
            Command::Config(cmd) => cmd.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_claim_get() {
        let cli = Cli::try_parse_from([
            "tpm", "claim", "get", "-r", "reg", "--state", "available", "--state", "reserved",
            "--page-size", "10",
        ])
        .unwrap();
        let Command::Claim(cmd) = cli.command else {
            panic!("expected claim command");
        };
        let crate::commands::ClaimSubCmd::Get(get) = cmd.command else {
            panic!("expected get");
        };
        assert_eq!(get.registration.as_deref(), Some("reg"));
        assert_eq!(get.states, vec!["available", "reserved"]);
        assert_eq!(get.page.query().page_size, 10);
    }
}
