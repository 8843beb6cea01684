//! Audit command - list audit records.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Args;

use super::{PageArgs, StoreArgs, open_manager};
use crate::pool::AuditQuery;
use crate::types::AuditAction;

#[derive(Args)]
pub struct AuditCmd {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, short = 't')]
    pub tenant: Option<String>,

    #[arg(long, short = 'r')]
    pub registration: Option<String>,

    #[arg(long)]
    pub email: Option<String>,

    /// e.g. reserve_tenant_claim
    #[arg(long)]
    pub action: Option<String>,

    /// Only records after this time, RFC 3339
    #[arg(long)]
    pub since: Option<String>,

    #[command(flatten)]
    pub page: PageArgs,

    /// Print full JSON
    #[arg(long)]
    pub json: bool,
}

impl AuditCmd {
    pub async fn run(&self) -> Result<()> {
        let action = self
            .action
            .as_deref()
            .map(|raw| raw.to_uppercase().parse::<AuditAction>().map_err(anyhow::Error::msg))
            .transpose()?;
        let since = self
            .since
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| anyhow!("Invalid --since {}: {}", raw, e))
            })
            .transpose()?;

        let manager = open_manager(&self.store, false).await?;
        let query = AuditQuery {
            tenant_id: self.tenant.clone(),
            registration_id: self.registration.clone(),
            email: self.email.clone(),
            action,
            since,
        };
        let (logs, info) = manager.get_audit_logs(&query, &self.page.query()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&logs)?);
            return Ok(());
        }
        if logs.is_empty() {
            println!("No audit records found.");
            return Ok(());
        }

        for log in &logs {
            let subject = log
                .tenant_id
                .as_deref()
                .or(log.registration_id.as_deref())
                .or(log.email.as_deref())
                .unwrap_or("-");
            println!(
                "{}  {:<6}  {:<22}  {:<7}  {}  {}",
                log.created_at.to_rfc3339(),
                log.actor,
                log.action,
                log.response,
                subject,
                log.description,
            );
        }
        println!(
            "\nPage {} ({} per page), {} total",
            info.page_index, info.page_size, info.total_count
        );
        Ok(())
    }
}
