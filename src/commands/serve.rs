//! Serve command - run the pool reconciler until interrupted.

use anyhow::Result;
use clap::Args;
use tokio::sync::watch;

use super::{StoreArgs, open_manager};

#[derive(Args)]
pub struct ServeCmd {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Use in-memory provisioning and identity backends (local trials only)
    #[arg(long)]
    pub fake_backends: bool,
}

impl ServeCmd {
    pub async fn run(&self) -> Result<()> {
        let manager = open_manager(&self.store, self.fake_backends).await?;

        if !manager.config().enable_scanner {
            println!("Scanner is disabled (enable_scanner = false). Nothing to do.");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = tokio::spawn(manager.clone().run(shutdown_rx));

        println!("Reconciler running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;

        println!("\nStopping reconciler...");
        let _ = shutdown_tx.send(true);
        reconciler.await??;
        manager.flush_audit().await;

        Ok(())
    }
}
