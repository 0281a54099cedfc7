//! Proxy Agent Binary Entry Point

use clap::Parser;
use devproxy_agent::{run_agent, Args};
use devproxy_core::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.logging_config())?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received, stopping proxy...");
    };

    if let Err(e) = run_agent(args, shutdown).await {
        tracing::error!("Proxy agent failed: {:#}", e);
        return Err(e);
    }

    Ok(())
}
