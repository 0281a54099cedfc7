//! Proxy Agent
//!
//! Development host for the interception engine: loads configuration, preloads
//! rules, serves the admin API and runs until told to stop.

use anyhow::{bail, Context};
use clap::Parser;
use devproxy_core::{
    admin::start_admin_server, InterceptionEngine, LoggingConfig, ProxyConfig, RuleSpec,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding ca.pem and ca.key
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,

    /// Path to an existing CA certificate (PEM), used together with --ca-key
    #[arg(long, requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// Path to an existing CA private key (PEM), used together with --ca-cert
    #[arg(long, requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Serve the admin API on this port
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// JSON file with an array of rules to load at startup
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Request header carrying the session id
    #[arg(long)]
    pub session_header: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            ..LoggingConfig::default()
        }
    }
}

/// Merge the config file (if any) with command line overrides.
pub fn build_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    if let Some(addr) = &args.listen_addr {
        config.listen_address = addr.clone();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(dir) = &args.ca_dir {
        config.certificate.storage_path = dir.clone();
    }
    if let Some(port) = args.admin_port {
        config.admin.enabled = true;
        config.admin.port = port;
    }
    if let Some(header) = &args.session_header {
        config.session_header = header.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Read a JSON array of rule definitions.
pub fn load_rules(path: &Path) -> anyhow::Result<Vec<RuleSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    let specs: Vec<RuleSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid rules file {}", path.display()))?;
    Ok(specs)
}

fn read_ca_pems(args: &Args) -> anyhow::Result<Option<(String, String)>> {
    match (&args.ca_cert, &args.ca_key) {
        (Some(cert), Some(key)) => {
            let cert = std::fs::read_to_string(cert)
                .with_context(|| format!("failed to read {}", cert.display()))?;
            let key = std::fs::read_to_string(key)
                .with_context(|| format!("failed to read {}", key.display()))?;
            Ok(Some((cert, key)))
        }
        (None, None) => Ok(None),
        _ => bail!("--ca-cert and --ca-key must be given together"),
    }
}

/// Run the engine until `shutdown` resolves, then stop it.
pub async fn run_agent(args: Args, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let engine = Arc::new(InterceptionEngine::new(config.clone())?);

    if let Some(path) = &args.rules {
        let specs = load_rules(path)?;
        let ids = engine
            .rules()
            .load_rules(specs)
            .with_context(|| format!("rejected rules in {}", path.display()))?;
        tracing::info!("Loaded {} rules from {}", ids.len(), path.display());
    }

    let pems = read_ca_pems(&args)?;
    let port = engine
        .start(
            pems.as_ref().map(|(cert, _)| cert.as_str()),
            pems.as_ref().map(|(_, key)| key.as_str()),
        )
        .await
        .context("failed to start proxy")?;

    tracing::info!("Proxy listening on {}:{}", config.listen_address, port);
    if pems.is_none() {
        tracing::info!(
            "CA certificate: {}",
            config.certificate.storage_path.join("ca.pem").display()
        );
    }

    if config.admin.enabled {
        let addr: SocketAddr = format!("{}:{}", config.admin.address, config.admin.port)
            .parse()
            .context("invalid admin address")?;
        let admin_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(addr, admin_engine).await {
                tracing::error!("Admin server failed: {}", e);
            }
        });
    }

    shutdown.await;
    engine.stop().await;
    tracing::info!("Proxy agent stopped");
    Ok(())
}
