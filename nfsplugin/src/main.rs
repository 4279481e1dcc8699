//! `nfsplugin` runs the NFS CSI backend behind the QUIC transport.

mod config;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libnfscsi::NfsBackend;
use libnfscsi::mount::LinuxMounter;
use libnfscsi::transport::server::CsiServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Args, LogFormat, PluginConfig};

fn init_tracing(config: &PluginConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = PluginConfig::load(&args)?;
    init_tracing(&config);

    let tls = tls::server_config(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let working_dir = &config.driver.working_mount_dir;
    tokio::fs::create_dir_all(working_dir)
        .await
        .with_context(|| format!("Failed to create {}", working_dir.display()))?;

    let backend = Arc::new(NfsBackend::new(
        config.driver.clone(),
        Arc::new(LinuxMounter::new()),
    ));
    let server = CsiServer::new(
        config.listen_addr,
        tls,
        backend,
        Duration::from_secs(config.request_timeout_secs),
    )?;
    info!(
        driver = %config.driver.driver_name,
        node = %config.driver.node_id,
        staging = config.driver.enable_staging,
        "nfsplugin started"
    );

    tokio::select! {
        res = server.serve() => res?,
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for shutdown signal")?;
            info!("shutting down");
            server.endpoint().close(0u32.into(), b"shutdown");
            server.endpoint().wait_idle().await;
        }
    }
    Ok(())
}
