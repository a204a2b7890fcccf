// SPDX-License-Identifier: GPL-3.0-only

//! Image Flash Helper - privileged service that writes disk images to removable media
//!
//! The helper listens on a Unix socket for peer-to-peer D-Bus clients, checks
//! every call against the platform authorization database and runs at most
//! one write job at a time.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

mod arbitration;
mod auth;
mod claim;
mod config;
mod device_tree;
mod error;
mod service;
#[cfg(test)]
mod testing;
mod transport;
mod writer;

use auth::AuthorizationGate;
use claim::ClaimCoordinator;
use config::{Cli, HelperConfig};
use imageflash_sys::Tools;
use service::{HelperHandle, HelperService};
use writer::FlashEnvironment;

fn build_service(
    config: &HelperConfig,
    shutdown: CancellationToken,
) -> error::Result<(HelperService, HelperHandle)> {
    let tools = Tools::resolve(&config.diskutil, &config.hdiutil)?;
    let backend = arbitration::platform_backend()?;
    let claims = Arc::new(ClaimCoordinator::new(
        backend,
        Handle::current(),
        config.arbitration_timeout(),
    ));

    let env = FlashEnvironment::new(claims, tools, config.boot_image.clone());
    let gate = AuthorizationGate::new(auth::platform_authority(), config.identifier.clone());
    Ok(HelperService::new(Arc::new(env), gate, shutdown))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("imageflash_helper=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Image Flash Helper v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Image flash helper must run as root");
        anyhow::bail!("Helper must run with root privileges");
    }

    let config = HelperConfig::load(&cli)?;
    tracing::debug!("Using config {config:?}");

    let shutdown = CancellationToken::new();
    let (service, handle) = build_service(&config, shutdown.clone())?;

    let service_task = tokio::spawn(service.run());
    let listener_task = tokio::spawn(transport::listen(
        config.socket_path.clone(),
        handle,
        shutdown.clone(),
    ));

    tracing::info!("Helper ready, waiting for requests...");

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
        _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        _ = shutdown.cancelled() => tracing::info!("Stop requested by client"),
    }
    shutdown.cancel();

    if let Err(e) = service_task.await {
        tracing::warn!("Request loop ended abnormally: {e}");
    }
    match listener_task.await {
        Ok(Err(e)) => tracing::warn!("Listener failed: {e}"),
        Err(e) => tracing::warn!("Listener ended abnormally: {e}"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Image Flash Helper shutting down");
    Ok(())
}
