use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::StagingManager;
use common::cli::{CommonArgs, CommonCommands, utils};
use server::{AppState, create_router};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "filedrop")]
#[command(about = "Filedrop - HTTP file-upload service with managed upload staging")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for Commands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            _ => {
                log::error!("Failed to install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    // Load application configuration
    let config = utils::load_config(cli.common.config.as_ref())?;

    // Handle common commands that don't require starting the service
    let command = cli.command.unwrap_or_default();
    let Commands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config).await? {
        return Ok(()); // Command handled, exit early
    }

    log::info!("Starting Filedrop");

    tokio::fs::create_dir_all(&config.server.upload_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create upload directory {}",
                config.server.upload_dir
            )
        })?;

    let staging = Arc::new(
        StagingManager::new(config.staging.clone())
            .await
            .context("Failed to initialize staging area")?,
    );

    let state = AppState::new(Arc::clone(&staging), &config);
    let app = create_router(state);

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    log::info!("HTTP server listening on {addr}");
    log::info!("Upload files with POST http://{addr}/upload");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .context("HTTP server error")?;

    // In-flight uploads have finished once the server drains; reclaim the
    // staging area before exiting.
    log::info!("Shutting down, reclaiming staged files");
    staging.sweep_now().await;
    staging.shutdown(config.staging.shutdown_timeout).await;
    log::info!("Shutdown complete");

    Ok(())
}
