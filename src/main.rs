use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use sct::config::{CliArgs, Config};
use sct::exec::PythonPlugin;
use sct::orchestrator::{Server, ServerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config: Config = cli.to_config().context("Failed to load configuration")?;

    std::fs::create_dir_all(&config.work_dir).with_context(|| {
        format!("Failed to create work directory {}", config.work_dir.display())
    })?;

    let plugin = Arc::new(PythonPlugin::new(config.python_config()));
    let context = Arc::new(ServerContext::new(config.server_options(), plugin));
    let server = Server::bind(config.bind.as_str(), Arc::clone(&context))
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    log::info!("Listening on {}", server.local_addr()?);

    // ======= PREPARATION END, EXECUTION START =======

    let shutdown_token = context.shutdown_token();
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_token.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, shutting down...");
                shutdown_token.cancel();
            }
            _ = terminate() => {
                log::info!("SIGTERM received, shutting down...");
                shutdown_token.cancel();
            }
        }
    });

    server.run().await;
    signals.abort();
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
