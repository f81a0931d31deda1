mod connections;
mod handler;
mod watchdog;

pub use connections::{ConnectionGuard, ConnectionSet};
pub use handler::handle_connection;
pub use watchdog::Watchdog;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::exec::Plugin;
use crate::protocol::{DEFAULT_IO_TIMEOUT, ExecutionResult, ResultCode};
use crate::settings::{GlobalSettings, SettingsVersion};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_connections: usize,
    /// Idle time after which the container shuts itself down
    pub container_timeout: Duration,
    /// Per-request execution budget until settings say otherwise
    pub code_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 20,
            container_timeout: Duration::from_secs(600),
            code_timeout: Duration::from_secs(50),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Settings currently active in this process, guarded by the handshake lock
pub(crate) struct SettingsState {
    pub(crate) version: Option<SettingsVersion>,
    pub(crate) settings: Arc<GlobalSettings>,
    pub(crate) code_timeout: Duration,
}

/// Everything connection handlers share
pub struct ServerContext {
    pub(crate) state: Mutex<SettingsState>,
    pub(crate) connections: Arc<ConnectionSet>,
    pub(crate) watchdog: Watchdog,
    pub(crate) shutdown: CancellationToken,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) io_timeout: Duration,
}

impl ServerContext {
    pub fn new(options: ServerOptions, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            state: Mutex::new(SettingsState {
                version: None,
                settings: Arc::new(GlobalSettings::default()),
                code_timeout: options.code_timeout,
            }),
            connections: Arc::new(ConnectionSet::new(options.max_connections)),
            watchdog: Watchdog::new(options.container_timeout),
            shutdown: CancellationToken::new(),
            plugin,
            io_timeout: options.io_timeout,
        }
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub async fn current_version(&self) -> Option<SettingsVersion> {
        self.state.lock().await.version.clone()
    }

    pub async fn code_timeout(&self) -> Duration {
        self.state.lock().await.code_timeout
    }

    /// Tell every live connection the listener is going away
    async fn notify_shutdown(&self) {
        let notice = ExecutionResult::status(ResultCode::ListenerTimeout).to_packet();
        for session in self.connections.snapshot() {
            if let Err(e) = session.finish(&notice).await {
                log::debug!("Connection {} already closed: {e}", session.id());
            }
        }
    }
}

pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs, context: Arc<ServerContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    /// Accept connections until the shutdown token fires or the watchdog expires,
    /// then notify live connections and wait for their handlers
    pub async fn run(self) {
        let Self { listener, context } = self;
        let shutdown = context.shutdown_token();

        let watchdog = {
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                if context.watchdog.expired(&context.shutdown).await {
                    log::info!("No handshake for {:?}, shutting down", context.watchdog.duration());
                    context.shutdown.cancel();
                }
            })
        };

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Shutdown signal received, closing listener");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handlers.spawn(handle_connection(Arc::clone(&context), stream, peer));
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                },

                Some(res) = handlers.join_next() => {
                    if let Err(e) = res {
                        log::error!("Connection handler panicked: {e:?}");
                    }
                }
            }
        }
        drop(listener);

        context.notify_shutdown().await;
        log::info!("Waiting for {} connection handlers to finish...", handlers.len());
        while let Some(res) = handlers.join_next().await {
            if let Err(e) = res {
                log::error!("Connection handler panicked: {e:?}");
            }
        }
        if let Err(e) = watchdog.await {
            log::error!("Watchdog task failed: {e:?}");
        }

        log::info!("Shutdown complete");
    }
}
