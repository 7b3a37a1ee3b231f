//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up the bridge on an ephemeral port, exercise its endpoints, and shut
//! it down cleanly.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::logging::targets;
use crate::server::http::{create_router, AppState};

/// Everything needed to start the bridge server.
pub struct ServerConfig {
    pub state: AppState,
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    pub fn new(state: AppState, bind_address: SocketAddr) -> Self {
        ServerConfig {
            state,
            bind_address,
        }
    }

    /// Binds to `127.0.0.1:0` (OS-assigned port).
    pub fn for_testing(state: AppState) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// Handle to a running server.  Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(target: targets::HTTP, "Server task returned error: {}", e),
            Ok(Err(e)) => error!(target: targets::HTTP, "Server task panicked: {}", e),
            Err(_) => warn!(target: targets::HTTP, "Server task did not finish within 5s timeout"),
        }
    }
}

/// Bind and serve the bridge router in a background task.
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let app = create_router(config.state);

    // Port 0 picks an ephemeral port.
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: targets::HTTP, "Control bridge listening on http://{}", local_addr);
    info!(target: targets::HTTP, "Pairing code, when pending: http://{}/qr", local_addr);

    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        server_task,
    })
}

/// Wait for Ctrl+C or (on Unix) SIGTERM. Returns the signal name.
pub async fn await_shutdown_trigger() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "ctrl-c",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "ctrl-c"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
