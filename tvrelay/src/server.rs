//! Server lifecycle
//!
//! Starts the HTTP server and the idle reaper, waits for a shutdown signal,
//! then stops every locally owned stream.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tvrelay_api::{create_router, AppState};
use tvrelay_core::Config;
use tvrelay_livestream::StreamingInfrastructure;

/// tvrelay server - manages all server components
pub struct RelayServer {
    config: Config,
    streaming: Arc<StreamingInfrastructure>,
}

impl RelayServer {
    pub const fn new(config: Config, streaming: Arc<StreamingInfrastructure>) -> Self {
        Self { config, streaming }
    }

    /// Start all components and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting tvrelay server...");

        let cancel = CancellationToken::new();
        let reaper = self.streaming.start_reaper(&self.config, cancel.child_token());
        let http_handle = self.start_http_server(cancel.child_token()).await?;

        info!("All components started successfully");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        // Signal all components to shut down
        cancel.cancel();
        if let Err(e) = reaper.await {
            error!("Idle reaper task failed: {}", e);
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!(
            "Stopping {} locally owned stream(s)...",
            self.streaming.registry.local_count()
        );
        self.streaming.shutdown().await;
        info!("tvrelay server shut down complete");
    }

    /// Start HTTP server
    async fn start_http_server(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        let router = create_router(AppState::new(Arc::clone(&self.streaming)));

        let handle = tokio::spawn(async move {
            info!("HTTP server listening on {}", http_addr);

            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
