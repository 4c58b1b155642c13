//! Exposition HTTP server

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use super::routes;
use crate::core::pipeline::PipelineState;
use crate::domain::metrics::{Aggregator, PipelineStats};

/// Read-only view handed to request handlers
#[derive(Clone)]
pub struct ExpositionState {
    pub aggregator: Arc<Aggregator>,
    pub stats: Arc<PipelineStats>,
    pub pipeline_state: watch::Receiver<PipelineState>,
    pub bus_backend: &'static str,
}

/// Bound listener serving `/metrics` and `/health`
pub struct ExpositionServer {
    listener: TcpListener,
}

impl ExpositionServer {
    /// Bind the listening socket
    ///
    /// Binding happens before the server runs so that address conflicts are
    /// reported at startup.
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn serve<F>(self, state: ExpositionState, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = routes::router(state);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = ExpositionServer::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = ExpositionServer::bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(ExpositionServer::bind("127.0.0.1", port).await.is_err());
    }
}
