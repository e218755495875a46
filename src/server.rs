//! HTTP server entrypoint shared by the binary and the integration tests.

use crate::authenticator::Authenticator;
use crate::modules::cas_api::{self, CasApiState};
use crate::ticket::{ExpirationPolicy, TicketBroker, TicketStore};
use axum::Router;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bound port plus the shutdown trigger of a running server.
pub struct ServeHandle {
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<Result<(), std::io::Error>>>,
    purge: Option<JoinHandle<()>>,
}

impl ServeHandle {
    /// Stop accepting requests, drain in-flight ones, and stop the purge task.
    pub async fn shutdown(mut self) -> Result<(), ServeError> {
        if let Some(purge) = self.purge.take() {
            purge.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.await??;
        }
        Ok(())
    }
}

pub fn build_router(broker: TicketBroker, authenticator: Arc<dyn Authenticator>) -> Router {
    cas_api::router(Arc::new(CasApiState {
        broker,
        authenticator,
    }))
}

/// Periodically drop expired tickets from the store.
pub fn spawn_purge_task(
    store: Arc<dyn TicketStore>,
    policy: ExpirationPolicy,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired(&policy, Utc::now()).await {
                Ok(0) => debug!("Purge found no expired tickets"),
                Ok(removed) => info!("Purged {} expired tickets", removed),
                Err(e) => error!("Ticket purge failed: {}", e),
            }
        }
    })
}

/// Bind `bind` and serve the CAS endpoints in a spawned task.
pub async fn serve(
    broker: TicketBroker,
    authenticator: Arc<dyn Authenticator>,
    bind: &str,
) -> Result<ServeHandle, ServeError> {
    let purge = if broker.settings.purge_interval.is_zero() {
        None
    } else {
        Some(spawn_purge_task(
            broker.store.clone(),
            broker.settings.expiration,
            broker.settings.purge_interval,
        ))
    };

    let app = build_router(broker, authenticator);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let port = listener.local_addr()?.port();
    info!("CAS server listening on {} (port {})", bind, port);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("Received shutdown signal");
            })
            .await
    });

    Ok(ServeHandle {
        port,
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
        purge,
    })
}
