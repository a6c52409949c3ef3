//! Binds the configured listeners and runs them until shutdown.

use crate::error::ChatError;
use crate::handlers::{chat_routes, ClientSender};
use crate::listener::{load_tls, serve_lines};
use crate::state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serves the WebSocket endpoint and, if configured, the line listener.
///
/// Returns once `AppState::shutdown` has been called and open connections have
/// unregistered, or `shutdown_grace` has elapsed.
///
/// # Errors
///
/// Fails if the configuration does not validate, a listener cannot be bound
/// or the TLS material cannot be loaded.
pub async fn serve(state: AppState<ClientSender>) -> Result<(), ChatError> {
    let config = state.config.clone();
    config.validate()?;

    let line_task = match config.line_port {
        Some(line_port) => {
            let tls = config.tls.as_ref().map(load_tls).transpose()?;
            let addr = format!("{}:{}", config.host, line_port);
            let listener = TcpListener::bind(&addr).await?;
            info!(
                "Line listener on {} ({})",
                addr,
                if tls.is_some() { "TLS" } else { "plaintext" }
            );
            Some(tokio::spawn(serve_lines(listener, tls, state.clone())))
        }
        None => None,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Chat server running on {}", addr);

    let shutdown = state.shutdown_token();
    axum::serve(
        listener,
        chat_routes(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    if let Some(task) = line_task {
        if let Err(e) = task.await {
            warn!("Line listener task failed: {}", e);
        }
    }

    drain(&state, config.shutdown_grace).await;
    info!("Chat server stopped");
    Ok(())
}

async fn drain(state: &AppState<ClientSender>, grace: Duration) {
    let waited = tokio::time::timeout(grace, async {
        while !state.registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if waited.is_err() {
        warn!(
            "{} connection(s) still open after shutdown grace period",
            state.registry.len().await
        );
    }
}
