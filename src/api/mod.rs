pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::supervisor::Supervisor;

use routes::ApiState;

pub fn router(supervisor: Arc<Supervisor>) -> axum::Router {
    routes::api_router(ApiState { supervisor }).layer(CorsLayer::permissive())
}

/// Bind `host:port`. Split from [`serve`] so callers learn the bound address
/// before the server runs.
pub async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding controller API on {}", addr))
}

/// Serve the API on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "controller API listening");

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("controller API stopped");
    Ok(())
}
