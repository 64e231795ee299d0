use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::Metrics;

/// Serve `GET /metrics` on an already-bound listener. Binding happens at
/// startup so a bad `--metrics` address fails the process, not this task.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(metrics);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}
