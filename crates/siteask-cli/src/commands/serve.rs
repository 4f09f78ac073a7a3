//! HTTP event stream server

use crate::app::ServeArgs;
use crate::server::{self, AppState};
use anyhow::Result;
use siteask_core::{Coordinator, CorpusStore};
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run(args: ServeArgs, coordinator: Arc<Coordinator>, corpus: Arc<CorpusStore>) -> Result<()> {
    let state = AppState::new(coordinator, corpus);
    let listener = TcpListener::bind(args.addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP server listening.");
    eprintln!("Listening on http://{}", addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutting down.");
    }
}
