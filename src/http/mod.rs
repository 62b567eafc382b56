//! Public HTTP face of the Event Bus: REST endpoints for session lifecycle
//! plus an SSE stream per session. Grounded on the daemon's `rest/mod.rs`
//! router and `rest/sse.rs` bridge, narrowed to the one resource this crate
//! actually owns — sessions — instead of the daemon's full task/memory/
//! metrics surface.

pub mod routes;
pub mod sse;

use crate::AppContext;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = ctx.config.bind_addr.parse()?;
    let router = build_router(ctx);
    info!(%addr, "event bus HTTP face listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route("/sessions/:id", get(routes::get_session))
        .route("/sessions/:id/messages", post(routes::send_message))
        .route("/sessions/:id/cancel", post(routes::cancel_session))
        .route("/sessions/:id/interrupt", post(routes::interrupt_session))
        .route("/sessions/:id/approvals", post(routes::resolve_approval))
        .route("/sessions/:id/questions", post(routes::answer_question))
        .route(
            "/sessions/:id/permission-mode",
            post(routes::set_permission_mode),
        )
        .route("/sessions/:id/model", post(routes::set_model))
        .route("/sessions/:id/events", get(sse::session_events_sse))
        .with_state(ctx)
}
