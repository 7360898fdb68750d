//! HTTP router assembly.

pub mod control;
pub mod error;
pub mod openai;

pub use error::ApiError;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::gateway::ws::ws_handler;
use crate::gateway::GatewayState;

/// Request body cap for every surface.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Unauthenticated liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Build the full application router: WS RPC, OpenAI compat, control plane.
pub fn create_router(state: GatewayState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(control::CONTROL_PLANE_HEADER),
        ]);

    let compat_routes = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/responses", post(openai::responses))
        .route("/v1/tools/invoke", post(openai::tools_invoke));

    let control_routes = Router::new()
        .route("/status", get(control::get_status))
        .route(
            "/tenants/{tenant_id}",
            get(control::get_tenant)
                .post(control::create_tenant)
                .delete(control::delete_tenant),
        )
        .route("/tenants/{tenant_id}/backup", post(control::post_backup))
        .route("/tenants/{tenant_id}/restore", post(control::post_restore))
        .route("/tenants/{tenant_id}/backups", get(control::get_backups))
        .route(
            "/tenants/{tenant_id}/backups/{*key}",
            delete(control::delete_backup),
        )
        .fallback(control::not_found);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(compat_routes)
        .nest("/internal/v1", control_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
