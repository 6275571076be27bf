pub mod admin;
pub mod handlers;
pub mod listeners;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiType;
use crate::gateway::Gateway;

pub use listeners::ListenerManager;

/// Per-listener state: which dialect this port speaks.
#[derive(Clone)]
pub struct DialectState {
    pub gateway: Arc<Gateway>,
    pub api_type: ApiType,
}

/// App served on one dialect port. Every path is proxied; the dialect decides
/// which of them are completions.
pub fn dialect_app(gateway: Arc<Gateway>, api_type: ApiType) -> Router {
    let max_body = gateway.settings().gateway.max_body_bytes;
    Router::new()
        .fallback(handlers::proxy)
        .with_state(DialectState { gateway, api_type })
        .layer(DefaultBodyLimit::max(max_body))
        // 本地客户端（浏览器插件、桌面应用）直接调用，放开跨域
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Management API served on the admin port.
pub fn admin_app(gateway: Arc<Gateway>) -> Router {
    admin::routes()
        .with_state(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
