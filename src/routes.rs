// routes.rs
use std::sync::Arc;

use axum::{routing::get, Router};
use http::Method;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
};

use crate::config::Config;
use crate::coordinator::CoordinatorHandle;
use crate::handlers;
use crate::store::PollStore;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub store: Arc<dyn PollStore>,
    pub config: Arc<Config>,
}

pub fn create_routes(state: AppState) -> Router {
    let static_dir = &state.config.static_dir;
    let client_bundle =
        ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html")));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/active-poll", get(handlers::active_poll))
        .route("/api/poll-history", get(handlers::poll_history))
        .route("/api/socket", get(handlers::socket))
        .fallback_service(client_bundle)
        .layer(cors)
        .with_state(state)
}
