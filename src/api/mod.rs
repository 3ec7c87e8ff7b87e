mod error;
mod handlers;
mod middleware;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::collab::{SessionConfig, SessionManager};
use crate::db::Database;
use crate::ws;

pub use error::{ApiError, ApiJson};
pub use middleware::cors_layer;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub sessions: SessionManager,
    pub auth: AuthConfig,
}

impl AppState {
    /// Wires a session manager on top of `db`.
    pub fn new(db: Database, auth: AuthConfig, sessions: SessionConfig) -> Self {
        let store = Arc::new(db.clone());
        Self {
            sessions: SessionManager::new(store, sessions),
            db,
            auth,
        }
    }
}

pub fn create_router(state: AppState, cors_origins: Vec<String>) -> Router {
    let api = Router::new()
        // Diagrams
        .route(
            "/diagrams",
            get(handlers::list_diagrams).post(handlers::create_diagram),
        )
        .route("/diagrams/by-lp", post(handlers::create_diagram_for_learning_path))
        .route(
            "/diagrams/by-lp/{lp_id}",
            get(handlers::get_diagram_for_learning_path)
                .patch(handlers::update_diagram_for_learning_path)
                .delete(handlers::delete_diagram_for_learning_path),
        )
        .route(
            "/diagrams/{name}",
            get(handlers::get_diagram).put(handlers::replace_diagram),
        )
        // Learning paths
        .route(
            "/learning-paths",
            get(handlers::list_learning_paths).post(handlers::create_learning_path),
        )
        .route(
            "/learning-paths/{id}",
            get(handlers::get_learning_path)
                .patch(handlers::update_learning_path)
                .delete(handlers::delete_learning_path),
        )
        .route(
            "/learning-paths/{id}/favorite",
            post(handlers::add_favorite).delete(handlers::remove_favorite),
        )
        // Favorites
        .route("/favorites", get(handlers::list_favorites))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .route("/ws/{*document}", get(ws::handler::ws_upgrade))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        )
        .with_state(state)
}
