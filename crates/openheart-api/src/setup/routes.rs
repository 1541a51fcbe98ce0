//! Route configuration and setup

use crate::auth::auth_middleware;
use crate::handlers;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use openheart_core::Config;
use openheart_infra::{request_id_middleware, security_headers_middleware};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router, anyhow::Error> {
    let cors = setup_cors(config)?;
    let auth_state = Arc::new(state.auth_state());

    let protected_routes = protected_routes(state.clone()).layer(
        axum::middleware::from_fn_with_state(auth_state, auth_middleware),
    );

    let app = public_routes(state)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_size_bytes()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    Ok(app)
}

fn public_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/token", post(handlers::auth::request_token))
        .route("/auth/login", post(handlers::auth::login))
        .with_state(state)
}

fn protected_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route(
            "/uploads",
            post(handlers::uploads::upload).delete(handlers::uploads::reset),
        )
        .route("/uploads/check", post(handlers::uploads::check))
        .route("/uploads/transmit", post(handlers::uploads::transmit))
        .route("/uploads/status", get(handlers::uploads::status))
        .route("/uploads/review", get(handlers::uploads::review))
        .route("/uploads/submit", post(handlers::uploads::submit))
        .route("/uploads/finish", post(handlers::uploads::finish))
        .route(
            "/files/{id}/scan-type",
            put(handlers::files::set_scan_type),
        )
        .with_state(state)
}

/// Setup CORS configuration
fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        if config.is_production() {
            tracing::warn!("CORS configured to allow all origins - not recommended for production");
        }
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins = config
            .cors_origins
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
    };
    Ok(cors)
}
