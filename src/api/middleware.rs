//! Request authentication and CORS.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::{ApiError, AppState};
use crate::auth::{token_from_headers, AuthError};

/// Resolves the caller and stores it as a request extension for the
/// [`crate::auth::User`] extractor.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = token_from_headers(request.headers());

    match state.auth.authenticate(token.as_deref()) {
        Ok(user) => {
            tracing::debug!(user_id = %user.id, "Request authenticated");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %request.uri().path(), "Rejected unauthenticated request");
            let message = match e {
                AuthError::MissingToken => "Authentication required",
                AuthError::Expired => "Token expired",
                AuthError::Invalid => "Invalid token",
            };
            ApiError::Unauthorized(message.to_string()).into_response()
        }
    }
}

/// Whether `origin` is a local development origin on any port.
fn is_local_origin(origin: &str) -> bool {
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let host = rest.split(':').next().unwrap_or_default();
    host == "localhost" || host == "127.0.0.1"
}

/// CORS policy: localhost and 127.0.0.1 on any port, plus `extra` origins.
pub fn cors_layer(extra: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin) = origin.to_str() else {
                return false;
            };
            is_local_origin(origin) || extra.iter().any(|o| o == origin)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
