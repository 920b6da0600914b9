//! HTTP middleware: caller identification.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use strata_engine::RequestContext;

use super::error::ApiError;
use super::state::AppState;

/// Resolve the `Authorization` header into a [`RequestContext`] extension.
///
/// The header may carry the token bare or as `Bearer <token>`. No request is
/// rejected here: handlers decide through their access rules whether an
/// anonymous caller may proceed.
pub(crate) async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(token_of)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let principal = match &bearer {
        Some(token) => match state.principal_for(token).await {
            Ok(principal) => principal,
            Err(err) => return ApiError::from(err).into_response(),
        },
        None => None,
    };
    if bearer.is_some() && principal.is_none() {
        tracing::debug!(path = %request.uri().path(), "unrecognized bearer token");
    }

    request
        .extensions_mut()
        .insert(RequestContext { principal, bearer });
    next.run(request).await
}

fn token_of(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header).trim()
}
