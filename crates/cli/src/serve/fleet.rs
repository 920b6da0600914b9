//! Server and cluster writes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use strata_core::{Cluster, Execution, Server, Versioned};
use strata_engine::RequestContext;

use super::error::ApiError;
use super::handlers::{api_rule, edited};
use super::state::AppState;

#[derive(Debug, Deserialize)]
struct DiscoveryRequest {
    id: String,
    host: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct NewCluster {
    name: String,
}

/// POST /v1/server/
///
/// Starts discovery of a host. A caller presenting the configured
/// discovery token skips authentication entirely.
pub(crate) async fn create_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<Execution>>, ApiError> {
    api_rule("create", "server")
        .or_token(state.discovery_token())
        .check(&ctx)?;
    let request: DiscoveryRequest = state.schemas.parse("server_discovery", &body)?;
    let execution = state
        .engine
        .request_discovery(
            &request.id,
            &request.host,
            &request.username,
            ctx.initiator_id(),
        )
        .await?;
    Ok(Json(execution))
}

/// PUT /v1/server/{id}/
pub(crate) async fn update_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<Server>>, ApiError> {
    api_rule("edit", "server").check(&ctx)?;
    let server = edited::<Server>(&state, &id, &body).await?;
    let saved = state
        .engine
        .fleet()
        .update_server(&server, ctx.initiator_id())
        .await?;
    Ok(Json(saved))
}

/// DELETE /v1/server/{id}/
pub(crate) async fn delete_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<Versioned<Server>>, ApiError> {
    api_rule("delete", "server").check(&ctx)?;
    let deleted = state
        .engine
        .fleet()
        .delete_server(&id, ctx.initiator_id())
        .await?;
    Ok(Json(deleted))
}

/// POST /v1/cluster/
pub(crate) async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<Cluster>>, ApiError> {
    api_rule("create", "cluster").check(&ctx)?;
    let request: NewCluster = state.schemas.parse("cluster_create", &body)?;
    let cluster = state
        .engine
        .fleet()
        .create_cluster(&request.name, ctx.initiator_id())
        .await?;
    Ok(Json(cluster))
}

/// PUT /v1/cluster/{id}/
pub(crate) async fn update_cluster(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<Cluster>>, ApiError> {
    api_rule("edit", "cluster").check(&ctx)?;
    let cluster = edited::<Cluster>(&state, &id, &body).await?;
    let saved = state
        .engine
        .fleet()
        .update_cluster(&cluster, ctx.initiator_id())
        .await?;
    Ok(Json(saved))
}

/// DELETE /v1/cluster/{id}/
pub(crate) async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<Versioned<Cluster>>, ApiError> {
    api_rule("delete", "cluster").check(&ctx)?;
    let deleted = state
        .engine
        .fleet()
        .delete_cluster(&id, ctx.initiator_id())
        .await?;
    Ok(Json(deleted))
}
