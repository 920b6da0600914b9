//! Routes shared by every entity type, plus service metadata.
//!
//! Each entity exposes the same four reads: list, current version, version
//! history and one exact version. They are generic over [`Resource`] and
//! registered once per type in the router. Writes with extra rules live in
//! `fleet`, `tasks` and `access`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use strata_core::{
    Cluster, DomainError, Execution, Model, PlaybookConfiguration, Repository, Role, Server, User,
    Versioned,
};
use strata_engine::{AccessRule, RequestContext};
use strata_storage::Page;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use super::error::ApiError;
use super::state::{AppState, PageQuery};

/// An entity type served under `/v1/<MODEL_NAME>/`.
pub(crate) trait Resource: Model {
    fn repository(state: &AppState) -> Repository<Self>;
}

impl Resource for Server {
    fn repository(state: &AppState) -> Repository<Self> {
        state.engine.fleet().servers().clone()
    }
}

impl Resource for Cluster {
    fn repository(state: &AppState) -> Repository<Self> {
        state.engine.fleet().clusters().clone()
    }
}

impl Resource for PlaybookConfiguration {
    fn repository(state: &AppState) -> Repository<Self> {
        state.engine.configurations().clone()
    }
}

impl Resource for Execution {
    fn repository(state: &AppState) -> Repository<Self> {
        state.engine.executions().clone()
    }
}

impl Resource for Role {
    fn repository(state: &AppState) -> Repository<Self> {
        state.roles.clone()
    }
}

impl Resource for User {
    fn repository(state: &AppState) -> Repository<Self> {
        state.users.clone()
    }
}

/// `authenticated` + `api:<action>_<model>`.
pub(crate) fn api_rule(action: &str, model: &str) -> AccessRule {
    AccessRule::authenticated().api(&format!("{action}_{model}"))
}

/// GET /v1/{model}/
pub(crate) async fn list<M: Resource>(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Versioned<M>>>, ApiError> {
    api_rule("view", M::MODEL_NAME).check(&ctx)?;
    let page = M::repository(&state).list(state.pagination(&query)).await?;
    Ok(Json(page))
}

/// GET /v1/{model}/{id}/
pub(crate) async fn get_one<M: Resource>(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<Versioned<M>>, ApiError> {
    api_rule("view", M::MODEL_NAME).check(&ctx)?;
    Ok(Json(M::repository(&state).get(&id).await?))
}

/// GET /v1/{model}/{id}/version/
pub(crate) async fn versions<M: Resource>(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Versioned<M>>>, ApiError> {
    api_rule("view", &format!("{}_versions", M::MODEL_NAME)).check(&ctx)?;
    let repository = M::repository(&state);
    repository.get(&id).await?;
    let page = repository
        .list_versions(&id, state.pagination(&query))
        .await?;
    Ok(Json(page))
}

/// GET /v1/{model}/{id}/version/{n}/
pub(crate) async fn version<M: Resource>(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, number)): Path<(String, i64)>,
) -> Result<Json<Versioned<M>>, ApiError> {
    api_rule("view", &format!("{}_versions", M::MODEL_NAME)).check(&ctx)?;
    M::repository(&state)
        .find_version(&id, number)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::from(DomainError::NotFound {
                model: M::MODEL_NAME.to_string(),
                id: format!("{id} version {number}"),
            })
        })
}

/// Body of every PUT: the version the client last read plus the edited
/// payload.
#[derive(Debug, Deserialize)]
pub(crate) struct UpdateRequest<M> {
    pub(crate) version: i64,
    pub(crate) data: M,
}

/// Build the entity a PUT wants to store: the current envelope carrying
/// the client's version and data, so the store can detect a lost update.
pub(crate) async fn edited<M: Resource>(
    state: &AppState,
    id: &str,
    body: &[u8],
) -> Result<Versioned<M>, ApiError> {
    let request: UpdateRequest<M> = state.schemas.parse("update", body)?;
    let mut entity = M::repository(state).get(id).await?;
    entity.version = request.version;
    entity.data = request.data;
    Ok(entity)
}

/// DELETE /v1/{model}/{id}/ as a plain soft delete.
pub(crate) async fn delete<M: Resource>(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<Versioned<M>>, ApiError> {
    api_rule("delete", M::MODEL_NAME).check(&ctx)?;
    let repository = M::repository(&state);
    let current = repository.get(&id).await?;
    let deleted = repository
        .delete(&current, ctx.initiator_id())
        .await
        .inspect_err(|err| warn!(model = M::MODEL_NAME, %id, error = %err, "cannot delete"))?;
    info!(
        model = M::MODEL_NAME,
        %id,
        version = deleted.version,
        initiator = ctx.initiator_id().unwrap_or("-"),
        "entity deleted"
    );
    Ok(Json(deleted))
}

/// GET /v1/info/ (no authentication)
pub(crate) async fn info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let now = time::OffsetDateTime::now_utc().format(&Rfc3339).ok();
    Json(json!({
        "name": "strata",
        "version": env!("CARGO_PKG_VERSION"),
        "time": now,
        "server_discovery": state.discovery_token().is_some(),
    }))
}

/// GET /v1/playbook/
pub(crate) async fn playbooks(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Value>, ApiError> {
    AccessRule::authenticated().check(&ctx)?;
    let items: Vec<_> = state.engine.registry().iter().collect();
    Ok(Json(json!({ "total": items.len(), "items": items })))
}

/// GET /v1/permission/
pub(crate) async fn permissions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Value>, ApiError> {
    AccessRule::authenticated().check(&ctx)?;
    Ok(Json(json!(state.catalogue.as_map())))
}

/// Fallback handler for unmatched routes.
pub(crate) async fn not_found() -> ApiError {
    ApiError::RouteNotFound
}
