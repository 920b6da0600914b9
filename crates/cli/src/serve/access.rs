//! Role and user writes.
//!
//! Role permissions are checked against the permission catalogue on every
//! write. A user may only reference a live role.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use strata_core::{new_id, DomainError, Role, User, Versioned};
use strata_engine::RequestContext;
use tracing::info;

use super::error::ApiError;
use super::handlers::{api_rule, edited};
use super::state::AppState;

#[derive(Debug, Deserialize)]
struct NewRole {
    name: String,
    #[serde(default)]
    permissions: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Deserialize)]
struct NewUser {
    login: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    role_id: Option<String>,
}

async fn check_role_reference(state: &AppState, user: &User) -> Result<(), DomainError> {
    if let Some(role_id) = &user.role_id {
        if state.roles.find_live(role_id).await?.is_none() {
            return Err(DomainError::NotFound {
                model: "role".into(),
                id: role_id.clone(),
            });
        }
    }
    Ok(())
}

/// POST /v1/role/
pub(crate) async fn create_role(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<Role>>, ApiError> {
    api_rule("create", "role").check(&ctx)?;
    let request: NewRole = state.schemas.parse("role_create", &body)?;
    let role = Role {
        name: request.name,
        permissions: request.permissions,
    };
    state.catalogue.validate(&role)?;
    let created = state
        .roles
        .create(new_id(), role, ctx.initiator_id())
        .await?;
    info!(role_id = %created.id, name = %created.data.name, "role created");
    Ok(Json(created))
}

/// PUT /v1/role/{id}/
pub(crate) async fn update_role(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<Role>>, ApiError> {
    api_rule("edit", "role").check(&ctx)?;
    let role = edited::<Role>(&state, &id, &body).await?;
    state.catalogue.validate(&role.data)?;
    let saved = state.roles.save(&role, ctx.initiator_id()).await?;
    info!(
        "role {} updated to version {} by {}",
        saved.id,
        saved.version,
        ctx.initiator_id().unwrap_or("-")
    );
    Ok(Json(saved))
}

/// POST /v1/user/
pub(crate) async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<User>>, ApiError> {
    api_rule("create", "user").check(&ctx)?;
    let request: NewUser = state.schemas.parse("user_create", &body)?;
    let user = User {
        login: request.login,
        email: request.email,
        full_name: request.full_name,
        role_id: request.role_id,
    };
    check_role_reference(&state, &user).await?;
    let created = state
        .users
        .create(new_id(), user, ctx.initiator_id())
        .await?;
    info!(user_id = %created.id, login = %created.data.login, "user created");
    Ok(Json(created))
}

/// PUT /v1/user/{id}/
pub(crate) async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<User>>, ApiError> {
    api_rule("edit", "user").check(&ctx)?;
    let user = edited::<User>(&state, &id, &body).await?;
    check_role_reference(&state, &user.data).await?;
    let saved = state.users.save(&user, ctx.initiator_id()).await?;
    info!(
        "user {} updated to version {} by {}",
        saved.id,
        saved.version,
        ctx.initiator_id().unwrap_or("-")
    );
    Ok(Json(saved))
}
