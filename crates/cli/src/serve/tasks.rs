//! Playbook configurations, executions and the runner's reporting routes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use strata_core::{Execution, ExecutionStep, PlaybookConfiguration, Versioned};
use strata_engine::{ExecutionOutcome, NewPlaybookConfiguration, NewStep, RequestContext};
use strata_storage::Page;

use super::error::ApiError;
use super::handlers::{api_rule, edited};
use super::schema::from_value;
use super::state::{AppState, PageQuery};

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    playbook_configuration: ConfigurationRef,
}

#[derive(Debug, Deserialize)]
struct ConfigurationRef {
    id: String,
    version: Option<i64>,
}

/// Hints may be sent as a map or as `[{"id": .., "value": ..}]`.
fn normalize_hints(body: &mut Value) {
    let Some(hints) = body.get_mut("hints") else {
        return;
    };
    if let Value::Array(items) = hints {
        let map: Map<String, Value> = items
            .iter()
            .filter_map(|item| {
                let id = item.get("id")?.as_str()?.to_string();
                Some((id, item.get("value").cloned().unwrap_or(Value::Null)))
            })
            .collect();
        *hints = Value::Object(map);
    }
}

/// POST /v1/playbook_configuration/
pub(crate) async fn create_playbook_configuration(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<PlaybookConfiguration>>, ApiError> {
    api_rule("create", "playbook_configuration").check(&ctx)?;
    let mut value = state
        .schemas
        .validate("playbook_configuration_create", &body)?;
    normalize_hints(&mut value);
    let request: NewPlaybookConfiguration = from_value(value)?;
    let created = state
        .engine
        .create_playbook_configuration(&ctx, request)
        .await?;
    Ok(Json(created))
}

/// PUT /v1/playbook_configuration/{id}/
pub(crate) async fn update_playbook_configuration(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<PlaybookConfiguration>>, ApiError> {
    api_rule("edit", "playbook_configuration").check(&ctx)?;
    let configuration = edited::<PlaybookConfiguration>(&state, &id, &body).await?;
    let saved = state
        .engine
        .update_playbook_configuration(&configuration, ctx.initiator_id())
        .await?;
    Ok(Json(saved))
}

/// POST /v1/execution/
pub(crate) async fn create_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<Versioned<Execution>>, ApiError> {
    api_rule("create", "execution").check(&ctx)?;
    let request: LaunchRequest = state.schemas.parse("execution_create", &body)?;
    let execution = state
        .engine
        .launch_execution(
            &ctx,
            &request.playbook_configuration.id,
            request.playbook_configuration.version,
        )
        .await?;
    Ok(Json(execution))
}

/// DELETE /v1/execution/{id}/ requests cancellation; the record stays.
pub(crate) async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<Versioned<Execution>>, ApiError> {
    api_rule("delete", "execution").check(&ctx)?;
    let execution = state
        .engine
        .cancel_execution(&id, ctx.initiator_id())
        .await?;
    Ok(Json(execution))
}

/// GET /v1/execution/{id}/steps/
pub(crate) async fn list_steps(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Versioned<ExecutionStep>>>, ApiError> {
    api_rule("view", "execution_steps").check(&ctx)?;
    let steps = state
        .engine
        .list_steps(&id, state.pagination(&query))
        .await?;
    Ok(Json(steps))
}

/// POST /v1/execution/{id}/steps/ (runner)
pub(crate) async fn append_step(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<ExecutionStep>>, ApiError> {
    api_rule("edit", "execution").check(&ctx)?;
    let step: NewStep = state.schemas.parse("execution_step", &body)?;
    let step = state
        .engine
        .append_step(&id, step, ctx.initiator_id())
        .await?;
    Ok(Json(step))
}

/// POST /v1/execution/{id}/result/ (runner)
pub(crate) async fn report_result(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Versioned<Execution>>, ApiError> {
    api_rule("edit", "execution").check(&ctx)?;
    let outcome: ExecutionOutcome = state.schemas.parse("execution_result", &body)?;
    let execution = state
        .engine
        .complete_execution(&id, outcome, ctx.initiator_id())
        .await?;
    Ok(Json(execution))
}

/// POST /v1/runner/claim/
///
/// Hands the oldest pending job to a worker; `{"job": null}` when idle.
pub(crate) async fn claim_job(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Value>, ApiError> {
    api_rule("edit", "execution").check(&ctx)?;
    let job = state.runner.claim().await;
    Ok(Json(json!({ "job": job })))
}
