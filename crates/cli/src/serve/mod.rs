//! `strata serve` -- the HTTP API.
//!
//! A thin layer over the engine: it resolves the caller, checks the route's
//! access rule, validates the body and maps domain errors to responses.
//!
//! Endpoints (each entity is one of `server`, `cluster`,
//! `playbook_configuration`, `execution`, `role`, `user`):
//! - GET    /v1/info/                          - Service metadata (no auth)
//! - GET    /v1/playbook/                      - Registered playbooks
//! - GET    /v1/permission/                    - Permission catalogue
//! - GET    /v1/{entity}/                      - Paginated list
//! - POST   /v1/{entity}/                      - Create
//! - GET    /v1/{entity}/{id}/                 - Current version
//! - PUT    /v1/{entity}/{id}/                 - Update (`{version, data}`)
//! - DELETE /v1/{entity}/{id}/                 - Soft delete; cancel for executions
//! - GET    /v1/{entity}/{id}/version/         - History, newest first
//! - GET    /v1/{entity}/{id}/version/{n}/     - Exact version
//! - GET    /v1/execution/{id}/steps/          - Steps reported so far
//! - POST   /v1/execution/{id}/steps/          - Runner appends a step
//! - POST   /v1/execution/{id}/result/         - Runner reports the outcome
//! - POST   /v1/runner/claim/                  - Runner takes the next job
//!
//! Errors are `{"code": <status>, "error": <kind>, "message": ...}`.

mod access;
mod error;
mod fleet;
mod handlers;
mod middleware;
mod schema;
mod state;
mod tasks;


use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{delete, get, post, put};
use axum::{middleware as axum_middleware, Router};
use strata_core::{Cluster, Execution, PlaybookConfiguration, Role, Server, User};
use strata_engine::run_dispatcher;
use strata_storage::MemoryStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use self::handlers::{get_one, list, version, versions, Resource};
use self::middleware::authenticate;
use self::state::AppState;
use crate::config::Config;

/// Maximum request body size: 10 MB. Discovery facts can be large.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// The four read routes every entity shares.
fn entity_reads<M: Resource>(router: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    let base = format!("/v1/{}", M::MODEL_NAME);
    router
        .route(&format!("{base}/"), get(list::<M>))
        .route(&format!("{base}/{{id}}/"), get(get_one::<M>))
        .route(&format!("{base}/{{id}}/version/"), get(versions::<M>))
        .route(
            &format!("{base}/{{id}}/version/{{version}}/"),
            get(version::<M>),
        )
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/v1/info/", get(handlers::info))
        .route("/v1/playbook/", get(handlers::playbooks))
        .route("/v1/permission/", get(handlers::permissions));
    app = entity_reads::<Server>(app);
    app = entity_reads::<Cluster>(app);
    app = entity_reads::<PlaybookConfiguration>(app);
    app = entity_reads::<Execution>(app);
    app = entity_reads::<Role>(app);
    app = entity_reads::<User>(app);

    app.route("/v1/server/", post(fleet::create_server))
        .route(
            "/v1/server/{id}/",
            put(fleet::update_server).delete(fleet::delete_server),
        )
        .route("/v1/cluster/", post(fleet::create_cluster))
        .route(
            "/v1/cluster/{id}/",
            put(fleet::update_cluster).delete(fleet::delete_cluster),
        )
        .route(
            "/v1/playbook_configuration/",
            post(tasks::create_playbook_configuration),
        )
        .route(
            "/v1/playbook_configuration/{id}/",
            put(tasks::update_playbook_configuration)
                .delete(handlers::delete::<PlaybookConfiguration>),
        )
        .route("/v1/execution/", post(tasks::create_execution))
        .route(
            "/v1/execution/{id}/",
            delete(tasks::cancel_execution),
        )
        .route(
            "/v1/execution/{id}/steps/",
            get(tasks::list_steps).post(tasks::append_step),
        )
        .route("/v1/execution/{id}/result/", post(tasks::report_result))
        .route("/v1/runner/claim/", post(tasks::claim_job))
        .route("/v1/role/", post(access::create_role))
        .route(
            "/v1/role/{id}/",
            put(access::update_role).delete(handlers::delete::<Role>),
        )
        .route("/v1/user/", post(access::create_user))
        .route(
            "/v1/user/{id}/",
            put(access::update_user).delete(handlers::delete::<User>),
        )
        .fallback(handlers::not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the API server and the execution dispatcher.
pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let (state, queue) = AppState::new(config.clone(), Arc::new(MemoryStore::new()))?;
    state.bootstrap().await?;
    tokio::spawn(run_dispatcher(state.engine.clone(), queue));

    if state.discovery_token().is_some() {
        info!("server discovery token enabled");
    }
    if config.auth.tokens.is_empty() {
        warn!("no API tokens configured; only unauthenticated routes are usable");
    }

    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Strata API listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(err) => warn!(error = %err, "cannot listen for Ctrl+C; shutting down"),
    }
}
