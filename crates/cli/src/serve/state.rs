//! Application state shared across request handlers.

use std::sync::Arc;

use serde::Deserialize;
use strata_core::{DomainError, Repository, Role, User};
use strata_engine::{PermissionCatalogue, PlaybookRegistry, Principal, QueueRunner, TaskEngine};
use strata_storage::{EntityStore, Pagination};
use tokio::sync::mpsc;
use tracing::info;

use super::schema::Schemas;
use crate::config::Config;

/// `?page=&per_page=` on list endpoints.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageQuery {
    pub(crate) page: Option<usize>,
    pub(crate) per_page: Option<usize>,
}

pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) engine: Arc<TaskEngine>,
    /// Jobs waiting for an external worker.
    pub(crate) runner: Arc<QueueRunner>,
    pub(crate) catalogue: PermissionCatalogue,
    pub(crate) roles: Repository<Role>,
    pub(crate) users: Repository<User>,
    pub(crate) schemas: Schemas,
}

impl AppState {
    /// Wire the engine over `store`. The receiver must be handed to
    /// `strata_engine::run_dispatcher`.
    pub(crate) fn new(
        config: Arc<Config>,
        store: Arc<dyn EntityStore>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<String>), String> {
        let registry = Arc::new(PlaybookRegistry::with_defaults());
        let catalogue = PermissionCatalogue::new(registry.ids());
        let runner = Arc::new(QueueRunner::new());
        let (engine, queue) = TaskEngine::new(store.clone(), registry, runner.clone());
        let state = Self {
            config,
            engine: Arc::new(engine),
            runner,
            catalogue,
            roles: Repository::new(store.clone()),
            users: Repository::new(store),
            schemas: Schemas::compile()?,
        };
        Ok((Arc::new(state), queue))
    }

    pub(crate) fn pagination(&self, query: &PageQuery) -> Pagination {
        Pagination::new(
            query.page.unwrap_or(1),
            query
                .per_page
                .unwrap_or(self.config.api.pagination_default_per_page),
        )
    }

    pub(crate) fn discovery_token(&self) -> Option<&str> {
        self.config.api.server_discovery_token.as_deref()
    }

    /// Resolve a bearer token to its live user and that user's role.
    /// Unknown tokens and deleted users resolve to no one.
    pub(crate) async fn principal_for(&self, token: &str) -> Result<Option<Principal>, DomainError> {
        let Some(user_id) = self.config.user_for_token(token) else {
            return Ok(None);
        };
        let Some(user) = self.users.find_live(user_id).await? else {
            return Ok(None);
        };
        let role = match &user.data.role_id {
            Some(role_id) => self.roles.find(role_id).await?,
            None => None,
        };
        Ok(Some(Principal { user, role }))
    }

    /// Create the configured roles and users that do not exist yet.
    pub(crate) async fn bootstrap(&self) -> Result<(), DomainError> {
        for seed in &self.config.roles {
            if self.roles.find(&seed.id).await?.is_some() {
                continue;
            }
            let role = if seed.all_permissions {
                self.catalogue.full_role(&seed.name)
            } else {
                Role {
                    name: seed.name.clone(),
                    permissions: seed.permissions.clone(),
                }
            };
            self.catalogue.validate(&role)?;
            self.roles.create(seed.id.clone(), role, None).await?;
            info!(role_id = %seed.id, "bootstrap role created");
        }
        for seed in &self.config.users {
            if self.users.find(&seed.id).await?.is_some() {
                continue;
            }
            let user = User {
                login: seed.login.clone(),
                email: seed.email.clone(),
                full_name: seed.full_name.clone(),
                role_id: seed.role_id.clone(),
            };
            self.users.create(seed.id.clone(), user, None).await?;
            info!(user_id = %seed.id, "bootstrap user created");
        }
        Ok(())
    }
}
