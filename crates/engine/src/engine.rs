//! The task engine.
//!
//! Turns validated intents into tracked executions and drives them through
//!
//! ```text
//! created -> queued -> running -> completed | failed
//! ```
//!
//! with `cancelled` reachable from every non-terminal state. Each
//! transition is a compare-and-swap on the execution's version that
//! re-checks the current state, so two concurrent completions can never
//! both apply and no transition moves backwards.
//!
//! Launching only persists the execution in `created` and hands its id to
//! the dispatcher ([`run_dispatcher`]), which plans it, marks it running and
//! starts it on the [`PlaybookRunner`]. Callers never wait for a run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::topology::deployment_plan;
use strata_core::{
    new_id, DomainError, Execution, ExecutionResult, ExecutionState, ExecutionStep, Facts, Model,
    PlaybookConfiguration, Repository, Server, StepResult, TaskKind, TaskTarget, Versioned,
};
use strata_storage::{unix_now, EntityStore, Page, Pagination, RecordFilter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fleet::Fleet;
use crate::playbook::{MembershipEffect, PlaybookRegistry};
use crate::policy::{authorize, RequestContext};
use crate::runner::{PlaybookRunner, RunnerJob, RunnerWork};

/// Compare-and-swap attempts for one transition before giving up. Retries
/// only happen when another writer bumped the version and the current
/// state still permits the transition.
const MAX_TRANSITION_ATTEMPTS: usize = 8;

/// Request to create a playbook configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPlaybookConfiguration {
    pub name: String,
    pub playbook_id: String,
    pub cluster_id: String,
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub hints: BTreeMap<String, Value>,
    /// Launch an execution right away.
    #[serde(default)]
    pub run: bool,
}

/// Terminal report from the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub state: ExecutionState,
    #[serde(default)]
    pub reason: Option<String>,
    /// For discovery runs: `{"facts": {...}}`.
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStep {
    pub name: String,
    #[serde(default)]
    pub server_id: Option<String>,
    pub result: StepResult,
    #[serde(default)]
    pub error: Option<String>,
    pub time_started: i64,
    pub time_finished: i64,
}

enum CancelPath {
    Finalized,
    Requested,
}

pub struct TaskEngine {
    fleet: Fleet,
    configurations: Repository<PlaybookConfiguration>,
    executions: Repository<Execution>,
    steps: Repository<ExecutionStep>,
    registry: Arc<PlaybookRegistry>,
    runner: Arc<dyn PlaybookRunner>,
    dispatch: mpsc::UnboundedSender<String>,
}

impl TaskEngine {
    /// Build an engine. The returned receiver feeds [`run_dispatcher`];
    /// until it is drained, launched executions stay `created`.
    pub fn new(
        store: Arc<dyn EntityStore>,
        registry: Arc<PlaybookRegistry>,
        runner: Arc<dyn PlaybookRunner>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (dispatch, queue) = mpsc::unbounded_channel();
        let engine = Self {
            fleet: Fleet::new(store.clone()),
            configurations: Repository::new(store.clone()),
            executions: Repository::new(store.clone()),
            steps: Repository::new(store),
            registry,
            runner,
            dispatch,
        };
        (engine, queue)
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn configurations(&self) -> &Repository<PlaybookConfiguration> {
        &self.configurations
    }

    pub fn executions(&self) -> &Repository<Execution> {
        &self.executions
    }

    pub fn registry(&self) -> &PlaybookRegistry {
        &self.registry
    }

    // ── Playbook configurations ─────────────────────────────────────

    /// Admit and persist a playbook configuration.
    ///
    /// Checks run in a fixed order and nothing is written until all pass:
    /// the cluster is live, the playbook is registered, the server list
    /// satisfies the playbook's requirements and membership policy, the
    /// hints are valid, and (when `run` is set) the caller may run this
    /// particular playbook.
    pub async fn create_playbook_configuration(
        &self,
        ctx: &RequestContext,
        request: NewPlaybookConfiguration,
    ) -> Result<Versioned<PlaybookConfiguration>, DomainError> {
        let initiator = ctx.initiator_id();
        let data = self.admit(ctx, request.clone()).await.inspect_err(|err| {
            warn!(
                playbook_id = %request.playbook_id,
                cluster_id = %request.cluster_id,
                error = %err,
                "playbook configuration rejected"
            );
        })?;

        let created = self.configurations.create(new_id(), data, initiator).await?;
        info!(
            configuration_id = %created.id,
            playbook_id = %created.data.playbook_id,
            initiator = initiator.unwrap_or("-"),
            "playbook configuration created"
        );
        if !request.run {
            return Ok(created);
        }

        let execution = self.create_execution(&created, initiator).await?;
        let mut linked = created;
        linked.data.created_execution_id = Some(execution.id);
        self.configurations.save(&linked, initiator).await
    }

    async fn admit(
        &self,
        ctx: &RequestContext,
        request: NewPlaybookConfiguration,
    ) -> Result<PlaybookConfiguration, DomainError> {
        let cluster = self.fleet.live_cluster(&request.cluster_id).await?;
        let playbook = self.registry.get(&request.playbook_id)?;

        if playbook.required_server_list && request.server_ids.is_empty() {
            return Err(DomainError::ServerListIsRequiredForPlaybook(
                playbook.id.clone(),
            ));
        }
        let servers = self.fleet.load_servers(&request.server_ids).await?;
        playbook.server_list_policy.check(&cluster.id, &servers)?;
        let hints = playbook.resolve_hints(&request.hints)?;

        if request.run {
            authorize(ctx, "playbook", &playbook.id)?;
        }

        let configuration = playbook.build_configuration(&cluster.data.name, &servers, &hints)?;
        Ok(PlaybookConfiguration {
            name: request.name,
            playbook_id: playbook.id.clone(),
            cluster_id: cluster.id,
            server_ids: request.server_ids,
            hints,
            configuration,
            created_execution_id: None,
        })
    }

    /// Save an edited configuration; only `name` and `configuration` may
    /// differ from the stored version.
    pub async fn update_playbook_configuration(
        &self,
        edited: &Versioned<PlaybookConfiguration>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<PlaybookConfiguration>, DomainError> {
        let current = self.configurations.get(&edited.id).await?;
        if current.is_deleted() {
            warn!(configuration_id = %edited.id, "cannot update deleted playbook configuration");
            return Err(DomainError::CannotUpdateDeletedModel {
                model: current.model,
                id: current.id,
            });
        }
        current.data.check_editable(&edited.data)?;
        let saved = self.configurations.save(edited, initiator_id).await?;
        info!(
            configuration_id = %saved.id,
            version = saved.version,
            initiator = initiator_id.unwrap_or("-"),
            "playbook configuration updated"
        );
        Ok(saved)
    }

    // ── Executions ──────────────────────────────────────────────────

    /// Launch a run of a configuration, pinned to `version` or to the
    /// current version. Requires the playbook-scoped permission.
    pub async fn launch_execution(
        &self,
        ctx: &RequestContext,
        configuration_id: &str,
        version: Option<i64>,
    ) -> Result<Versioned<Execution>, DomainError> {
        let current = self
            .configurations
            .find_live(configuration_id)
            .await?
            .ok_or_else(|| DomainError::NotFound {
                model: "playbook_configuration".into(),
                id: configuration_id.to_string(),
            })?;
        let pinned = match version {
            Some(v) if v != current.version => self
                .configurations
                .find_version(configuration_id, v)
                .await?
                .ok_or_else(|| DomainError::NotFound {
                    model: "playbook_configuration".into(),
                    id: format!("{configuration_id}@{v}"),
                })?,
            _ => current,
        };
        self.registry.get(&pinned.data.playbook_id)?;
        authorize(ctx, "playbook", &pinned.data.playbook_id)?;
        self.create_execution(&pinned, ctx.initiator_id()).await
    }

    async fn create_execution(
        &self,
        configuration: &Versioned<PlaybookConfiguration>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        let execution = self
            .executions
            .create(
                new_id(),
                Execution::playbook_run(&configuration.id, configuration.version),
                initiator_id,
            )
            .await?;
        info!(
            execution_id = %execution.id,
            configuration_id = %configuration.id,
            configuration_version = configuration.version,
            "execution created"
        );
        self.submit(&execution.id);
        Ok(execution)
    }

    /// Start discovery of a host announcing itself. The server entity is
    /// created when the runner reports the collected facts.
    pub async fn request_discovery(
        &self,
        server_id: &str,
        host: &str,
        username: &str,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        if self.fleet.servers().find(server_id).await?.is_some() {
            return Err(DomainError::UniqueConstraintViolation {
                model: "server".into(),
                key: server_id.to_string(),
            });
        }
        let execution = self
            .executions
            .create(
                new_id(),
                Execution::discovery(server_id, host, username),
                initiator_id,
            )
            .await?;
        info!(
            execution_id = %execution.id,
            server_id,
            "created task for server discovery of {username}@{host}"
        );
        self.submit(&execution.id);
        Ok(execution)
    }

    fn submit(&self, execution_id: &str) {
        if self.dispatch.send(execution_id.to_string()).is_err() {
            debug!(execution_id, "dispatcher not running; execution stays created");
        }
    }

    /// Move a created execution to the runner: `created -> queued`, plan,
    /// `queued -> running`, start. Planning or hand-off failures end in
    /// `failed` with the reason. An execution cancelled meanwhile is left
    /// alone.
    pub async fn dispatch(&self, execution_id: &str) -> Result<Versioned<Execution>, DomainError> {
        let queued = match self
            .transition(execution_id, ExecutionState::Queued, None, |_| {})
            .await
        {
            Ok(queued) => queued,
            Err(DomainError::InvalidTransition { .. }) => {
                debug!(execution_id, "execution moved on before dispatch");
                return self.executions.get(execution_id).await;
            }
            Err(err) => return Err(err),
        };

        let work = match self.plan(&queued).await {
            Ok(work) => work,
            Err(err) => {
                warn!(execution_id, error = %err, "cannot plan execution");
                return self
                    .finish(execution_id, ExecutionState::Failed, Some(err.to_string()), Value::Null, None)
                    .await;
            }
        };

        let plan = match &work {
            RunnerWork::PlaybookRun { plan, .. } => plan.clone(),
            RunnerWork::Discovery { .. } => None,
        };
        let running = match self
            .transition(execution_id, ExecutionState::Running, None, |e| {
                e.plan = plan.clone()
            })
            .await
        {
            Ok(running) => running,
            Err(DomainError::InvalidTransition { .. }) => {
                debug!(execution_id, "execution cancelled while planning");
                return self.executions.get(execution_id).await;
            }
            Err(err) => return Err(err),
        };

        let job = RunnerJob {
            execution_id: execution_id.to_string(),
            work,
        };
        if let Err(err) = self.runner.start(job).await {
            warn!(execution_id, error = %err, "runner refused execution");
            return self
                .finish(execution_id, ExecutionState::Failed, Some(err.to_string()), Value::Null, None)
                .await;
        }
        Ok(running)
    }

    async fn plan(&self, execution: &Versioned<Execution>) -> Result<RunnerWork, DomainError> {
        match &execution.data.target {
            TaskTarget::PlaybookConfiguration { id, version } => {
                let configuration = self
                    .configurations
                    .find_version(id, *version)
                    .await?
                    .ok_or_else(|| DomainError::NotFound {
                        model: "playbook_configuration".into(),
                        id: id.clone(),
                    })?;
                let servers = self.fleet.load_servers(&configuration.data.server_ids).await?;
                let plan = if servers.is_empty() {
                    None
                } else {
                    Some(deployment_plan(&servers)?)
                };
                Ok(RunnerWork::PlaybookRun {
                    playbook_id: configuration.data.playbook_id,
                    configuration: configuration.data.configuration,
                    plan,
                })
            }
            TaskTarget::Server {
                server_id,
                host,
                username,
            } => Ok(RunnerWork::Discovery {
                server_id: server_id.clone(),
                host: host.clone(),
                username: username.clone(),
            }),
        }
    }

    /// Record the runner's terminal report.
    ///
    /// A completed discovery creates the server from the reported facts
    /// once the execution is completed; a server id taken by then fails the
    /// execution instead. A completed playbook run applies the playbook's
    /// membership effect.
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        let current = self.executions.get(execution_id).await?;
        if !outcome.state.is_terminal() || !current.data.state.can_transition_to(outcome.state) {
            return Err(DomainError::InvalidTransition {
                id: execution_id.to_string(),
                from: current.data.state.to_string(),
                to: outcome.state.to_string(),
            });
        }

        if outcome.state == ExecutionState::Completed {
            if let TaskTarget::Server {
                server_id,
                host,
                username,
            } = &current.data.target
            {
                return self
                    .complete_discovery(execution_id, server_id, host, username, outcome, initiator_id)
                    .await;
            }
        }

        let finished = self
            .finish(execution_id, outcome.state, outcome.reason, outcome.payload, initiator_id)
            .await?;

        if finished.data.state == ExecutionState::Completed
            && finished.data.kind == TaskKind::PlaybookRun
        {
            if let Err(err) = self.apply_membership(&finished, initiator_id).await {
                warn!(execution_id, error = %err, "cannot update cluster membership after run");
            }
        }
        Ok(finished)
    }

    /// The terminal transition is written before the server, so a discovery
    /// cancelled in the meantime never leaves a server behind.
    async fn complete_discovery(
        &self,
        execution_id: &str,
        server_id: &str,
        host: &str,
        username: &str,
        outcome: ExecutionOutcome,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        let (state, reason) = match self.fleet.servers().find(server_id).await? {
            Some(_) => {
                let err = DomainError::UniqueConstraintViolation {
                    model: Server::MODEL_NAME.to_string(),
                    key: server_id.to_string(),
                };
                warn!(execution_id, server_id, error = %err, "cannot register discovered server");
                (ExecutionState::Failed, Some(err.to_string()))
            }
            None => (ExecutionState::Completed, outcome.reason),
        };
        let server = discovered_server(host, username, &outcome.payload);
        let finished = self
            .finish(execution_id, state, reason, outcome.payload, initiator_id)
            .await?;
        if finished.data.state != ExecutionState::Completed {
            return Ok(finished);
        }

        match self
            .fleet
            .servers()
            .create(server_id.to_string(), server, initiator_id)
            .await
        {
            Ok(server) => {
                info!(server_id, fqdn = %server.data.fqdn, ip = %server.data.ip, "server discovered")
            }
            Err(err) => {
                warn!(execution_id, server_id, error = %err, "cannot register discovered server")
            }
        }
        Ok(finished)
    }

    async fn apply_membership(
        &self,
        execution: &Versioned<Execution>,
        initiator_id: Option<&str>,
    ) -> Result<(), DomainError> {
        let TaskTarget::PlaybookConfiguration { id, version } = &execution.data.target else {
            return Ok(());
        };
        let Some(configuration) = self.configurations.find_version(id, *version).await? else {
            return Ok(());
        };
        let configuration = configuration.data;
        let playbook = self.registry.get(&configuration.playbook_id)?;
        let cluster_id = &configuration.cluster_id;

        match playbook.membership_effect {
            MembershipEffect::None => {}
            MembershipEffect::AddServers if !configuration.server_ids.is_empty() => {
                self.fleet
                    .add_servers(cluster_id, &configuration.server_ids, initiator_id)
                    .await?;
            }
            MembershipEffect::RemoveServers if !configuration.server_ids.is_empty() => {
                self.fleet
                    .remove_servers(cluster_id, &configuration.server_ids, initiator_id)
                    .await?;
            }
            MembershipEffect::RemoveAll => {
                let cluster = self.fleet.live_cluster(cluster_id).await?;
                let members: Vec<String> = cluster.data.server_ids().map(str::to_string).collect();
                if !members.is_empty() {
                    self.fleet
                        .remove_servers(cluster_id, &members, initiator_id)
                        .await?;
                }
            }
            MembershipEffect::AddServers | MembershipEffect::RemoveServers => {}
        }
        Ok(())
    }

    /// Request cancellation.
    ///
    /// `created` and `queued` executions are not owned by the runner yet and
    /// become `cancelled` at once. A `running` one is flagged; the runner
    /// observes the flag and reports `cancelled` itself, unless it had not
    /// picked the job up, in which case the job is withdrawn and finalized
    /// here. Terminal executions are refused.
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        let (saved, path) = self
            .mutate_execution(execution_id, initiator_id, |exec| match exec.state {
                ExecutionState::Created | ExecutionState::Queued => {
                    exec.state = ExecutionState::Cancelled;
                    exec.result = Some(ExecutionResult {
                        reason: Some("cancelled before start".into()),
                        payload: Value::Null,
                        time_finished: unix_now(),
                    });
                    Ok(CancelPath::Finalized)
                }
                ExecutionState::Running => {
                    exec.cancel_requested = true;
                    Ok(CancelPath::Requested)
                }
                terminal => Err(DomainError::InvalidTransition {
                    id: execution_id.to_string(),
                    from: terminal.to_string(),
                    to: ExecutionState::Cancelled.to_string(),
                }),
            })
            .await
            .inspect_err(|err| warn!(execution_id, error = %err, "cannot cancel execution"))?;

        match path {
            CancelPath::Finalized => {
                info!(execution_id, "execution cancelled");
                Ok(saved)
            }
            CancelPath::Requested => {
                info!(execution_id, "execution cancellation requested");
                if self.runner.cancel(execution_id).await? {
                    return self
                        .finish(
                            execution_id,
                            ExecutionState::Cancelled,
                            Some("withdrawn before the runner started".into()),
                            Value::Null,
                            initiator_id,
                        )
                        .await;
                }
                Ok(saved)
            }
        }
    }

    /// Polled by the runner at its checkpoints.
    pub async fn is_cancel_requested(&self, execution_id: &str) -> Result<bool, DomainError> {
        let execution = self.executions.get(execution_id).await?;
        Ok(execution.data.cancel_requested || execution.data.state == ExecutionState::Cancelled)
    }

    pub async fn append_step(
        &self,
        execution_id: &str,
        step: NewStep,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<ExecutionStep>, DomainError> {
        self.executions.get(execution_id).await?;
        let step = ExecutionStep {
            execution_id: execution_id.to_string(),
            name: step.name,
            server_id: step.server_id,
            result: step.result,
            error: step.error,
            time_started: step.time_started,
            time_finished: step.time_finished,
        };
        self.steps.create(new_id(), step, initiator_id).await
    }

    pub async fn list_steps(
        &self,
        execution_id: &str,
        pagination: Pagination,
    ) -> Result<Page<Versioned<ExecutionStep>>, DomainError> {
        self.executions.get(execution_id).await?;
        self.steps
            .list_where(&RecordFilter::field_eq("execution_id", execution_id), pagination)
            .await
    }

    // ── State machine plumbing ──────────────────────────────────────

    async fn finish(
        &self,
        execution_id: &str,
        state: ExecutionState,
        reason: Option<String>,
        payload: Value,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Execution>, DomainError> {
        self.transition(execution_id, state, initiator_id, |exec| {
            exec.result = Some(ExecutionResult {
                reason: reason.clone(),
                payload: payload.clone(),
                time_finished: unix_now(),
            });
        })
        .await
    }

    async fn transition<F>(
        &self,
        execution_id: &str,
        to: ExecutionState,
        initiator_id: Option<&str>,
        mut update: F,
    ) -> Result<Versioned<Execution>, DomainError>
    where
        F: FnMut(&mut Execution) + Send,
    {
        let (saved, from) = self
            .mutate_execution(execution_id, initiator_id, |exec| {
                let from = exec.state;
                if !from.can_transition_to(to) {
                    return Err(DomainError::InvalidTransition {
                        id: execution_id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                exec.state = to;
                update(exec);
                Ok(from)
            })
            .await?;
        info!(
            execution_id,
            %from,
            %to,
            version = saved.version,
            "execution state changed"
        );
        Ok(saved)
    }

    /// Read-modify-write with optimistic retry. `apply` sees the freshest
    /// state on every attempt and may refuse by returning an error.
    async fn mutate_execution<T, F>(
        &self,
        execution_id: &str,
        initiator_id: Option<&str>,
        mut apply: F,
    ) -> Result<(Versioned<Execution>, T), DomainError>
    where
        F: FnMut(&mut Execution) -> Result<T, DomainError> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let mut next = self.executions.get(execution_id).await?;
            let out = apply(&mut next.data)?;
            match self.executions.save(&next, initiator_id).await {
                Ok(saved) => return Ok((saved, out)),
                Err(err @ DomainError::OutdatedVersion { .. })
                    if attempt < MAX_TRANSITION_ATTEMPTS =>
                {
                    debug!(execution_id, attempt, error = %err, "execution changed concurrently");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Server record built from a discovery report. Falls back to the announced
/// host when the facts carry no node name or default address.
fn discovered_server(host: &str, username: &str, payload: &Value) -> Server {
    let facts = Facts::from_value(payload.get("facts").cloned().unwrap_or(Value::Null));
    let fqdn = facts.nodename().unwrap_or(host).to_string();
    let ip = facts.default_ipv4_address().unwrap_or(host).to_string();
    Server::discovered(&fqdn, &ip, username, facts)
}

/// Drain launched executions and dispatch them one by one.
pub async fn run_dispatcher(engine: Arc<TaskEngine>, mut queue: mpsc::UnboundedReceiver<String>) {
    info!("execution dispatcher started");
    while let Some(execution_id) = queue.recv().await {
        if let Err(err) = engine.dispatch(&execution_id).await {
            warn!(%execution_id, error = %err, "dispatch failed");
        }
    }
    debug!("execution dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests::{seed_server, Interleaving, InterleavingStore};
    use crate::playbook::{PlaybookDescriptor, ServerListPolicy};
    use crate::policy::tests::principal_with;
    use crate::runner::QueueRunner;
    use serde_json::json;
    use strata_core::Cluster;
    use strata_storage::MemoryStore;

    struct Harness {
        engine: Arc<TaskEngine>,
        runner: Arc<QueueRunner>,
        cluster: Versioned<Cluster>,
        _queue: mpsc::UnboundedReceiver<String>,
    }

    fn facts(public: &str, private: &str) -> Value {
        json!({
            "ansible_nodename": format!("node-{public}"),
            "ansible_interfaces": ["eth0", "eth1"],
            "ansible_all_ipv4_addresses": [public, private],
            "ansible_default_ipv4": {"address": public},
            "ansible_eth0": {
                "device": "eth0", "active": true, "type": "ether",
                "ipv4": {"address": public, "network": "192.168.0.0", "netmask": "255.255.255.0"}
            },
            "ansible_eth1": {
                "device": "eth1", "active": true, "type": "ether",
                "ipv4": {"address": private, "network": "10.0.1.0", "netmask": "255.255.255.0"}
            }
        })
    }

    async fn harness_with(registry: PlaybookRegistry) -> Harness {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let runner = Arc::new(QueueRunner::new());
        let (engine, queue) = TaskEngine::new(store, Arc::new(registry), runner.clone());
        let engine = Arc::new(engine);
        for (id, public, private) in [
            ("s1", "192.168.0.11", "10.0.1.11"),
            ("s2", "192.168.0.12", "10.0.1.12"),
        ] {
            engine
                .fleet()
                .servers()
                .create(
                    id.into(),
                    Server::discovered(
                        &format!("{id}.example.com"),
                        public,
                        "ansible",
                        Facts::from_value(facts(public, private)),
                    ),
                    None,
                )
                .await
                .unwrap();
        }
        let cluster = engine.fleet().create_cluster("ceph", None).await.unwrap();
        Harness {
            engine,
            runner,
            cluster,
            _queue: queue,
        }
    }

    async fn harness() -> Harness {
        harness_with(PlaybookRegistry::with_defaults()).await
    }

    fn admin() -> RequestContext {
        RequestContext::authenticated(principal_with(&[("api", &["create_playbook_configuration"])]))
    }

    fn runner_ctx() -> RequestContext {
        RequestContext::authenticated(principal_with(&[
            ("api", &["create_playbook_configuration"]),
            ("playbook", &["cluster_deploy", "add_osd", "purge_cluster"]),
        ]))
    }

    fn request(h: &Harness, playbook_id: &str, servers: &[&str]) -> NewPlaybookConfiguration {
        NewPlaybookConfiguration {
            name: format!("{playbook_id}-config"),
            playbook_id: playbook_id.into(),
            cluster_id: h.cluster.id.clone(),
            server_ids: servers.iter().map(|s| s.to_string()).collect(),
            hints: BTreeMap::new(),
            run: false,
        }
    }

    async fn configuration_count(h: &Harness) -> usize {
        h.engine
            .configurations()
            .list(Pagination::default())
            .await
            .unwrap()
            .total
    }

    async fn running_execution(h: &Harness) -> Versioned<Execution> {
        let mut req = request(h, "cluster_deploy", &["s1", "s2"]);
        req.run = true;
        let config = h
            .engine
            .create_playbook_configuration(&runner_ctx(), req)
            .await
            .unwrap();
        let execution_id = config.data.created_execution_id.unwrap();
        h.engine.dispatch(&execution_id).await.unwrap()
    }

    // -- admission --

    #[tokio::test]
    async fn configuration_is_generated_from_topology() {
        let h = harness().await;
        let created = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1", "s2"]))
            .await
            .unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.data.created_execution_id, None);
        let vars = &created.data.configuration["global_vars"];
        assert_eq!(vars["cluster"], "ceph");
        assert_eq!(vars["public_network"], "192.168.0.0/24");
        assert_eq!(vars["cluster_network"], "10.0.1.0/24");
        assert_eq!(vars["dmcrypt"], false);
        assert_eq!(
            created.data.configuration["inventory"]["s2"]["monitor_address"],
            "192.168.0.12"
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_checked_first() {
        let h = harness().await;
        let mut req = request(&h, "no_such_playbook", &[]);
        req.cluster_id = "ghost".into();
        let err = h
            .engine
            .create_playbook_configuration(&admin(), req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownClusterError");
    }

    #[tokio::test]
    async fn deleted_cluster_is_unknown() {
        let h = harness().await;
        h.engine
            .fleet()
            .delete_cluster(&h.cluster.id, None)
            .await
            .unwrap();
        let err = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownClusterError");
    }

    #[tokio::test]
    async fn unknown_playbook() {
        let h = harness().await;
        let err = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "no_such_playbook", &["s1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownPlaybookError");
    }

    fn hello(required_server_list: bool) -> PlaybookRegistry {
        let mut registry = PlaybookRegistry::new();
        registry.register(PlaybookDescriptor {
            id: "hello".into(),
            name: "Hello".into(),
            description: String::new(),
            required_server_list,
            server_list_policy: ServerListPolicy::AnyServer,
            membership_effect: MembershipEffect::None,
            hints: Vec::new(),
        });
        registry
    }

    #[tokio::test]
    async fn empty_server_list_follows_required_flag() {
        let h = harness_with(hello(true)).await;
        let err = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "hello", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ServerListIsRequiredForPlaybookError");
        assert_eq!(configuration_count(&h).await, 0);

        let h = harness_with(hello(false)).await;
        let created = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "hello", &[]))
            .await
            .unwrap();
        assert_eq!(created.data.configuration["inventory"], json!({}));
    }

    #[tokio::test]
    async fn membership_policy_rejects_whole_request() {
        let h = harness().await;
        h.engine
            .fleet()
            .add_servers(&h.cluster.id, &["s1".into()], None)
            .await
            .unwrap();
        let err = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "add_osd", &["s1", "s2"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::PolicyViolation {
                policy: "not_in_any_cluster".into(),
                servers: vec!["s1".into()],
            }
        );
        assert_eq!(configuration_count(&h).await, 0);
    }

    #[tokio::test]
    async fn unknown_servers_fail_admission() {
        let h = harness().await;
        let err = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1", "s9"]))
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::UnknownServers(vec!["s9".into()]));
    }

    #[tokio::test]
    async fn run_requires_scoped_permission() {
        let h = harness().await;
        let mut req = request(&h, "cluster_deploy", &["s1", "s2"]);
        req.run = true;

        let err = h
            .engine
            .create_playbook_configuration(&admin(), req.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AuthorizationDenied");
        assert_eq!(configuration_count(&h).await, 0);

        let created = h
            .engine
            .create_playbook_configuration(&runner_ctx(), req)
            .await
            .unwrap();
        assert_eq!(created.version, 2);
        let execution_id = created.data.created_execution_id.unwrap();
        let execution = h.engine.executions().get(&execution_id).await.unwrap();
        assert_eq!(execution.data.state, ExecutionState::Created);
        assert_eq!(
            execution.data.target,
            TaskTarget::PlaybookConfiguration {
                id: created.id.clone(),
                version: 1
            }
        );
    }

    #[tokio::test]
    async fn anonymous_run_is_unauthenticated() {
        let h = harness().await;
        let mut req = request(&h, "cluster_deploy", &["s1"]);
        req.run = true;
        let err = h
            .engine
            .create_playbook_configuration(&RequestContext::anonymous(), req)
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::AuthenticationRequired);
    }

    #[tokio::test]
    async fn configuration_update_keeps_identity_fields() {
        let h = harness().await;
        let created = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1"]))
            .await
            .unwrap();

        let mut edited = created.clone();
        edited.data.name = "renamed".into();
        edited.data.configuration["global_vars"]["dmcrypt"] = json!(true);
        let saved = h
            .engine
            .update_playbook_configuration(&edited, Some("u1"))
            .await
            .unwrap();
        assert_eq!(saved.version, 2);

        let mut sneaky = saved.clone();
        sneaky.data.server_ids.push("s2".into());
        let err = h
            .engine
            .update_playbook_configuration(&sneaky, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CannotUpdateImmutableField");

        let err = h
            .engine
            .update_playbook_configuration(&edited, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "OutdatedVersionError");
    }

    // -- execution lifecycle --

    #[tokio::test]
    async fn dispatch_plans_and_hands_off() {
        let h = harness().await;
        let running = running_execution(&h).await;
        assert_eq!(running.data.state, ExecutionState::Running);
        let plan = running.data.plan.clone().unwrap();
        assert_eq!(plan.cluster_network.to_string(), "10.0.1.0/24");
        assert_eq!(plan.hosts.len(), 2);

        let job = h.runner.claim().await.unwrap();
        assert_eq!(job.execution_id, running.id);
        assert!(matches!(
            job.work,
            RunnerWork::PlaybookRun { ref playbook_id, plan: Some(_), .. } if playbook_id == "cluster_deploy"
        ));
    }

    #[tokio::test]
    async fn completion_is_terminal_and_applies_membership() {
        let h = harness().await;
        let running = running_execution(&h).await;
        let done = h
            .engine
            .complete_execution(
                &running.id,
                ExecutionOutcome {
                    state: ExecutionState::Completed,
                    reason: None,
                    payload: Value::Null,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(done.data.state, ExecutionState::Completed);
        assert!(done.data.result.unwrap().time_finished > 0);

        let cluster = h.engine.fleet().clusters().get(&h.cluster.id).await.unwrap();
        assert_eq!(cluster.data.server_ids().collect::<Vec<_>>(), ["s1", "s2"]);

        let err = h
            .engine
            .complete_execution(
                &running.id,
                ExecutionOutcome {
                    state: ExecutionState::Failed,
                    reason: Some("late".into()),
                    payload: Value::Null,
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidTransitionError");
    }

    #[tokio::test]
    async fn runner_failure_carries_reason() {
        let h = harness().await;
        let running = running_execution(&h).await;
        let failed = h
            .engine
            .complete_execution(
                &running.id,
                ExecutionOutcome {
                    state: ExecutionState::Failed,
                    reason: Some("host unreachable".into()),
                    payload: Value::Null,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(failed.data.state, ExecutionState::Failed);
        assert_eq!(
            failed.data.result.unwrap().reason.as_deref(),
            Some("host unreachable")
        );
        let cluster = h.engine.fleet().clusters().get(&h.cluster.id).await.unwrap();
        assert!(cluster.data.members.is_empty());
    }

    #[tokio::test]
    async fn planning_failure_fails_the_execution() {
        let h = harness().await;
        let config = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "add_osd", &["s1"]))
            .await
            .unwrap();
        let execution = h
            .engine
            .launch_execution(&runner_ctx(), &config.id, None)
            .await
            .unwrap();
        h.engine.fleet().delete_server("s1", None).await.unwrap();

        let failed = h.engine.dispatch(&execution.id).await.unwrap();
        assert_eq!(failed.data.state, ExecutionState::Failed);
        assert!(failed.data.result.unwrap().reason.unwrap().contains("s1"));
        assert_eq!(h.runner.pending().await, 0);
    }

    #[tokio::test]
    async fn launch_requires_scoped_permission() {
        let h = harness().await;
        let config = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "remove_osd", &[]))
            .await;
        assert_eq!(
            config.unwrap_err().kind(),
            "ServerListIsRequiredForPlaybookError"
        );

        let config = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1"]))
            .await
            .unwrap();
        let err = h
            .engine
            .launch_execution(&admin(), &config.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AuthorizationDenied");
    }

    // -- cancellation --

    #[tokio::test]
    async fn cancel_before_start_is_immediate() {
        let h = harness().await;
        let config = h
            .engine
            .create_playbook_configuration(&admin(), request(&h, "cluster_deploy", &["s1"]))
            .await
            .unwrap();
        let execution = h
            .engine
            .launch_execution(&runner_ctx(), &config.id, None)
            .await
            .unwrap();
        let cancelled = h.engine.cancel_execution(&execution.id, None).await.unwrap();
        assert_eq!(cancelled.data.state, ExecutionState::Cancelled);

        // The dispatcher finds nothing to do.
        let after = h.engine.dispatch(&execution.id).await.unwrap();
        assert_eq!(after.data.state, ExecutionState::Cancelled);
        assert_eq!(h.runner.pending().await, 0);
    }

    #[tokio::test]
    async fn cancel_running_is_cooperative() {
        let h = harness().await;
        let running = running_execution(&h).await;
        h.runner.claim().await.unwrap();

        let flagged = h.engine.cancel_execution(&running.id, None).await.unwrap();
        assert_eq!(flagged.data.state, ExecutionState::Running);
        assert!(flagged.data.cancel_requested);
        assert!(h.engine.is_cancel_requested(&running.id).await.unwrap());

        let cancelled = h
            .engine
            .complete_execution(
                &running.id,
                ExecutionOutcome {
                    state: ExecutionState::Cancelled,
                    reason: Some("stopped at checkpoint".into()),
                    payload: Value::Null,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(cancelled.data.state, ExecutionState::Cancelled);

        let err = h.engine.cancel_execution(&running.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidTransitionError");
    }

    #[tokio::test]
    async fn cancel_unclaimed_running_job_withdraws_it() {
        let h = harness().await;
        let running = running_execution(&h).await;
        let cancelled = h.engine.cancel_execution(&running.id, None).await.unwrap();
        assert_eq!(cancelled.data.state, ExecutionState::Cancelled);
        assert_eq!(h.runner.pending().await, 0);
    }

    #[tokio::test]
    async fn concurrent_completions_apply_once() {
        let h = harness().await;
        let running = running_execution(&h).await;

        let mut handles = Vec::new();
        for state in [ExecutionState::Completed, ExecutionState::Failed, ExecutionState::Cancelled] {
            let engine = h.engine.clone();
            let id = running.id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .complete_execution(
                        &id,
                        ExecutionOutcome {
                            state,
                            reason: None,
                            payload: Value::Null,
                        },
                        None,
                    )
                    .await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let history = h
            .engine
            .executions()
            .list_versions(&running.id, Pagination::all())
            .await
            .unwrap();
        let terminal = history
            .items
            .iter()
            .filter(|v| v.data.state.is_terminal())
            .count();
        assert_eq!(terminal, 1);
    }

    // -- discovery --

    #[tokio::test]
    async fn discovery_creates_server_from_facts() {
        let h = harness().await;
        let execution = h
            .engine
            .request_discovery("s3", "192.168.0.13", "ansible", None)
            .await
            .unwrap();
        assert_eq!(execution.data.kind, TaskKind::Discovery);
        h.engine.dispatch(&execution.id).await.unwrap();
        let job = h.runner.claim().await.unwrap();
        assert!(matches!(job.work, RunnerWork::Discovery { .. }));

        let done = h
            .engine
            .complete_execution(
                &execution.id,
                ExecutionOutcome {
                    state: ExecutionState::Completed,
                    reason: None,
                    payload: json!({"facts": facts("192.168.0.13", "10.0.1.13")}),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(done.data.state, ExecutionState::Completed);

        let server = h.engine.fleet().servers().get("s3").await.unwrap();
        assert_eq!(server.data.fqdn, "node-192.168.0.13");
        assert_eq!(server.data.ip, "192.168.0.13");
        assert_eq!(server.data.username, "ansible");
    }

    #[tokio::test]
    async fn duplicate_discovery_is_rejected() {
        let h = harness().await;
        let err = h
            .engine
            .request_discovery("s1", "192.168.0.11", "ansible", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UniqueConstraintViolationError");
    }

    async fn running_discovery(engine: &TaskEngine, server_id: &str) -> Versioned<Execution> {
        let execution = engine
            .request_discovery(server_id, "10.0.0.9", "ansible", None)
            .await
            .unwrap();
        engine.dispatch(&execution.id).await.unwrap()
    }

    fn discovered(public: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            state: ExecutionState::Completed,
            reason: None,
            payload: json!({"facts": facts(public, "10.0.1.9")}),
        }
    }

    #[tokio::test]
    async fn discovery_cancelled_during_completion_creates_no_server() {
        let store = InterleavingStore::new("execution");
        let runner = Arc::new(QueueRunner::new());
        let (engine, _queue) = TaskEngine::new(
            store.clone(),
            Arc::new(PlaybookRegistry::with_defaults()),
            runner,
        );
        let running = running_discovery(&engine, "s9").await;

        store.arm(Interleaving::Overwrite {
            field: "state",
            value: json!("cancelled"),
        });
        let err = engine
            .complete_execution(&running.id, discovered("10.0.0.9"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidTransitionError");

        let current = engine.executions().get(&running.id).await.unwrap();
        assert_eq!(current.data.state, ExecutionState::Cancelled);
        assert!(engine.fleet().servers().find("s9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discovery_of_taken_server_id_fails() {
        let h = harness().await;
        let running = running_discovery(&h.engine, "s9").await;
        seed_server(h.engine.fleet(), "s9", "10.0.0.9").await;

        let done = h
            .engine
            .complete_execution(&running.id, discovered("10.0.0.9"), None)
            .await
            .unwrap();
        assert_eq!(done.data.state, ExecutionState::Failed);
        let reason = done.data.result.unwrap().reason.unwrap();
        assert!(reason.contains("already exists"), "{reason}");
        let server = h.engine.fleet().servers().get("s9").await.unwrap();
        assert_eq!(server.data.fqdn, "s9.example.com");
    }

    // -- steps --

    #[tokio::test]
    async fn steps_are_listed_per_execution() {
        let h = harness().await;
        let running = running_execution(&h).await;
        for (name, result) in [("gather facts", StepResult::Ok), ("install", StepResult::Failed)] {
            h.engine
                .append_step(
                    &running.id,
                    NewStep {
                        name: name.into(),
                        server_id: Some("s1".into()),
                        result,
                        error: None,
                        time_started: 10,
                        time_finished: 20,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let steps = h
            .engine
            .list_steps(&running.id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(steps.total, 2);
        assert_eq!(steps.items[0].data.name, "gather facts");
        assert_eq!(steps.items[1].data.result, StepResult::Failed);

        let err = h
            .engine
            .list_steps("ghost", Pagination::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn dispatcher_drains_launches() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let runner = Arc::new(QueueRunner::new());
        let (engine, queue) = TaskEngine::new(
            store,
            Arc::new(PlaybookRegistry::with_defaults()),
            runner.clone(),
        );
        let engine = Arc::new(engine);
        tokio::spawn(run_dispatcher(engine.clone(), queue));

        let execution = engine
            .request_discovery("s9", "10.0.0.9", "ansible", None)
            .await
            .unwrap();
        for _ in 0..100 {
            if runner.pending().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let current = engine.executions().get(&execution.id).await.unwrap();
        assert_eq!(current.data.state, ExecutionState::Running);
    }
}
