//! strata-core: domain models and network inference for Strata.
//!
//! Every resource (server, cluster, playbook configuration, execution,
//! role, user) is a [`Model`] persisted as a [`Versioned`] entity through a
//! typed [`Repository`] over a `strata_storage::EntityStore`.
//!
//! # Public API
//!
//! - [`DomainError`] -- the error taxonomy shared by every layer, with
//!   stable kind tags
//! - [`topology`] -- pure network inference over server facts
//! - Models: [`Server`], [`Cluster`], [`PlaybookConfiguration`],
//!   [`Execution`], [`ExecutionStep`], [`Role`], [`User`]

pub mod cluster;
pub mod error;
pub mod execution;
pub mod facts;
pub mod model;
pub mod playbook_configuration;
pub mod role;
pub mod server;
pub mod topology;
pub mod user;

// ── Convenience re-exports: key types ────────────────────────────────

pub use cluster::{Cluster, ClusterMember};
pub use error::DomainError;
pub use execution::{
    Execution, ExecutionResult, ExecutionState, ExecutionStep, StepResult, TaskKind, TaskTarget,
};
pub use facts::Facts;
pub use model::{new_id, Model, Repository, Versioned};
pub use playbook_configuration::PlaybookConfiguration;
pub use role::Role;
pub use server::{Server, ServerState};
pub use topology::{DeploymentPlan, Ipv4Network, NetworkHost, PlannedHost, TopologyError};
pub use user::User;
