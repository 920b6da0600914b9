//! strata-engine: everything between an authenticated request and the store.
//!
//! - [`policy`] -- ordered access predicates and scoped authorization
//! - [`catalogue`] -- the closed set of grantable permissions
//! - [`playbook`] -- registered playbooks, their admission policies and
//!   configuration generation
//! - [`fleet`] -- cluster membership and server maintenance
//! - [`engine`] -- the execution state machine and runner hand-off
//! - [`runner`] -- the collaborator that actually runs playbooks

pub mod catalogue;
pub mod engine;
pub mod fleet;
pub mod playbook;
pub mod policy;
pub mod runner;

pub use catalogue::PermissionCatalogue;
pub use engine::{run_dispatcher, ExecutionOutcome, NewPlaybookConfiguration, NewStep, TaskEngine};
pub use fleet::Fleet;
pub use playbook::{
    Hint, HintType, MembershipEffect, PlaybookDescriptor, PlaybookRegistry, ServerListPolicy,
};
pub use policy::{authorize, AccessPredicate, AccessRule, Decision, Principal, RequestContext};
pub use runner::{QueueRunner, PlaybookRunner, RunnerJob, RunnerWork};
