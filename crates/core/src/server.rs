use serde::{Deserialize, Serialize};

use crate::facts::Facts;
use crate::model::Model;

/// Lifecycle of a server in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Registered by discovery, facts collected.
    Discovered,
    /// A playbook run targeting this server is in flight.
    Pending,
    Active,
    Decommissioned,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub fqdn: String,
    pub ip: String,
    pub username: String,
    pub state: ServerState,
    /// Back-reference to the owning cluster; the cluster's member list is
    /// authoritative.
    pub cluster_id: Option<String>,
    pub facts: Facts,
}

impl Server {
    pub fn discovered(fqdn: &str, ip: &str, username: &str, facts: Facts) -> Self {
        Self {
            name: fqdn.to_string(),
            fqdn: fqdn.to_string(),
            ip: ip.to_string(),
            username: username.to_string(),
            state: ServerState::Discovered,
            cluster_id: None,
            facts,
        }
    }
}

impl Model for Server {
    const MODEL_NAME: &'static str = "server";
}
