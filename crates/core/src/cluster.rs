use serde::{Deserialize, Serialize};

use crate::model::{Model, Versioned};
use crate::server::Server;

/// Snapshot of a member server kept inside the cluster record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub server_id: String,
    pub fqdn: String,
    pub ip: String,
}

impl ClusterMember {
    fn of(server: &Versioned<Server>) -> Self {
        Self {
            server_id: server.id.clone(),
            fqdn: server.data.fqdn.clone(),
            ip: server.data.ip.clone(),
        }
    }
}

/// A storage cluster. Owns the membership relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// Ordered, duplicate-free.
    pub members: Vec<ClusterMember>,
}

impl Cluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.server_id.as_str())
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.members.iter().any(|m| m.server_id == server_id)
    }

    /// Append servers not yet present, keeping insertion order.
    pub fn add_servers(&mut self, servers: &[Versioned<Server>]) {
        for server in servers {
            if !self.contains(&server.id) {
                self.members.push(ClusterMember::of(server));
            }
        }
    }

    pub fn remove_servers(&mut self, server_ids: &[&str]) {
        self.members
            .retain(|m| !server_ids.contains(&m.server_id.as_str()));
    }

    /// Refresh the snapshots of servers that are already members.
    pub fn update_servers(&mut self, servers: &[Versioned<Server>]) {
        for server in servers {
            if let Some(member) = self.members.iter_mut().find(|m| m.server_id == server.id) {
                *member = ClusterMember::of(server);
            }
        }
    }
}

impl Model for Cluster {
    const MODEL_NAME: &'static str = "cluster";

    fn unique_key(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Facts, ServerState};

    fn server(id: &str, fqdn: &str) -> Versioned<Server> {
        Versioned {
            id: id.into(),
            model: "server".into(),
            version: 1,
            time_created: 1,
            time_updated: 1,
            time_deleted: 0,
            initiator_id: None,
            data: Server {
                name: fqdn.into(),
                fqdn: fqdn.into(),
                ip: "10.0.0.1".into(),
                username: "ansible".into(),
                state: ServerState::Active,
                cluster_id: None,
                facts: Facts::default(),
            },
        }
    }

    #[test]
    fn membership_is_ordered_and_unique() {
        let mut cluster = Cluster::new("ceph");
        cluster.add_servers(&[server("b", "b.local"), server("a", "a.local")]);
        cluster.add_servers(&[server("b", "b.local")]);
        assert_eq!(cluster.server_ids().collect::<Vec<_>>(), ["b", "a"]);

        cluster.remove_servers(&["b"]);
        assert_eq!(cluster.server_ids().collect::<Vec<_>>(), ["a"]);
        assert!(!cluster.contains("b"));
    }

    #[test]
    fn update_refreshes_only_members() {
        let mut cluster = Cluster::new("ceph");
        cluster.add_servers(&[server("a", "a.local")]);
        cluster.update_servers(&[server("a", "a.example.org"), server("z", "z.local")]);
        assert_eq!(cluster.members.len(), 1);
        assert_eq!(cluster.members[0].fqdn, "a.example.org");
    }
}
