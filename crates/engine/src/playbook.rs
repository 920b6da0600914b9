//! Registered playbooks and the admission rules they declare.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strata_core::topology::deployment_plan;
use strata_core::{DomainError, Server, Versioned};

/// Which servers a playbook accepts, judged against live cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerListPolicy {
    AnyServer,
    InThisCluster,
    NotInThisCluster,
    InOtherCluster,
    NotInOtherCluster,
    InAnyCluster,
    NotInAnyCluster,
}

impl ServerListPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerListPolicy::AnyServer => "any_server",
            ServerListPolicy::InThisCluster => "in_this_cluster",
            ServerListPolicy::NotInThisCluster => "not_in_this_cluster",
            ServerListPolicy::InOtherCluster => "in_other_cluster",
            ServerListPolicy::NotInOtherCluster => "not_in_other_cluster",
            ServerListPolicy::InAnyCluster => "in_any_cluster",
            ServerListPolicy::NotInAnyCluster => "not_in_any_cluster",
        }
    }

    fn admits(self, cluster_id: &str, server: &Server) -> bool {
        let member_of = server.cluster_id.as_deref();
        match self {
            ServerListPolicy::AnyServer => true,
            ServerListPolicy::InThisCluster => member_of == Some(cluster_id),
            ServerListPolicy::NotInThisCluster => member_of != Some(cluster_id),
            ServerListPolicy::InOtherCluster => member_of.is_some_and(|c| c != cluster_id),
            ServerListPolicy::NotInOtherCluster => member_of.map_or(true, |c| c == cluster_id),
            ServerListPolicy::InAnyCluster => member_of.is_some(),
            ServerListPolicy::NotInAnyCluster => member_of.is_none(),
        }
    }

    /// Every server must satisfy the policy; violators are all reported.
    pub fn check(self, cluster_id: &str, servers: &[Versioned<Server>]) -> Result<(), DomainError> {
        let violators: Vec<String> = servers
            .iter()
            .filter(|s| !self.admits(cluster_id, &s.data))
            .map(|s| s.id.clone())
            .collect();
        if violators.is_empty() {
            Ok(())
        } else {
            Err(DomainError::PolicyViolation {
                policy: self.as_str().to_string(),
                servers: violators,
            })
        }
    }
}

impl fmt::Display for ServerListPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a successful run changes cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEffect {
    #[default]
    None,
    AddServers,
    RemoveServers,
    RemoveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    Boolean,
    Integer,
    String,
}

impl HintType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            HintType::Boolean => value.is_boolean(),
            HintType::Integer => value.is_i64() || value.is_u64(),
            HintType::String => value.is_string(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            HintType::Boolean => "boolean",
            HintType::Integer => "integer",
            HintType::String => "string",
        }
    }
}

/// A tunable a playbook exposes to configuration authors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: HintType,
    pub default: Value,
}

impl Hint {
    fn flag(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            kind: HintType::Boolean,
            default: Value::Bool(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub required_server_list: bool,
    pub server_list_policy: ServerListPolicy,
    #[serde(default)]
    pub membership_effect: MembershipEffect,
    #[serde(default)]
    pub hints: Vec<Hint>,
}

impl PlaybookDescriptor {
    /// Validate supplied hint values and fill in defaults for the rest.
    pub fn resolve_hints(
        &self,
        given: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, DomainError> {
        for (id, value) in given {
            let hint = self
                .hints
                .iter()
                .find(|h| &h.id == id)
                .ok_or_else(|| DomainError::UnknownHint {
                    playbook_id: self.id.clone(),
                    hint: id.clone(),
                })?;
            if !hint.kind.accepts(value) {
                return Err(DomainError::HintValue {
                    hint: id.clone(),
                    expected: hint.kind.as_str().to_string(),
                });
            }
        }
        Ok(self
            .hints
            .iter()
            .map(|h| {
                let value = given.get(&h.id).unwrap_or(&h.default).clone();
                (h.id.clone(), value)
            })
            .collect())
    }

    /// Initial configuration for a run over `servers`.
    ///
    /// Shape: `{global_vars: {cluster, public_network, cluster_network,
    /// <hints>}, inventory: {<server id>: {ansible_host, monitor_address,
    /// public_interface}}}`, where `public_interface` is the device holding
    /// the host's public address. With no servers there is no inventory and
    /// no network keys.
    pub fn build_configuration(
        &self,
        cluster_name: &str,
        servers: &[Versioned<Server>],
        hints: &BTreeMap<String, Value>,
    ) -> Result<Value, DomainError> {
        let mut global_vars: Map<String, Value> = hints
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut inventory = Map::new();

        if !servers.is_empty() {
            let plan = deployment_plan(servers)?;
            global_vars.insert(
                "public_network".into(),
                Value::String(plan.public_network.to_string()),
            );
            global_vars.insert(
                "cluster_network".into(),
                Value::String(plan.cluster_network.to_string()),
            );
            for (server, host) in servers.iter().zip(&plan.hosts) {
                inventory.insert(
                    server.id.clone(),
                    json!({
                        "ansible_host": server.data.ip,
                        "monitor_address": host.public_ip.to_string(),
                        "public_interface": host.public_interface,
                    }),
                );
            }
        }
        global_vars.insert("cluster".into(), Value::String(cluster_name.to_string()));

        Ok(json!({"global_vars": global_vars, "inventory": inventory}))
    }
}

/// Every playbook the system can run, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PlaybookRegistry {
    playbooks: BTreeMap<String, PlaybookDescriptor>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in cluster lifecycle playbooks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PlaybookDescriptor {
            id: "cluster_deploy".into(),
            name: "Deploy Ceph cluster".into(),
            description: "Deploy a new cluster or extend it with fresh servers.".into(),
            required_server_list: true,
            server_list_policy: ServerListPolicy::NotInOtherCluster,
            membership_effect: MembershipEffect::AddServers,
            hints: vec![
                Hint::flag("dmcrypt", "Use dmcrypted OSDs"),
                Hint::flag("collocation", "Collocate OSD data and journal"),
                Hint::flag("rest_api", "Setup Ceph RestAPI"),
            ],
        });
        registry.register(PlaybookDescriptor {
            id: "add_osd".into(),
            name: "Add OSD to Ceph cluster".into(),
            description: "Add servers that belong to no cluster as OSD hosts.".into(),
            required_server_list: true,
            server_list_policy: ServerListPolicy::NotInAnyCluster,
            membership_effect: MembershipEffect::AddServers,
            hints: vec![
                Hint::flag("dmcrypt", "Use dmcrypted OSDs"),
                Hint::flag("collocation", "Collocate OSD data and journal"),
            ],
        });
        registry.register(PlaybookDescriptor {
            id: "remove_osd".into(),
            name: "Remove OSD host from Ceph cluster".into(),
            description: "Take OSD hosts out of the cluster.".into(),
            required_server_list: true,
            server_list_policy: ServerListPolicy::InThisCluster,
            membership_effect: MembershipEffect::RemoveServers,
            hints: Vec::new(),
        });
        registry.register(PlaybookDescriptor {
            id: "purge_cluster".into(),
            name: "Purge cluster".into(),
            description: "Remove every Ceph component and release all servers.".into(),
            required_server_list: false,
            server_list_policy: ServerListPolicy::InThisCluster,
            membership_effect: MembershipEffect::RemoveAll,
            hints: Vec::new(),
        });
        registry
    }

    /// Add or replace a descriptor.
    pub fn register(&mut self, descriptor: PlaybookDescriptor) {
        self.playbooks.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Result<&PlaybookDescriptor, DomainError> {
        self.playbooks
            .get(id)
            .ok_or_else(|| DomainError::UnknownPlaybook(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaybookDescriptor> {
        self.playbooks.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.playbooks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::Facts;

    fn server(id: &str, cluster_id: Option<&str>) -> Versioned<Server> {
        let mut data = Server::discovered("h", "10.0.0.1", "ansible", Facts::default());
        data.cluster_id = cluster_id.map(str::to_string);
        Versioned {
            id: id.into(),
            model: "server".into(),
            version: 1,
            time_created: 1,
            time_updated: 1,
            time_deleted: 0,
            initiator_id: None,
            data,
        }
    }

    fn fleet() -> Vec<Versioned<Server>> {
        vec![
            server("free", None),
            server("mine", Some("c1")),
            server("theirs", Some("c2")),
        ]
    }

    fn admitted(policy: ServerListPolicy) -> Vec<String> {
        fleet()
            .into_iter()
            .filter(|s| policy.check("c1", std::slice::from_ref(s)).is_ok())
            .map(|s| s.id)
            .collect()
    }

    #[test]
    fn policies_partition_servers() {
        use ServerListPolicy::*;
        assert_eq!(admitted(AnyServer), ["free", "mine", "theirs"]);
        assert_eq!(admitted(InThisCluster), ["mine"]);
        assert_eq!(admitted(NotInThisCluster), ["free", "theirs"]);
        assert_eq!(admitted(InOtherCluster), ["theirs"]);
        assert_eq!(admitted(NotInOtherCluster), ["free", "mine"]);
        assert_eq!(admitted(InAnyCluster), ["mine", "theirs"]);
        assert_eq!(admitted(NotInAnyCluster), ["free"]);
    }

    #[test]
    fn policy_violation_lists_every_offender() {
        let err = ServerListPolicy::NotInAnyCluster
            .check("c1", &fleet())
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::PolicyViolation {
                policy: "not_in_any_cluster".into(),
                servers: vec!["mine".into(), "theirs".into()],
            }
        );
        assert_eq!(err.kind(), "PolicyViolationError");
    }

    #[test]
    fn hints_are_validated_and_defaulted() {
        let registry = PlaybookRegistry::with_defaults();
        let deploy = registry.get("cluster_deploy").unwrap();

        let resolved = deploy
            .resolve_hints(&BTreeMap::from([("dmcrypt".to_string(), json!(true))]))
            .unwrap();
        assert_eq!(resolved["dmcrypt"], json!(true));
        assert_eq!(resolved["collocation"], json!(false));
        assert_eq!(resolved.len(), 3);

        let err = deploy
            .resolve_hints(&BTreeMap::from([("turbo".to_string(), json!(true))]))
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownHintError");

        let err = deploy
            .resolve_hints(&BTreeMap::from([("dmcrypt".to_string(), json!("yes"))]))
            .unwrap_err();
        assert_eq!(err.kind(), "HintValueError");
    }

    #[test]
    fn unknown_playbook() {
        let err = PlaybookRegistry::with_defaults().get("nope").unwrap_err();
        assert_eq!(err.kind(), "UnknownPlaybookError");
    }

    #[test]
    fn configuration_without_servers_has_no_networks() {
        let registry = PlaybookRegistry::with_defaults();
        let purge = registry.get("purge_cluster").unwrap();
        let config = purge
            .build_configuration("ceph", &[], &BTreeMap::new())
            .unwrap();
        assert_eq!(
            config,
            json!({"global_vars": {"cluster": "ceph"}, "inventory": {}})
        );
    }

    #[test]
    fn configuration_carries_topology_and_hints() {
        let facts = Facts::from_value(json!({
            "ansible_interfaces": ["eth0"],
            "ansible_all_ipv4_addresses": ["10.0.0.1"],
            "ansible_default_ipv4": {"address": "10.0.0.1"},
            "ansible_eth0": {
                "device": "eth0", "active": true, "type": "ether",
                "ipv4": {"address": "10.0.0.1", "network": "10.0.0.0", "netmask": "255.255.255.0"}
            }
        }));
        let mut host = server("s1", None);
        host.data.facts = facts;

        let registry = PlaybookRegistry::with_defaults();
        let add = registry.get("add_osd").unwrap();
        let hints = add.resolve_hints(&BTreeMap::new()).unwrap();
        let config = add.build_configuration("ceph", &[host], &hints).unwrap();

        assert_eq!(config["global_vars"]["cluster"], "ceph");
        assert_eq!(config["global_vars"]["public_network"], "10.0.0.0/24");
        assert_eq!(config["global_vars"]["cluster_network"], "10.0.0.0/24");
        assert_eq!(config["global_vars"]["dmcrypt"], false);
        assert_eq!(config["inventory"]["s1"]["ansible_host"], "10.0.0.1");
        assert_eq!(config["inventory"]["s1"]["monitor_address"], "10.0.0.1");
        assert_eq!(config["inventory"]["s1"]["public_interface"], "eth0");
    }

    #[test]
    fn registry_lists_defaults() {
        let registry = PlaybookRegistry::with_defaults();
        let ids: Vec<&str> = registry.ids().collect();
        assert_eq!(ids, ["add_osd", "cluster_deploy", "purge_cluster", "remove_osd"]);
    }
}
