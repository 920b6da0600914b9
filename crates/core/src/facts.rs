//! Raw host facts as reported by the discovery run.
//!
//! Facts follow the layout produced by Ansible's setup module: a flat map
//! where each network interface `eth0` has its own `ansible_eth0` entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of every per-interface fact key.
pub const FACT_PREFIX: &str = "ansible_";

/// Opaque mapping from fact name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Facts(Map<String, Value>);

impl Facts {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap a JSON value; anything but an object yields empty facts.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Interface names in reported order (`ansible_interfaces`).
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.str_list("ansible_interfaces")
    }

    /// Every IPv4 address configured on the host.
    pub fn all_ipv4_addresses(&self) -> impl Iterator<Item = &str> {
        self.str_list("ansible_all_ipv4_addresses")
    }

    /// Address of the interface carrying the default route.
    pub fn default_ipv4_address(&self) -> Option<&str> {
        self.0
            .get("ansible_default_ipv4")
            .and_then(|v| v.get("address"))
            .and_then(Value::as_str)
    }

    pub fn nodename(&self) -> Option<&str> {
        self.0.get("ansible_nodename").and_then(Value::as_str)
    }

    fn str_list(&self, name: &str) -> impl Iterator<Item = &str> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// Fact key of an interface: `eth0-1` is reported under `ansible_eth0_1`.
pub fn interface_key(ifname: &str) -> String {
    format!("{FACT_PREFIX}{}", ifname.replace('-', "_"))
}
