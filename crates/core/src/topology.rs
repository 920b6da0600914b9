//! Network topology inference over server facts.
//!
//! Given the facts of a set of servers this module derives:
//!
//! - the networks each server is attached to ([`networks_of`])
//! - the address a server is reached at ([`default_ip_of`])
//! - the fleet-wide public network ([`public_network`])
//! - the cluster's private network ([`cluster_network`]), falling back to
//!   the public one when the servers share no coherent private network
//!
//! Everything here is pure: no storage, no shared state.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::facts::{interface_key, Facts, FACT_PREFIX};
use crate::model::Versioned;
use crate::server::Server;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("list of networks is empty")]
    EmptyNetworkList,

    #[error("list of servers should contain at least 1 element")]
    EmptyServerList,

    #[error("server {server_id} reports no default IPv4 address")]
    NoDefaultAddress { server_id: String },

    #[error("server {server_id} has no usable network for its address {address}")]
    NoPublicNetwork { server_id: String, address: Ipv4Addr },

    #[error("cannot find suitable interface for server {server_id}")]
    NoSuitableInterface { server_id: String },

    #[error("cannot find suitable public address for server {server_id}")]
    NoSuitableAddress { server_id: String },

    #[error("invalid network {0}")]
    InvalidNetwork(String),

    #[error("malformed facts of server {server_id}: {reason}")]
    MalformedFacts { server_id: String, reason: String },
}

// ──────────────────────────────────────────────
// Ipv4Network
// ──────────────────────────────────────────────

/// An IPv4 CIDR block. Host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Network {
    network: u32,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Network {
    /// Build a network, clearing any host bits of `addr`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, TopologyError> {
        if prefix > 32 {
            return Err(TopologyError::InvalidNetwork(format!("{addr}/{prefix}")));
        }
        Ok(Self {
            network: u32::from(addr) & mask(prefix),
            prefix,
        })
    }

    /// Build a network from a dotted netmask such as `255.255.255.0`.
    pub fn with_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, TopologyError> {
        let bits = u32::from(netmask);
        let prefix = bits.leading_ones() as u8;
        if mask(prefix) != bits {
            return Err(TopologyError::InvalidNetwork(format!("{addr}/{netmask}")));
        }
        Self::new(addr, prefix)
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn num_addresses(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == self.network
    }

    pub fn contains_network(&self, other: &Ipv4Network) -> bool {
        other.prefix >= self.prefix && other.network & mask(self.prefix) == self.network
    }

    /// The enclosing network one bit shorter. `0.0.0.0/0` is its own supernet.
    pub fn supernet(&self) -> Ipv4Network {
        match self.prefix {
            0 => *self,
            p => Ipv4Network {
                network: self.network & mask(p - 1),
                prefix: p - 1,
            },
        }
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix)
    }
}

impl FromStr for Ipv4Network {
    type Err = TopologyError;

    /// Accepts `10.0.0.0/24`, `10.0.0.0/255.255.255.0` or a bare address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopologyError::InvalidNetwork(s.to_string());
        let (addr, suffix) = match s.split_once('/') {
            Some((addr, suffix)) => (addr, Some(suffix)),
            None => (s, None),
        };
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
        match suffix {
            None => Self::new(addr, 32),
            Some(suffix) if suffix.contains('.') => {
                let netmask: Ipv4Addr = suffix.parse().map_err(|_| invalid())?;
                Self::with_netmask(addr, netmask)
            }
            Some(suffix) => {
                let prefix: u8 = suffix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix)
            }
        }
    }
}

impl Serialize for Ipv4Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Merge networks into the minimal set of maximal contiguous blocks,
/// ordered by address.
pub fn collapse(networks: &[Ipv4Network]) -> Vec<Ipv4Network> {
    let mut current: Vec<Ipv4Network> = networks.to_vec();
    loop {
        current.sort();
        current.dedup();

        // Drop blocks covered by an earlier one. After sorting, a container
        // precedes everything it contains.
        let mut kept: Vec<Ipv4Network> = Vec::with_capacity(current.len());
        for net in current {
            if kept.last().is_some_and(|last| last.contains_network(&net)) {
                continue;
            }
            kept.push(net);
        }

        // Join sibling halves into their supernet.
        let mut merged = false;
        let mut next = Vec::with_capacity(kept.len());
        let mut i = 0;
        while i < kept.len() {
            if let Some(sibling) = kept.get(i + 1) {
                let parent = kept[i].supernet();
                if kept[i].prefix > 0
                    && kept[i].prefix == sibling.prefix
                    && parent.network == kept[i].network
                    && parent.contains_network(sibling)
                {
                    next.push(parent);
                    merged = true;
                    i += 2;
                    continue;
                }
            }
            next.push(kept[i]);
            i += 1;
        }

        if !merged {
            return next;
        }
        current = next;
    }
}

/// The smallest single network containing every input network.
///
/// Repeatedly collapses the set and widens the smallest block by one bit
/// until a single block remains. Terminates because each round either
/// merges blocks or shortens a prefix, and `/0` contains everything.
pub fn spanning_network(networks: &[Ipv4Network]) -> Result<Ipv4Network, TopologyError> {
    match networks {
        [] => return Err(TopologyError::EmptyNetworkList),
        [single] => return Ok(*single),
        _ => {}
    }

    let mut current = networks.to_vec();
    loop {
        current = collapse(&current);
        // Largest first; the stable sort keeps address order among equals,
        // so the last element is the highest-addressed smallest block.
        current.sort_by(|a, b| b.num_addresses().cmp(&a.num_addresses()));

        match current.as_mut_slice() {
            [only] => return Ok(*only),
            [.., smallest] => *smallest = smallest.supernet(),
            [] => return Err(TopologyError::EmptyNetworkList),
        }
    }
}

// ──────────────────────────────────────────────
// Per-server inference
// ──────────────────────────────────────────────

/// Anything that carries host facts and a recorded address.
pub trait NetworkHost {
    fn host_id(&self) -> &str;
    /// Address recorded at registration; may be a floating/NAT address.
    fn recorded_ip(&self) -> &str;
    fn facts(&self) -> &Facts;
}

impl NetworkHost for Versioned<Server> {
    fn host_id(&self) -> &str {
        &self.id
    }

    fn recorded_ip(&self) -> &str {
        &self.data.ip
    }

    fn facts(&self) -> &Facts {
        &self.data.facts
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(_) => true,
    }
}

fn malformed<H: NetworkHost + ?Sized>(host: &H, reason: String) -> TopologyError {
    TopologyError::MalformedFacts {
        server_id: host.host_id().to_string(),
        reason,
    }
}

fn parse_addr<H: NetworkHost + ?Sized>(host: &H, raw: &str) -> Result<Ipv4Addr, TopologyError> {
    raw.parse()
        .map_err(|_| malformed(host, format!("'{raw}' is not an IPv4 address")))
}

fn ipv4_field<'a, H: NetworkHost + ?Sized>(
    host: &H,
    ipv4: &'a Value,
    field: &str,
) -> Result<&'a str, TopologyError> {
    ipv4.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(host, format!("ipv4 block lacks '{field}'")))
}

/// Fact key of the hardware NIC behind `key`.
///
/// Alias interfaces (`eth0_1`, `eth0:1`) carry no `device` field. The NIC is
/// found by cutting trailing characters off the key until an entry with a
/// `device` field appears. At most `key.len()` steps; `None` when no such
/// ancestor exists, and the caller skips the interface.
fn hw_interface_key(key: &str, facts: &Facts) -> Option<String> {
    let mut name = key.to_string();
    while name.len() > FACT_PREFIX.len() {
        if facts
            .get(&name)
            .is_some_and(|entry| entry.get("device").is_some())
        {
            return Some(name);
        }
        name.pop();
    }
    None
}

/// Every usable IPv4 address of a server with its network, in the order
/// the interfaces are listed in `ansible_interfaces`.
///
/// Interfaces without IPv4 configuration, without a resolvable hardware NIC,
/// or whose NIC is inactive or loopback are skipped. A server with no usable
/// interface yields an empty list. An address seen twice keeps its first
/// position and takes the later network.
pub fn networks_of<H: NetworkHost + ?Sized>(
    host: &H,
) -> Result<Vec<(Ipv4Addr, Ipv4Network)>, TopologyError> {
    let facts = host.facts();
    let mut networks: Vec<(Ipv4Addr, Ipv4Network)> = Vec::new();

    for ifname in facts.interfaces() {
        let key = interface_key(ifname);
        let Some(interface) = facts.get(&key).filter(|v| is_truthy(v)) else {
            continue;
        };
        let Some(ipv4) = interface.get("ipv4").filter(|v| is_truthy(v)) else {
            continue;
        };
        let Some(hw_key) = hw_interface_key(&key, facts) else {
            continue;
        };
        let Some(hw) = facts.get(&hw_key) else {
            continue;
        };
        let active = hw.get("active").and_then(Value::as_bool).unwrap_or(false);
        let loopback = hw.get("type").and_then(Value::as_str) == Some("loopback");
        if !active || loopback {
            continue;
        }

        let address = parse_addr(host, ipv4_field(host, ipv4, "address")?)?;
        let network = parse_addr(host, ipv4_field(host, ipv4, "network")?)?;
        let netmask = parse_addr(host, ipv4_field(host, ipv4, "netmask")?)?;
        let network = Ipv4Network::with_netmask(network, netmask)
            .map_err(|e| malformed(host, e.to_string()))?;
        match networks.iter_mut().find(|(seen, _)| *seen == address) {
            Some(entry) => entry.1 = network,
            None => networks.push((address, network)),
        }
    }

    Ok(networks)
}

/// The address a server is reached at.
///
/// The recorded IP wins if the host itself reports it. Otherwise it is a
/// floating address managed outside the host (typically NATed), and the
/// address of the default-route interface is used instead.
pub fn default_ip_of<H: NetworkHost + ?Sized>(host: &H) -> Result<Ipv4Addr, TopologyError> {
    let facts = host.facts();
    let recorded = host.recorded_ip();
    if facts.all_ipv4_addresses().any(|addr| addr == recorded) {
        return parse_addr(host, recorded);
    }
    let fallback = facts
        .default_ipv4_address()
        .ok_or_else(|| TopologyError::NoDefaultAddress {
            server_id: host.host_id().to_string(),
        })?;
    parse_addr(host, fallback)
}

/// Network of each server's default address, spanned across the fleet.
pub fn public_network<H: NetworkHost>(hosts: &[H]) -> Result<Ipv4Network, TopologyError> {
    if hosts.is_empty() {
        return Err(TopologyError::EmptyServerList);
    }
    let networks = hosts
        .iter()
        .map(|host| {
            let address = default_ip_of(host)?;
            network_of_address(&networks_of(host)?, address)
                .ok_or_else(|| TopologyError::NoPublicNetwork {
                    server_id: host.host_id().to_string(),
                    address,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    spanning_network(&networks)
}

fn network_of_address(
    networks: &[(Ipv4Addr, Ipv4Network)],
    address: Ipv4Addr,
) -> Option<Ipv4Network> {
    networks
        .iter()
        .find(|(addr, _)| *addr == address)
        .map(|(_, network)| *network)
}

/// Networks of a server other than the one holding its default address.
fn private_networks_of<H: NetworkHost + ?Sized>(
    host: &H,
) -> Result<Vec<(Ipv4Addr, Ipv4Network)>, TopologyError> {
    let address = default_ip_of(host)?;
    let mut networks = networks_of(host)?;
    networks.retain(|(addr, _)| *addr != address);
    Ok(networks)
}

/// The network servers use to talk among themselves.
///
/// The candidate is the private network on the first server's last listed
/// interface. Every other server must own an address inside it; the first
/// such interface in listing order supplies that server's network. If the
/// first server has no private network, or any server has no address in
/// the candidate, the public network is returned.
pub fn cluster_network<H: NetworkHost>(hosts: &[H]) -> Result<Ipv4Network, TopologyError> {
    let public = public_network(hosts)?;

    let Some((_, candidate)) = private_networks_of(&hosts[0])?.pop() else {
        return Ok(public);
    };

    let mut matched = Vec::with_capacity(hosts.len());
    for host in &hosts[1..] {
        let networks = private_networks_of(host)?;
        match networks.iter().find(|(addr, _)| candidate.contains(*addr)) {
            Some((_, network)) => matched.push(*network),
            None => return Ok(public),
        }
    }
    matched.push(candidate);

    spanning_network(&matched)
}

fn interface_in<H: NetworkHost + ?Sized>(
    host: &H,
    network: &Ipv4Network,
) -> Result<String, TopologyError> {
    let facts = host.facts();
    for ifname in facts.interfaces() {
        let Some(interface) = facts.get(&interface_key(ifname)) else {
            continue;
        };
        let Some(ipv4) = interface.get("ipv4").filter(|v| is_truthy(v)) else {
            continue;
        };
        let Some(device) = interface.get("device").and_then(Value::as_str) else {
            continue;
        };
        let address = parse_addr(host, ipv4_field(host, ipv4, "address")?)?;
        if network.contains(address) {
            return Ok(device.to_string());
        }
    }
    Err(TopologyError::NoSuitableInterface {
        server_id: host.host_id().to_string(),
    })
}

fn address_in<H: NetworkHost + ?Sized>(
    host: &H,
    network: &Ipv4Network,
) -> Result<Ipv4Addr, TopologyError> {
    for raw in host.facts().all_ipv4_addresses() {
        let address = parse_addr(host, raw)?;
        if network.contains(address) {
            return Ok(address);
        }
    }
    Err(TopologyError::NoSuitableAddress {
        server_id: host.host_id().to_string(),
    })
}

/// Hardware device of `host` attached to the fleet's public network.
pub fn public_interface_of<H: NetworkHost>(
    host: &H,
    all_hosts: &[H],
) -> Result<String, TopologyError> {
    interface_in(host, &public_network(all_hosts)?)
}

/// Address of `host` inside the fleet's public network.
pub fn public_ip_of<H: NetworkHost>(host: &H, all_hosts: &[H]) -> Result<Ipv4Addr, TopologyError> {
    address_in(host, &public_network(all_hosts)?)
}

// ──────────────────────────────────────────────
// DeploymentPlan
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedHost {
    pub server_id: String,
    pub public_ip: Ipv4Addr,
    pub public_interface: String,
}

/// Network layout handed to the playbook runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub public_network: Ipv4Network,
    pub cluster_network: Ipv4Network,
    pub hosts: Vec<PlannedHost>,
}

/// Resolve the complete network layout for a set of servers.
pub fn deployment_plan<H: NetworkHost>(hosts: &[H]) -> Result<DeploymentPlan, TopologyError> {
    let public = public_network(hosts)?;
    let cluster = cluster_network(hosts)?;
    let planned = hosts
        .iter()
        .map(|host| {
            Ok(PlannedHost {
                server_id: host.host_id().to_string(),
                public_ip: address_in(host, &public)?,
                public_interface: interface_in(host, &public)?,
            })
        })
        .collect::<Result<Vec<_>, TopologyError>>()?;
    Ok(DeploymentPlan {
        public_network: public,
        cluster_network: cluster,
        hosts: planned,
    })
}
