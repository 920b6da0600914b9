//! `strata topology` -- resolve the network layout for a set of hosts
//! offline, from a JSON file of collected facts.
//!
//! Input: `[{"id": "s1", "ip": "10.0.0.1", "facts": {...}}, ...]`

use std::path::Path;
use std::process;

use serde::Deserialize;
use strata_core::topology::deployment_plan;
use strata_core::{DeploymentPlan, Facts, NetworkHost};

use crate::{report_error, OutputFormat};

#[derive(Debug, Deserialize)]
struct HostFacts {
    id: String,
    ip: String,
    #[serde(default)]
    facts: Facts,
}

impl NetworkHost for HostFacts {
    fn host_id(&self) -> &str {
        &self.id
    }

    fn recorded_ip(&self) -> &str {
        &self.ip
    }

    fn facts(&self) -> &Facts {
        &self.facts
    }
}

fn load_hosts(path: &Path) -> Result<Vec<HostFacts>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("error parsing JSON in '{}': {}", path.display(), e))
}

fn render_text(plan: &DeploymentPlan) -> String {
    let mut out = format!(
        "public network:  {}\ncluster network: {}\n",
        plan.public_network, plan.cluster_network
    );
    for host in &plan.hosts {
        out.push_str(&format!(
            "  {}  {} ({})\n",
            host.server_id, host.public_ip, host.public_interface
        ));
    }
    out
}

pub(crate) fn cmd_topology(path: &Path, output: OutputFormat, quiet: bool) {
    let hosts = match load_hosts(path) {
        Ok(hosts) => hosts,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    if hosts.is_empty() {
        report_error("no hosts given", output, quiet);
        process::exit(1);
    }

    let plan = match deployment_plan(&hosts) {
        Ok(plan) => plan,
        Err(e) => {
            report_error(&format!("topology error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&plan) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                report_error(&format!("cannot serialize plan: {}", e), output, quiet);
                process::exit(1);
            }
        },
        OutputFormat::Text => print!("{}", render_text(&plan)),
    }
}
