mod config;
mod serve;
mod topology;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use strata_engine::{PermissionCatalogue, PlaybookRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Strata storage cluster management service.
#[derive(Parser)]
#[command(name = "strata", version, about = "Strata storage cluster management service")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server and the execution dispatcher
    Serve {
        /// Path to the TOML configuration file (default: ./strata.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to bind, overriding the configuration
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on, overriding the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Resolve public and cluster networks from a JSON file of host facts
    Topology {
        /// Path to a JSON array of `{id, ip, facts}` objects
        file: PathBuf,
    },

    /// List the built-in playbooks and their hints
    Playbooks,

    /// List every permission a role may be granted
    Permissions,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            cmd_serve(config, host, port, cli.output, cli.quiet);
        }
        Commands::Topology { file } => {
            topology::cmd_topology(&file, cli.output, cli.quiet);
        }
        Commands::Playbooks => cmd_playbooks(cli.output, cli.quiet),
        Commands::Permissions => cmd_permissions(cli.output, cli.quiet),
    }
}

fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn cmd_serve(
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    output: OutputFormat,
    quiet: bool,
) {
    let mut config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }

    init_tracing(&config.log_level);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(serve::start_server(config)) {
        report_error(&format!("Server error: {}", e), output, quiet);
        process::exit(1);
    }
}

fn cmd_playbooks(output: OutputFormat, quiet: bool) {
    let registry = PlaybookRegistry::with_defaults();
    match output {
        OutputFormat::Json => {
            let items: Vec<_> = registry.iter().collect();
            print_json(&items, output, quiet);
        }
        OutputFormat::Text => {
            for playbook in registry.iter() {
                println!("{}  {}", playbook.id, playbook.name);
                for hint in &playbook.hints {
                    println!("    {:<12} {}", hint.id, hint.description);
                }
            }
        }
    }
}

fn cmd_permissions(output: OutputFormat, quiet: bool) {
    let registry = PlaybookRegistry::with_defaults();
    let catalogue = PermissionCatalogue::new(registry.ids());
    match output {
        OutputFormat::Json => print_json(catalogue.as_map(), output, quiet),
        OutputFormat::Text => {
            for (resource, actions) in catalogue.as_map() {
                for action in actions {
                    println!("{}:{}", resource, action);
                }
            }
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T, output: OutputFormat, quiet: bool) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            report_error(&format!("error serializing output: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{{\"error\": \"{}\"}}", msg.replace('"', "\\\""));
        }
    }
}
