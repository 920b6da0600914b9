//! Server configuration for `strata serve`.
//!
//! Read once at start from a TOML file, then overridden by environment
//! variables. The resulting [`Config`] is shared by `Arc`; nothing reads the
//! environment after start-up.
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//!
//! [api]
//! host = "0.0.0.0"
//! port = 8080
//! server_discovery_token = "26758c32-3421-4f3d-9603-e4b5337e7ecc"
//! pagination_default_per_page = 25
//!
//! [auth]
//! tokens = [{ token = "admin-secret", user_id = "root" }]
//!
//! [[roles]]
//! id = "wheel"
//! name = "wheel"
//! all_permissions = true
//!
//! [[users]]
//! id = "root"
//! login = "root"
//! role_id = "wheel"
//! ```
//!
//! Environment overrides: `STRATA_DISCOVERY_TOKEN`, `STRATA_PORT`,
//! `STRATA_LOG`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Looked up when `--config` is not given. Missing is fine.
pub const DEFAULT_CONFIG_PATH: &str = "strata.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter; `RUST_LOG` still wins.
    pub log_level: String,
    pub api: ApiConfig,
    pub auth: AuthConfig,
    /// Roles created at start if absent.
    pub roles: Vec<RoleSeed>,
    /// Users created at start if absent.
    pub users: Vec<UserSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            api: ApiConfig::default(),
            auth: AuthConfig::default(),
            roles: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// `[api]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret letting a server register itself without a user.
    pub server_discovery_token: Option<String>,
    pub pagination_default_per_page: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            server_discovery_token: None,
            pagination_default_per_page: 25,
        }
    }
}

/// `[auth]` section: static bearer tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeMap<String, BTreeSet<String>>,
    /// Grant every catalogued permission, including all playbooks.
    #[serde(default)]
    pub all_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub role_id: Option<String>,
}

impl Config {
    /// Load `path`, or `strata.toml` if present, or built-in defaults;
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut config = match path {
            Some(path) => read_config(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_config(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `STRATA_*` overrides fetched through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("STRATA_DISCOVERY_TOKEN") {
            self.api.server_discovery_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(port) = lookup("STRATA_PORT") {
            self.api.port = port
                .parse()
                .map_err(|_| format!("STRATA_PORT: '{port}' is not a valid port"))?;
        }
        if let Some(level) = lookup("STRATA_LOG") {
            self.log_level = level;
        }
        Ok(())
    }

    /// User id bound to a static bearer token.
    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        self.auth
            .tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.user_id.as_str())
    }
}

fn read_config(path: &Path) -> Result<Config, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    toml::from_str(&content).map_err(|e| format!("could not parse '{}': {}", path.display(), e))
}
