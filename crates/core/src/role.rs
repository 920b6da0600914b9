use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::Model;

/// Named set of capabilities.
///
/// `permissions` maps a resource (`"api"`, `"playbook"`) to the actions or
/// scoped values granted on it, e.g. `"playbook" -> {"cluster_deploy"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: BTreeMap<String, BTreeSet<String>>,
}

impl Role {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            permissions: BTreeMap::new(),
        }
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .get(resource)
            .is_some_and(|actions| actions.contains(action))
    }

    pub fn add_permissions<I, S>(&mut self, resource: &str, actions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .entry(resource.to_string())
            .or_default()
            .extend(actions.into_iter().map(Into::into));
    }

    pub fn remove_permissions(&mut self, resource: &str, actions: &[&str]) {
        if let Some(granted) = self.permissions.get_mut(resource) {
            granted.retain(|a| !actions.contains(&a.as_str()));
            if granted.is_empty() {
                self.permissions.remove(resource);
            }
        }
    }
}

impl Model for Role {
    const MODEL_NAME: &'static str = "role";

    fn unique_key(&self) -> Option<String> {
        Some(self.name.clone())
    }
}
