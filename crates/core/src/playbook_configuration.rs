use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::model::Model;

/// A named, editable configuration of one playbook against one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookConfiguration {
    pub name: String,
    pub playbook_id: String,
    pub cluster_id: String,
    pub server_ids: Vec<String>,
    /// Hint values supplied at creation.
    #[serde(default)]
    pub hints: BTreeMap<String, Value>,
    pub configuration: Value,
    /// Set once when a run of this configuration is launched at creation.
    pub created_execution_id: Option<String>,
}

impl PlaybookConfiguration {
    /// Reject an edit that touches anything but `name` and `configuration`.
    pub fn check_editable(&self, edited: &PlaybookConfiguration) -> Result<(), DomainError> {
        let changed = if self.playbook_id != edited.playbook_id {
            Some("playbook_id")
        } else if self.cluster_id != edited.cluster_id {
            Some("cluster_id")
        } else if self.server_ids != edited.server_ids {
            Some("server_ids")
        } else if self.hints != edited.hints {
            Some("hints")
        } else if self.created_execution_id != edited.created_execution_id {
            Some("created_execution_id")
        } else {
            None
        };
        match changed {
            Some(field) => Err(DomainError::CannotUpdateImmutableField(field.to_string())),
            None => Ok(()),
        }
    }
}

impl Model for PlaybookConfiguration {
    const MODEL_NAME: &'static str = "playbook_configuration";

    fn unique_key(&self) -> Option<String> {
        Some(self.name.clone())
    }
}
