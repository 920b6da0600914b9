use std::collections::{BTreeMap, BTreeSet};

use strata_core::{DomainError, Role};

/// Entity types exposed through the generic CRUD surface.
pub const API_ENTITIES: [&str; 6] = [
    "server",
    "cluster",
    "playbook_configuration",
    "execution",
    "role",
    "user",
];

/// Every permission a role may hold.
///
/// Resource `api` carries the generic actions `view_<entity>`,
/// `view_<entity>_versions`, `create_<entity>`, `edit_<entity>` and
/// `delete_<entity>` plus `view_execution_steps`. Resource `playbook` is
/// scoped by playbook id.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCatalogue {
    permissions: BTreeMap<String, BTreeSet<String>>,
}

impl PermissionCatalogue {
    pub fn new<I, S>(playbook_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut api = BTreeSet::new();
        for entity in API_ENTITIES {
            for template in ["view_{}", "view_{}_versions", "create_{}", "edit_{}", "delete_{}"] {
                api.insert(template.replace("{}", entity));
            }
        }
        api.insert("view_execution_steps".to_string());

        let mut permissions = BTreeMap::new();
        permissions.insert("api".to_string(), api);
        permissions.insert(
            "playbook".to_string(),
            playbook_ids.into_iter().map(Into::into).collect(),
        );
        Self { permissions }
    }

    pub fn contains(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .get(resource)
            .is_some_and(|actions| actions.contains(action))
    }

    /// Reject roles granting anything outside the catalogue.
    pub fn validate(&self, role: &Role) -> Result<(), DomainError> {
        for (resource, actions) in &role.permissions {
            if let Some(action) = actions.iter().find(|a| !self.contains(resource, a)) {
                return Err(DomainError::UnknownPermission {
                    resource: resource.clone(),
                    action: action.clone(),
                });
            }
        }
        Ok(())
    }

    /// A role holding every catalogued permission.
    pub fn full_role(&self, name: &str) -> Role {
        Role {
            name: name.to_string(),
            permissions: self.permissions.clone(),
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.permissions
    }
}
