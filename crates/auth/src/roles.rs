use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier used for RBAC.
///
/// Roles are opaque strings at this layer; [`RolePermissions`] maps them to
/// the permissions they grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const INVENTORY_MANAGER: Role = Role(Cow::Borrowed("inventory_manager"));
    pub const STAFF: Role = Role(Cow::Borrowed("staff"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role → permission table.
#[derive(Debug, Clone)]
pub struct RolePermissions {
    grants: HashMap<String, Vec<Permission>>,
}

impl RolePermissions {
    pub fn empty() -> Self {
        Self {
            grants: HashMap::new(),
        }
    }

    /// `admin` gets everything, `inventory_manager` the three inventory
    /// capabilities, `staff` read-only access.
    pub fn school_defaults() -> Self {
        Self::empty()
            .grant(Role::ADMIN, vec![Permission::WILDCARD])
            .grant(
                Role::INVENTORY_MANAGER,
                vec![
                    Permission::INVENTORY_CREATE,
                    Permission::INVENTORY_READ,
                    Permission::INVENTORY_MANAGE,
                ],
            )
            .grant(Role::STAFF, vec![Permission::INVENTORY_READ])
    }

    pub fn grant(mut self, role: Role, permissions: Vec<Permission>) -> Self {
        self.grants
            .entry(role.as_str().to_string())
            .or_default()
            .extend(permissions);
        self
    }

    /// Union of permissions granted by `roles` (unknown roles grant nothing).
    pub fn resolve(&self, roles: &[Role]) -> Vec<Permission> {
        let mut out: Vec<Permission> = Vec::new();
        for role in roles {
            if let Some(perms) = self.grants.get(role.as_str()) {
                for p in perms {
                    if !out.contains(p) {
                        out.push(p.clone());
                    }
                }
            }
        }
        out
    }
}

impl Default for RolePermissions {
    fn default() -> Self {
        Self::school_defaults()
    }
}
