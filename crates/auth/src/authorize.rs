use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use schoolops_core::TenantId;

use crate::{Permission, PrincipalId, Role, RolePermissions, TenantMembership};

/// A fully resolved principal for authorization decisions.
///
/// Construction of this object is decoupled from storage and transport: the
/// API derives it from gateway-asserted request context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub active_tenant_id: TenantId,
    pub membership: TenantMembership,
}

impl Principal {
    /// Principal acting in `tenant_id` with the given roles and no explicit
    /// permissions (permissions come from the role table at check time).
    pub fn with_roles(principal_id: PrincipalId, tenant_id: TenantId, roles: Vec<Role>) -> Self {
        Self {
            principal_id,
            active_tenant_id: tenant_id,
            membership: TenantMembership {
                tenant_id,
                roles,
                permissions: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal within its active tenant context against its
/// explicit membership permissions.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    check(principal, &principal.membership.permissions, required)
}

fn check(
    principal: &Principal,
    granted: &[Permission],
    required: &Permission,
) -> Result<(), AuthzError> {
    if principal.active_tenant_id != principal.membership.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }

    let perms: HashSet<&str> = granted.iter().map(|p| p.as_str()).collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Capability check consumed by the inventory service.
///
/// On success returns the tenant the principal is acting in, so callers scope
/// every subsequent storage call to it.
pub trait CapabilityGuard: Send + Sync {
    fn assert_capability(
        &self,
        principal: &Principal,
        capability: &Permission,
    ) -> Result<TenantId, AuthzError>;
}

/// Role-based guard: membership permissions plus whatever the principal's
/// roles grant through a [`RolePermissions`] table.
#[derive(Debug, Clone, Default)]
pub struct RbacGuard {
    table: RolePermissions,
}

impl RbacGuard {
    pub fn new(table: RolePermissions) -> Self {
        Self { table }
    }
}

impl CapabilityGuard for RbacGuard {
    fn assert_capability(
        &self,
        principal: &Principal,
        capability: &Permission,
    ) -> Result<TenantId, AuthzError> {
        let mut granted = self.table.resolve(&principal.membership.roles);
        granted.extend(principal.membership.permissions.iter().cloned());

        check(principal, &granted, capability).inspect_err(|e| {
            debug!(
                principal_id = %principal.principal_id,
                tenant_id = %principal.active_tenant_id,
                capability = %capability,
                error = %e,
                "capability denied"
            );
        })?;

        Ok(principal.active_tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: Vec<Role>) -> Principal {
        Principal::with_roles(PrincipalId::new(), TenantId::new(), roles)
    }

    #[test]
    fn explicit_permission_authorizes() {
        let mut p = principal(vec![]);
        p.membership.permissions.push(Permission::INVENTORY_READ);
        assert!(authorize(&p, &Permission::INVENTORY_READ).is_ok());
        assert_eq!(
            authorize(&p, &Permission::INVENTORY_MANAGE),
            Err(AuthzError::Forbidden("inventory.manage".to_string()))
        );
    }

    #[test]
    fn tenant_mismatch_is_rejected_even_for_admin() {
        let mut p = principal(vec![Role::ADMIN]);
        p.active_tenant_id = TenantId::new();
        let guard = RbacGuard::default();
        assert_eq!(
            guard.assert_capability(&p, &Permission::INVENTORY_READ),
            Err(AuthzError::TenantMismatch)
        );
    }

    #[test]
    fn admin_role_grants_everything_and_returns_tenant() {
        let p = principal(vec![Role::ADMIN]);
        let guard = RbacGuard::default();
        let tenant = guard
            .assert_capability(&p, &Permission::INVENTORY_MANAGE)
            .unwrap();
        assert_eq!(tenant, p.active_tenant_id);
    }

    #[test]
    fn staff_can_read_but_not_manage() {
        let p = principal(vec![Role::STAFF]);
        let guard = RbacGuard::default();
        assert!(guard.assert_capability(&p, &Permission::INVENTORY_READ).is_ok());
        assert!(matches!(
            guard.assert_capability(&p, &Permission::INVENTORY_MANAGE),
            Err(AuthzError::Forbidden(_))
        ));
        assert!(matches!(
            guard.assert_capability(&p, &Permission::INVENTORY_CREATE),
            Err(AuthzError::Forbidden(_))
        ));
    }

    #[test]
    fn inventory_manager_holds_all_inventory_capabilities() {
        let p = principal(vec![Role::INVENTORY_MANAGER]);
        let guard = RbacGuard::default();
        for cap in [
            Permission::INVENTORY_CREATE,
            Permission::INVENTORY_READ,
            Permission::INVENTORY_MANAGE,
        ] {
            assert!(guard.assert_capability(&p, &cap).is_ok(), "{cap}");
        }
    }

    #[test]
    fn unknown_roles_grant_nothing() {
        let p = principal(vec![Role::new("parent")]);
        let guard = RbacGuard::default();
        assert!(guard.assert_capability(&p, &Permission::INVENTORY_READ).is_err());
    }
}
