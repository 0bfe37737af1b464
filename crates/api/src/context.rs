use schoolops_auth::{Principal, PrincipalId, Role};
use schoolops_core::TenantId;

/// Tenant context for a request.
///
/// This is immutable and must be present for all inventory routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Acting user and roles as asserted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: PrincipalId,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn new(principal_id: PrincipalId, roles: Vec<Role>) -> Self {
        Self { principal_id, roles }
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// The principal the service checks capabilities against.
    pub fn principal(&self, tenant: &TenantContext) -> Principal {
        Principal::with_roles(self.principal_id, tenant.tenant_id(), self.roles.clone())
    }
}
