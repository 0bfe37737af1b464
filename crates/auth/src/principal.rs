use core::str::FromStr;
use serde::{Deserialize, Serialize};

use schoolops_core::{DomainError, TenantId, UserId};

/// Identity of an authenticated principal (administrator, store keeper,
/// service account). Authentication happens upstream; by the time a value of
/// this type exists, the identity has been asserted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(UserId);

impl PrincipalId {
    pub fn new() -> Self {
        Self(UserId::new())
    }

    pub fn from_user(user_id: UserId) -> Self {
        Self(user_id)
    }

    /// The user this principal acts as, recorded on audit fields.
    pub fn user_id(&self) -> UserId {
        self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PrincipalId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(UserId::from_str(s)?))
    }
}

/// A principal's membership in a tenant.
///
/// This is an authorization boundary object: it states *which tenant* the
/// principal is acting within and which roles/permissions are granted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: TenantId,
    pub roles: Vec<crate::Role>,
    pub permissions: Vec<crate::Permission>,
}
