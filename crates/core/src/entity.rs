//! Entity trait: identity + continuity across state changes.

use crate::TenantId;

/// Entity marker + minimal interface.
///
/// Every persisted record in this system is tenant-scoped, so entities also
/// expose the tenant they belong to. Stores key rows by `(tenant_id, id)`.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Returns the owning tenant.
    fn tenant_id(&self) -> TenantId;
}
