//! `schoolops-auth`: pure authorization boundary.
//!
//! Authentication happens upstream; this crate only answers "may this
//! principal exercise this capability in this tenant?". It is decoupled from
//! HTTP and storage.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{authorize, AuthzError, CapabilityGuard, Principal, RbacGuard};
pub use permissions::Permission;
pub use principal::{PrincipalId, TenantMembership};
pub use roles::{Role, RolePermissions};
