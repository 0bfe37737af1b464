//! `schoolops-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the inventory and
//! invoicing modules (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod time;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, PersonId, TenantId, UserId};
pub use money::Money;
pub use value_object::ValueObject;

/// Re-exports used by [`entity_id!`] so callers need no direct `uuid` dependency.
#[doc(hidden)]
pub mod __private {
    pub use uuid::Uuid;
}
