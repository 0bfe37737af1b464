//! Inventory domain module: item policies, issuance records, and the
//! issuance validator.
//!
//! This crate contains business rules only, implemented as deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod issuance;
pub mod policy;
pub mod validator;

pub use issuance::{
    IssuanceFilter, IssuanceId, IssuanceRecord, IssuanceRequest, IssuanceStatus, RecipientType,
    ReturnRequest,
};
pub use policy::{ChargeType, InventoryItemPolicy, IssueTo, PolicyDraft, PolicyId, PolicyPatch};
pub use validator::{validate, ChargeSnapshot, IssuanceEffects, IssuanceRejection};
