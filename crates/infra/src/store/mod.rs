//! Tenant-scoped storage for policies and issuance records.
//!
//! Every call takes the tenant explicitly; implementations must never return
//! or mutate rows belonging to another tenant. Quantity changes are atomic
//! conditional updates, never read-then-write.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use schoolops_core::{DomainError, TenantId};
use schoolops_inventory::{InventoryItemPolicy, IssuanceFilter, IssuanceId, IssuanceRecord, PolicyId};
use schoolops_invoicing::InvoiceItemId;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryInvoices, InMemoryIssuanceStore, InMemoryPolicyStore};
pub use postgres::{PgInvoices, PgIssuanceStore, PgPolicyStore, run_migrations};

use crate::invoice_service::InvoiceService;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A conditional decrement found fewer units than requested.
    #[error("insufficient quantity: {requested} requested")]
    InsufficientQuantity { requested: u32 },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn insert(&self, policy: &InventoryItemPolicy) -> StoreResult<()>;

    async fn get(&self, tenant_id: TenantId, id: PolicyId) -> StoreResult<Option<InventoryItemPolicy>>;

    async fn list(&self, tenant_id: TenantId) -> StoreResult<Vec<InventoryItemPolicy>>;

    /// Persist everything except `current_quantity`, which only moves through
    /// [`PolicyStore::set_quantity`] and the conditional adjustments.
    async fn update(&self, policy: &InventoryItemPolicy) -> StoreResult<()>;

    /// Administrative stock correction.
    async fn set_quantity(&self, tenant_id: TenantId, id: PolicyId, quantity: Option<u32>) -> StoreResult<()>;

    /// `current_quantity -= by` if at least `by` units remain. An unknown
    /// (`NULL`) count is left unknown. Returns the new count.
    async fn decrement_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>>;

    /// `current_quantity += by`. Returns the new count.
    async fn increment_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>>;
}

#[async_trait]
pub trait IssuanceStore: Send + Sync {
    async fn insert(&self, record: &IssuanceRecord) -> StoreResult<()>;

    async fn get(&self, tenant_id: TenantId, id: IssuanceId) -> StoreResult<Option<IssuanceRecord>>;

    async fn list(&self, tenant_id: TenantId, filter: &IssuanceFilter) -> StoreResult<Vec<IssuanceRecord>>;

    async fn link_fee_item(&self, tenant_id: TenantId, id: IssuanceId, item_id: InvoiceItemId) -> StoreResult<()>;

    /// The issuance whose fee link points at `item_id`, if any.
    async fn find_by_fee_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<IssuanceId>>;

    /// Write the closed state of `record` only if the stored row is still
    /// `issued`. Returns `false` when another caller closed it first.
    async fn close(&self, record: &IssuanceRecord) -> StoreResult<bool>;
}

/// The three stores a service instance runs against.
#[derive(Clone)]
pub struct Stores {
    pub policies: Arc<dyn PolicyStore>,
    pub issuances: Arc<dyn IssuanceStore>,
    pub invoices: Arc<dyn InvoiceService>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            policies: Arc::new(InMemoryPolicyStore::new()),
            issuances: Arc::new(InMemoryIssuanceStore::new()),
            invoices: Arc::new(InMemoryInvoices::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            policies: Arc::new(PgPolicyStore::new(pool.clone())),
            issuances: Arc::new(PgIssuanceStore::new(pool.clone())),
            invoices: Arc::new(PgInvoices::new(pool)),
        }
    }
}
