//! Fee invoice collaborator used by the issuance and return executors.

use async_trait::async_trait;

use schoolops_core::TenantId;
use schoolops_invoicing::{
    FeeInvoice, FeeInvoiceItem, InvoiceId, InvoiceItemId, InvoiceKey, NewInvoiceItem,
};

use crate::store::StoreResult;

/// Student fee invoices, keyed by (student, academic year, billing period).
///
/// Implementations keep `total_amount` equal to the sum of live items after
/// every append and removal.
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Invoice for `key`, created empty if this is the first charge of the period.
    async fn find_or_create_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<InvoiceId>;

    async fn add_items(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        items: Vec<NewInvoiceItem>,
    ) -> StoreResult<Vec<FeeInvoiceItem>>;

    /// Existing invoice for `key`, without creating one.
    async fn find_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<Option<FeeInvoice>>;

    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> StoreResult<Option<FeeInvoice>>;

    async fn find_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<FeeInvoiceItem>>;

    /// Delete a line and recompute the total in one unit of work.
    async fn remove_item(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    ) -> StoreResult<FeeInvoice>;
}
