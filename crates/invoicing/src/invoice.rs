use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use schoolops_core::{DomainError, DomainResult, Entity, PersonId, TenantId, time};

use crate::{AcademicYear, BillingPeriod};

schoolops_core::entity_id!(
    /// Fee invoice identifier (tenant-scoped).
    InvoiceId
);

schoolops_core::entity_id!(
    /// Fee invoice line identifier.
    InvoiceItemId
);

/// Fee head a line is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeCategory {
    Books,
    Uniform,
    Misc,
}

impl FeeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeCategory::Books => "books",
            FeeCategory::Uniform => "uniform",
            FeeCategory::Misc => "misc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "books" => Some(FeeCategory::Books),
            "uniform" => Some(FeeCategory::Uniform),
            "misc" => Some(FeeCategory::Misc),
            _ => None,
        }
    }
}

/// Natural key of a fee invoice within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceKey {
    pub student_id: PersonId,
    pub academic_year: AcademicYear,
    pub billing_period: BillingPeriod,
}

/// A billed line. `amount` is signed: negative lines are credits/refunds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeInvoiceItem {
    pub id: InvoiceItemId,
    pub invoice_id: InvoiceId,
    pub label: String,
    pub amount: Decimal,
    pub category: Option<FeeCategory>,
    /// Reference of the operation that produced the line, unique per invoice.
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(with = "time::flexible")]
    pub created_at: DateTime<Utc>,
}

/// Line to append to an invoice.
///
/// A line carrying a `source_ref` is appended at most once per invoice;
/// re-sending it returns the line already billed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoiceItem {
    pub label: String,
    pub amount: Decimal,
    pub category: Option<FeeCategory>,
    #[serde(default)]
    pub source_ref: Option<String>,
}

/// Student fee invoice for one billing period.
///
/// Invariant: `total_amount` equals the sum of the live items after every
/// mutation. All mutations go through methods that recompute it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeInvoice {
    id: InvoiceId,
    tenant_id: TenantId,
    key: InvoiceKey,
    items: Vec<FeeInvoiceItem>,
    total_amount: Decimal,
    #[serde(with = "time::flexible")]
    created_at: DateTime<Utc>,
    #[serde(with = "time::flexible")]
    updated_at: DateTime<Utc>,
}

impl FeeInvoice {
    /// A new, empty invoice (created lazily on the first charge of a period).
    pub fn open(tenant_id: TenantId, key: InvoiceKey, now: DateTime<Utc>) -> Self {
        Self {
            id: InvoiceId::generate(),
            tenant_id,
            key,
            items: Vec::new(),
            total_amount: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild an invoice loaded from storage, checking the stored total.
    pub fn rehydrate(
        id: InvoiceId,
        tenant_id: TenantId,
        key: InvoiceKey,
        items: Vec<FeeInvoiceItem>,
        total_amount: Decimal,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let invoice = Self {
            id,
            tenant_id,
            key,
            items,
            total_amount,
            created_at,
            updated_at,
        };
        if invoice.items_total() != total_amount {
            return Err(DomainError::invariant(format!(
                "invoice {id} total {total_amount} does not match item sum {}",
                invoice.items_total()
            )));
        }
        if let Some(stray) = invoice.items.iter().find(|i| i.invoice_id != id) {
            return Err(DomainError::invariant(format!(
                "item {} does not belong to invoice {id}",
                stray.id
            )));
        }
        Ok(invoice)
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn key(&self) -> &InvoiceKey {
        &self.key
    }

    pub fn student_id(&self) -> PersonId {
        self.key.student_id
    }

    pub fn items(&self) -> &[FeeInvoiceItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn item(&self, item_id: InvoiceItemId) -> Option<&FeeInvoiceItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Positive lines carrying exactly `label` and no `source_ref`, newest first.
    ///
    /// Labels are not unique; this is only a fallback for charges billed
    /// without a reference back to the operation that created them.
    pub fn unreferenced_charges<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a FeeInvoiceItem> + 'a {
        self.items
            .iter()
            .rev()
            .filter(move |i| i.label == label && i.amount > Decimal::ZERO && i.source_ref.is_none())
    }

    pub fn item_by_source(&self, source_ref: &str) -> Option<&FeeInvoiceItem> {
        self.items
            .iter()
            .find(|i| i.source_ref.as_deref() == Some(source_ref))
    }

    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(|i| i.amount).sum()
    }

    /// Append lines and recompute the total. Returns one line per input, in
    /// order: lines whose `source_ref` is already billed come back unchanged.
    pub fn add_items(
        &mut self,
        items: Vec<NewInvoiceItem>,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<FeeInvoiceItem>> {
        for item in &items {
            if item.label.trim().is_empty() {
                return Err(DomainError::validation("label", "invoice item label cannot be empty"));
            }
            if item.amount.is_zero() {
                return Err(DomainError::validation("amount", "invoice item amount cannot be zero"));
            }
        }

        let mut result = Vec::with_capacity(items.len());
        let mut appended = false;
        for i in items {
            if let Some(existing) = i.source_ref.as_deref().and_then(|r| self.item_by_source(r)) {
                result.push(existing.clone());
                continue;
            }
            let item = FeeInvoiceItem {
                id: InvoiceItemId::generate(),
                invoice_id: self.id,
                label: i.label,
                amount: i.amount,
                category: i.category,
                source_ref: i.source_ref,
                created_at: now,
            };
            self.items.push(item.clone());
            result.push(item);
            appended = true;
        }

        if appended {
            self.touch(now);
        }
        Ok(result)
    }

    /// Delete a line outright and recompute the total.
    pub fn remove_item(
        &mut self,
        item_id: InvoiceItemId,
        now: DateTime<Utc>,
    ) -> DomainResult<FeeInvoiceItem> {
        let idx = self
            .items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(DomainError::not_found)?;
        let removed = self.items.remove(idx);
        self.touch(now);
        Ok(removed)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.total_amount = self.items_total();
        self.updated_at = now;
    }
}

impl Entity for FeeInvoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
