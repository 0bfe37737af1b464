//! In-memory stores for tests and local development.
//!
//! Each conditional update runs under a single write lock, which gives the
//! same atomicity as the `UPDATE ... WHERE` statements in the Postgres stores.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use schoolops_core::{Entity, TenantId};
use schoolops_inventory::{
    InventoryItemPolicy, IssuanceFilter, IssuanceId, IssuanceRecord, IssuanceStatus, PolicyId,
};
use schoolops_invoicing::{
    FeeInvoice, FeeInvoiceItem, InvoiceId, InvoiceItemId, InvoiceKey, NewInvoiceItem,
};

use super::{IssuanceStore, PolicyStore, StoreError, StoreResult};
use crate::invoice_service::InvoiceService;

type TenantMap<K, V> = RwLock<HashMap<(TenantId, K), V>>;

fn read<K, V>(map: &TenantMap<K, V>) -> StoreResult<RwLockReadGuard<'_, HashMap<(TenantId, K), V>>> {
    map.read()
        .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
}

fn write<K, V>(map: &TenantMap<K, V>) -> StoreResult<RwLockWriteGuard<'_, HashMap<(TenantId, K), V>>> {
    map.write()
        .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
}

fn key_of<E: Entity>(entity: &E) -> (TenantId, E::Id) {
    (entity.tenant_id(), entity.id().clone())
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    inner: TenantMap<PolicyId, InventoryItemPolicy>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn insert(&self, policy: &InventoryItemPolicy) -> StoreResult<()> {
        let mut map = write(&self.inner)?;
        let key = key_of(policy);
        if map.contains_key(&key) {
            return Err(StoreError::Conflict(format!("policy {} already exists", policy.id)));
        }
        map.insert(key, policy.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, id: PolicyId) -> StoreResult<Option<InventoryItemPolicy>> {
        Ok(read(&self.inner)?.get(&(tenant_id, id)).cloned())
    }

    async fn list(&self, tenant_id: TenantId) -> StoreResult<Vec<InventoryItemPolicy>> {
        let map = read(&self.inner)?;
        let mut out: Vec<_> = map
            .iter()
            .filter(|((t, _), _)| *t == tenant_id)
            .map(|(_, p)| p.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(out)
    }

    async fn update(&self, policy: &InventoryItemPolicy) -> StoreResult<()> {
        let mut map = write(&self.inner)?;
        let stored = map
            .get_mut(&key_of(policy))
            .ok_or(StoreError::NotFound)?;
        let quantity = stored.current_quantity;
        *stored = policy.clone();
        stored.current_quantity = quantity;
        Ok(())
    }

    async fn set_quantity(&self, tenant_id: TenantId, id: PolicyId, quantity: Option<u32>) -> StoreResult<()> {
        let mut map = write(&self.inner)?;
        let stored = map.get_mut(&(tenant_id, id)).ok_or(StoreError::NotFound)?;
        stored.current_quantity = quantity;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn decrement_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>> {
        let mut map = write(&self.inner)?;
        let stored = map.get_mut(&(tenant_id, id)).ok_or(StoreError::NotFound)?;
        let next = match stored.current_quantity {
            None => None,
            Some(q) if q >= by => Some(q - by),
            Some(_) => return Err(StoreError::InsufficientQuantity { requested: by }),
        };
        stored.current_quantity = next;
        stored.updated_at = Utc::now();
        Ok(next)
    }

    async fn increment_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>> {
        let mut map = write(&self.inner)?;
        let stored = map.get_mut(&(tenant_id, id)).ok_or(StoreError::NotFound)?;
        let next = match stored.current_quantity {
            None => None,
            Some(q) => Some(
                q.checked_add(by)
                    .ok_or_else(|| StoreError::Conflict("quantity overflow".to_string()))?,
            ),
        };
        stored.current_quantity = next;
        stored.updated_at = Utc::now();
        Ok(next)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIssuanceStore {
    inner: TenantMap<IssuanceId, IssuanceRecord>,
}

impl InMemoryIssuanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssuanceStore for InMemoryIssuanceStore {
    async fn insert(&self, record: &IssuanceRecord) -> StoreResult<()> {
        let mut map = write(&self.inner)?;
        let key = key_of(record);
        if map.contains_key(&key) {
            return Err(StoreError::Conflict(format!("issuance {} already exists", record.id)));
        }
        map.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, id: IssuanceId) -> StoreResult<Option<IssuanceRecord>> {
        Ok(read(&self.inner)?.get(&(tenant_id, id)).cloned())
    }

    async fn list(&self, tenant_id: TenantId, filter: &IssuanceFilter) -> StoreResult<Vec<IssuanceRecord>> {
        let map = read(&self.inner)?;
        let mut out: Vec<_> = map
            .iter()
            .filter(|((t, _), r)| *t == tenant_id && filter.matches(r))
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| b.issue_date.cmp(&a.issue_date).then(b.created_at.cmp(&a.created_at)));
        Ok(out)
    }

    async fn link_fee_item(&self, tenant_id: TenantId, id: IssuanceId, item_id: InvoiceItemId) -> StoreResult<()> {
        let mut map = write(&self.inner)?;
        let stored = map.get_mut(&(tenant_id, id)).ok_or(StoreError::NotFound)?;
        stored.fee_invoice_item_id = Some(item_id);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn find_by_fee_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<IssuanceId>> {
        Ok(read(&self.inner)?
            .iter()
            .find(|((t, _), r)| *t == tenant_id && r.fee_invoice_item_id == Some(item_id))
            .map(|(_, r)| r.id))
    }

    async fn close(&self, record: &IssuanceRecord) -> StoreResult<bool> {
        let mut map = write(&self.inner)?;
        let stored = map
            .get_mut(&key_of(record))
            .ok_or(StoreError::NotFound)?;
        if stored.status != IssuanceStatus::Issued {
            return Ok(false);
        }
        stored.status = record.status;
        stored.returned_date = record.returned_date;
        stored.return_notes = record.return_notes.clone();
        stored.updated_at = record.updated_at;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryInvoices {
    inner: TenantMap<InvoiceId, FeeInvoice>,
}

impl InMemoryInvoices {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceService for InMemoryInvoices {
    async fn find_or_create_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<InvoiceId> {
        let mut map = write(&self.inner)?;
        if let Some(existing) = map
            .iter()
            .find(|((t, _), inv)| *t == tenant_id && inv.key() == key)
            .map(|(_, inv)| inv.id_typed())
        {
            return Ok(existing);
        }
        let invoice = FeeInvoice::open(tenant_id, key.clone(), Utc::now());
        let id = invoice.id_typed();
        map.insert((tenant_id, id), invoice);
        Ok(id)
    }

    async fn add_items(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        items: Vec<NewInvoiceItem>,
    ) -> StoreResult<Vec<FeeInvoiceItem>> {
        let mut map = write(&self.inner)?;
        let invoice = map.get_mut(&(tenant_id, invoice_id)).ok_or(StoreError::NotFound)?;
        Ok(invoice.add_items(items, Utc::now())?)
    }

    async fn find_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<Option<FeeInvoice>> {
        let map = read(&self.inner)?;
        Ok(map
            .iter()
            .find(|((t, _), inv)| *t == tenant_id && inv.key() == key)
            .map(|(_, inv)| inv.clone()))
    }

    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> StoreResult<Option<FeeInvoice>> {
        Ok(read(&self.inner)?.get(&(tenant_id, invoice_id)).cloned())
    }

    async fn find_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<FeeInvoiceItem>> {
        let map = read(&self.inner)?;
        Ok(map
            .iter()
            .filter(|((t, _), _)| *t == tenant_id)
            .find_map(|(_, inv)| inv.item(item_id).cloned()))
    }

    async fn remove_item(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    ) -> StoreResult<FeeInvoice> {
        let mut map = write(&self.inner)?;
        let invoice = map.get_mut(&(tenant_id, invoice_id)).ok_or(StoreError::NotFound)?;
        invoice.remove_item(item_id, Utc::now()).map_err(|e| match e {
            schoolops_core::DomainError::NotFound => StoreError::NotFound,
            other => StoreError::Domain(other),
        })?;
        Ok(invoice.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use schoolops_core::{Money, PersonId, UserId};
    use schoolops_inventory::{IssueTo, PolicyDraft};
    use schoolops_invoicing::{AcademicYear, BillingPeriod};

    fn policy(tenant_id: TenantId, stock: Option<u32>) -> InventoryItemPolicy {
        InventoryItemPolicy::create(
            tenant_id,
            PolicyDraft {
                name: "Geometry Box".into(),
                tracks_quantity: true,
                current_quantity: stock,
                can_be_issued: true,
                issue_to: Some(IssueTo::Both),
                unit_cost: Some(Money::new(dec!(4)).unwrap()),
                ..PolicyDraft::default()
            },
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn conditional_decrement_never_goes_negative() {
        let store = InMemoryPolicyStore::new();
        let tenant = TenantId::new();
        let p = policy(tenant, Some(3));
        store.insert(&p).await.unwrap();

        assert_eq!(store.decrement_quantity(tenant, p.id, 2).await.unwrap(), Some(1));
        let err = store.decrement_quantity(tenant, p.id, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientQuantity { requested: 2 }));
        assert_eq!(store.get(tenant, p.id).await.unwrap().unwrap().current_quantity, Some(1));
        assert_eq!(store.increment_quantity(tenant, p.id, 2).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn unknown_count_stays_unknown() {
        let store = InMemoryPolicyStore::new();
        let tenant = TenantId::new();
        let p = policy(tenant, None);
        store.insert(&p).await.unwrap();
        assert_eq!(store.decrement_quantity(tenant, p.id, 5).await.unwrap(), None);
        assert_eq!(store.increment_quantity(tenant, p.id, 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_does_not_touch_quantity() {
        let store = InMemoryPolicyStore::new();
        let tenant = TenantId::new();
        let mut p = policy(tenant, Some(10));
        store.insert(&p).await.unwrap();
        store.decrement_quantity(tenant, p.id, 4).await.unwrap();

        p.name = "Compass Set".into();
        store.update(&p).await.unwrap();
        let stored = store.get(tenant, p.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Compass Set");
        assert_eq!(stored.current_quantity, Some(6));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = InMemoryPolicyStore::new();
        let tenant = TenantId::new();
        let p = policy(tenant, Some(1));
        store.insert(&p).await.unwrap();

        let other = TenantId::new();
        assert!(store.get(other, p.id).await.unwrap().is_none());
        assert!(store.list(other).await.unwrap().is_empty());
        assert!(matches!(
            store.decrement_quantity(other, p.id, 1).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn invoices_are_found_or_created_once_per_key() {
        let invoices = InMemoryInvoices::new();
        let tenant = TenantId::new();
        let key = InvoiceKey {
            student_id: PersonId::new(),
            academic_year: AcademicYear::new(2026),
            billing_period: BillingPeriod::new("2026-10"),
        };

        let first = invoices.find_or_create_invoice(tenant, &key).await.unwrap();
        let second = invoices.find_or_create_invoice(tenant, &key).await.unwrap();
        assert_eq!(first, second);

        let created = invoices
            .add_items(
                tenant,
                first,
                vec![NewInvoiceItem {
                    label: "Tie (x1)".into(),
                    amount: dec!(12),
                    category: None,
                    source_ref: None,
                }],
            )
            .await
            .unwrap();
        let item = invoices.find_item(tenant, created[0].id).await.unwrap().unwrap();
        assert_eq!(item.invoice_id, first);

        let after = invoices.remove_item(tenant, first, item.id).await.unwrap();
        assert_eq!(after.total_amount(), dec!(0));
        assert!(matches!(
            invoices.remove_item(tenant, first, item.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn close_is_conditional_on_issued() {
        use schoolops_inventory::{IssuanceEffects, IssuanceRequest, RecipientType};

        let store = InMemoryIssuanceStore::new();
        let request = IssuanceRequest {
            issued_to_type: RecipientType::Staff,
            issued_to_id: PersonId::new(),
            quantity: 1,
            serial_number: Some("GB-0042".into()),
            charge_amount_override: None,
        };
        let effects = IssuanceEffects {
            quantity: 1,
            decrement_stock: true,
            charge: None,
            attach_fee: false,
            fee_category: None,
            expected_return_date: None,
        };
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let record = IssuanceRecord::issue(
            TenantId::new(),
            PolicyId::generate(),
            &request,
            &effects,
            today,
            UserId::new(),
            Utc::now(),
        );
        store.insert(&record).await.unwrap();

        let mut returned = record.clone();
        returned.close(false, None, today, Utc::now()).unwrap();
        let mut lost = record.clone();
        lost.close(true, None, today, Utc::now()).unwrap();

        assert!(store.close(&returned).await.unwrap());
        assert!(!store.close(&lost).await.unwrap());
        let stored = store.get(record.tenant_id, record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IssuanceStatus::Returned);
    }

    #[tokio::test]
    async fn issuances_are_found_by_their_fee_line() {
        use schoolops_inventory::{IssuanceEffects, IssuanceRequest, RecipientType};

        let store = InMemoryIssuanceStore::new();
        let request = IssuanceRequest {
            issued_to_type: RecipientType::Student,
            issued_to_id: PersonId::new(),
            quantity: 1,
            serial_number: None,
            charge_amount_override: None,
        };
        let effects = IssuanceEffects {
            quantity: 1,
            decrement_stock: false,
            charge: None,
            attach_fee: false,
            fee_category: None,
            expected_return_date: None,
        };
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let record = IssuanceRecord::issue(
            TenantId::new(),
            PolicyId::generate(),
            &request,
            &effects,
            today,
            UserId::new(),
            Utc::now(),
        );
        store.insert(&record).await.unwrap();

        let item_id = InvoiceItemId::generate();
        assert_eq!(store.find_by_fee_item(record.tenant_id, item_id).await.unwrap(), None);
        store.link_fee_item(record.tenant_id, record.id, item_id).await.unwrap();
        assert_eq!(
            store.find_by_fee_item(record.tenant_id, item_id).await.unwrap(),
            Some(record.id)
        );
        assert_eq!(store.find_by_fee_item(TenantId::new(), item_id).await.unwrap(), None);
    }
}
