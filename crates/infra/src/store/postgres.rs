//! Postgres-backed stores.
//!
//! Tenant isolation: every statement filters on `tenant_id`, and every table
//! uses `(tenant_id, id)` as its primary key.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `StoreError` |
//! |------------|---------------|--------------|
//! | unique violation | `23505` | `Conflict` |
//! | foreign key violation | `23503` | `Conflict` |
//! | check violation | `23514` | `Conflict` |
//! | other database error | any | `Backend` |
//! | `RowNotFound` | n/a | `NotFound` |
//! | pool closed, IO, TLS | n/a | `Backend` |

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use schoolops_core::{DomainError, Money, PersonId, TenantId, UserId};
use schoolops_inventory::{
    ChargeType, InventoryItemPolicy, IssuanceFilter, IssuanceId, IssuanceRecord, IssuanceStatus,
    IssueTo, PolicyId, RecipientType,
};
use schoolops_invoicing::{
    AcademicYear, BillingPeriod, FeeCategory, FeeInvoice, FeeInvoiceItem, InvoiceId,
    InvoiceItemId, InvoiceKey, NewInvoiceItem,
};

use super::{IssuanceStore, PolicyStore, StoreError, StoreResult};
use crate::invoice_service::InvoiceService;

const SCHEMA: &str = include_str!("../../migrations/0001_inventory.sql");

/// Create the schema if it does not exist yet. Idempotent.
#[instrument(skip(pool), err)]
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("run_migrations", e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))
}

fn opt_u32(row: &PgRow, name: &str) -> StoreResult<Option<u32>> {
    let raw: Option<i32> = col(row, name)?;
    raw.map(|n| u32::try_from(n).map_err(|_| StoreError::Corrupt(format!("{name} is negative: {n}"))))
        .transpose()
}

fn opt_money(row: &PgRow, name: &str) -> StoreResult<Option<Money>> {
    let raw: Option<Decimal> = col(row, name)?;
    raw.map(Money::new)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))
}

fn opt_enum<T>(row: &PgRow, name: &str, parse: fn(&str) -> Option<T>) -> StoreResult<Option<T>> {
    let raw: Option<String> = col(row, name)?;
    raw.map(|s| parse(&s).ok_or_else(|| StoreError::Corrupt(format!("{name}: unknown value '{s}'"))))
        .transpose()
}

fn req_enum<T>(row: &PgRow, name: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
    opt_enum(row, name, parse)?.ok_or_else(|| StoreError::Corrupt(format!("{name} is null")))
}

fn to_i32(value: u32, name: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Domain(DomainError::validation(name, "value too large")))
}

fn opt_i32(value: Option<u32>, name: &str) -> StoreResult<Option<i32>> {
    value.map(|v| to_i32(v, name)).transpose()
}

// ---------------------------------------------------------------------------
// Policies

const POLICY_COLUMNS: &str = r#"
    tenant_id, id, name, description,
    tracks_quantity, current_quantity, low_stock_threshold, tracks_serially,
    can_be_issued, issue_to, must_be_returned, return_duration_days,
    is_chargeable, charge_type, charge_amount, auto_add_to_fees, fee_category,
    unit_cost, allow_price_override, internal_notes,
    is_active, created_by, created_at, updated_at
"#;

fn policy_from_row(row: &PgRow) -> StoreResult<InventoryItemPolicy> {
    Ok(InventoryItemPolicy {
        id: PolicyId::from(col::<Uuid>(row, "id")?),
        tenant_id: TenantId::from_uuid(col(row, "tenant_id")?),
        name: col(row, "name")?,
        description: col(row, "description")?,
        tracks_quantity: col(row, "tracks_quantity")?,
        current_quantity: opt_u32(row, "current_quantity")?,
        low_stock_threshold: opt_u32(row, "low_stock_threshold")?,
        tracks_serially: col(row, "tracks_serially")?,
        can_be_issued: col(row, "can_be_issued")?,
        issue_to: opt_enum(row, "issue_to", IssueTo::parse)?,
        must_be_returned: col(row, "must_be_returned")?,
        return_duration_days: opt_u32(row, "return_duration_days")?,
        is_chargeable: col(row, "is_chargeable")?,
        charge_type: opt_enum(row, "charge_type", ChargeType::parse)?,
        charge_amount: opt_money(row, "charge_amount")?,
        auto_add_to_fees: col(row, "auto_add_to_fees")?,
        fee_category: opt_enum(row, "fee_category", FeeCategory::parse)?,
        unit_cost: opt_money(row, "unit_cost")?,
        allow_price_override: col(row, "allow_price_override")?,
        internal_notes: col(row, "internal_notes")?,
        is_active: col(row, "is_active")?,
        created_by: UserId::from_uuid(col(row, "created_by")?),
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgPolicyStore {
    pool: Arc<PgPool>,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn exists(&self, tenant_id: TenantId, id: PolicyId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM inventory_policies WHERE tenant_id = $1 AND id = $2")
            .bind(*tenant_id.as_uuid())
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("policy_exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    #[instrument(skip(self, policy), fields(tenant_id = %policy.tenant_id, policy_id = %policy.id), err)]
    async fn insert(&self, policy: &InventoryItemPolicy) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_policies (
                tenant_id, id, name, description,
                tracks_quantity, current_quantity, low_stock_threshold, tracks_serially,
                can_be_issued, issue_to, must_be_returned, return_duration_days,
                is_chargeable, charge_type, charge_amount, auto_add_to_fees, fee_category,
                unit_cost, allow_price_override, internal_notes,
                is_active, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(*policy.tenant_id.as_uuid())
        .bind(*policy.id.as_uuid())
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(policy.tracks_quantity)
        .bind(opt_i32(policy.current_quantity, "current_quantity")?)
        .bind(opt_i32(policy.low_stock_threshold, "low_stock_threshold")?)
        .bind(policy.tracks_serially)
        .bind(policy.can_be_issued)
        .bind(policy.issue_to.map(|v| v.as_str()))
        .bind(policy.must_be_returned)
        .bind(opt_i32(policy.return_duration_days, "return_duration_days")?)
        .bind(policy.is_chargeable)
        .bind(policy.charge_type.map(|v| v.as_str()))
        .bind(policy.charge_amount.map(|m| m.amount()))
        .bind(policy.auto_add_to_fees)
        .bind(policy.fee_category.map(|v| v.as_str()))
        .bind(policy.unit_cost.map(|m| m.amount()))
        .bind(policy.allow_price_override)
        .bind(&policy.internal_notes)
        .bind(policy.is_active)
        .bind(*policy.created_by.as_uuid())
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_policy", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, policy_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: PolicyId) -> StoreResult<Option<InventoryItemPolicy>> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM inventory_policies WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_policy", e))?;
        row.as_ref().map(policy_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId) -> StoreResult<Vec<InventoryItemPolicy>> {
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM inventory_policies WHERE tenant_id = $1 ORDER BY name, created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_policies", e))?;
        rows.iter().map(policy_from_row).collect()
    }

    #[instrument(skip(self, policy), fields(tenant_id = %policy.tenant_id, policy_id = %policy.id), err)]
    async fn update(&self, policy: &InventoryItemPolicy) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_policies SET
                name = $3, description = $4,
                tracks_quantity = $5, low_stock_threshold = $6, tracks_serially = $7,
                can_be_issued = $8, issue_to = $9, must_be_returned = $10, return_duration_days = $11,
                is_chargeable = $12, charge_type = $13, charge_amount = $14,
                auto_add_to_fees = $15, fee_category = $16,
                unit_cost = $17, allow_price_override = $18, internal_notes = $19,
                is_active = $20, updated_at = $21
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(*policy.tenant_id.as_uuid())
        .bind(*policy.id.as_uuid())
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(policy.tracks_quantity)
        .bind(opt_i32(policy.low_stock_threshold, "low_stock_threshold")?)
        .bind(policy.tracks_serially)
        .bind(policy.can_be_issued)
        .bind(policy.issue_to.map(|v| v.as_str()))
        .bind(policy.must_be_returned)
        .bind(opt_i32(policy.return_duration_days, "return_duration_days")?)
        .bind(policy.is_chargeable)
        .bind(policy.charge_type.map(|v| v.as_str()))
        .bind(policy.charge_amount.map(|m| m.amount()))
        .bind(policy.auto_add_to_fees)
        .bind(policy.fee_category.map(|v| v.as_str()))
        .bind(policy.unit_cost.map(|m| m.amount()))
        .bind(policy.allow_price_override)
        .bind(&policy.internal_notes)
        .bind(policy.is_active)
        .bind(policy.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_policy", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, policy_id = %id), err)]
    async fn set_quantity(&self, tenant_id: TenantId, id: PolicyId, quantity: Option<u32>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE inventory_policies SET current_quantity = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .bind(opt_i32(quantity, "current_quantity")?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_quantity", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, policy_id = %id), err)]
    async fn decrement_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>> {
        let row = sqlx::query(
            r#"
            UPDATE inventory_policies
            SET current_quantity = current_quantity - $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
              AND (current_quantity IS NULL OR current_quantity >= $3)
            RETURNING current_quantity
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .bind(to_i32(by, "quantity")?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("decrement_quantity", e))?;

        match row {
            Some(row) => opt_u32(&row, "current_quantity"),
            None if self.exists(tenant_id, id).await? => {
                Err(StoreError::InsufficientQuantity { requested: by })
            }
            None => Err(StoreError::NotFound),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, policy_id = %id), err)]
    async fn increment_quantity(&self, tenant_id: TenantId, id: PolicyId, by: u32) -> StoreResult<Option<u32>> {
        let row = sqlx::query(
            r#"
            UPDATE inventory_policies
            SET current_quantity = current_quantity + $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            RETURNING current_quantity
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .bind(to_i32(by, "quantity")?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_quantity", e))?;

        match row {
            Some(row) => opt_u32(&row, "current_quantity"),
            None => Err(StoreError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Issuances

const ISSUANCE_COLUMNS: &str = r#"
    tenant_id, id, policy_id, issued_to_type, issued_to_id, quantity, serial_number,
    issue_date, expected_return_date, returned_date, charge_amount, charge_type, status,
    fee_expected, fee_invoice_item_id, return_notes, issued_by, created_at, updated_at
"#;

fn issuance_from_row(row: &PgRow) -> StoreResult<IssuanceRecord> {
    let quantity: i32 = col(row, "quantity")?;
    let fee_item: Option<Uuid> = col(row, "fee_invoice_item_id")?;
    Ok(IssuanceRecord {
        id: IssuanceId::from(col::<Uuid>(row, "id")?),
        tenant_id: TenantId::from_uuid(col(row, "tenant_id")?),
        policy_id: PolicyId::from(col::<Uuid>(row, "policy_id")?),
        issued_to_type: req_enum(row, "issued_to_type", RecipientType::parse)?,
        issued_to_id: PersonId::from_uuid(col(row, "issued_to_id")?),
        quantity: u32::try_from(quantity)
            .map_err(|_| StoreError::Corrupt(format!("quantity is negative: {quantity}")))?,
        serial_number: col(row, "serial_number")?,
        issue_date: col::<NaiveDate>(row, "issue_date")?,
        expected_return_date: col(row, "expected_return_date")?,
        returned_date: col(row, "returned_date")?,
        charge_amount: opt_money(row, "charge_amount")?,
        charge_type: opt_enum(row, "charge_type", ChargeType::parse)?,
        status: req_enum(row, "status", IssuanceStatus::parse)?,
        fee_expected: col(row, "fee_expected")?,
        fee_invoice_item_id: fee_item.map(InvoiceItemId::from),
        return_notes: col(row, "return_notes")?,
        issued_by: UserId::from_uuid(col(row, "issued_by")?),
        created_at: col::<DateTime<Utc>>(row, "created_at")?,
        updated_at: col::<DateTime<Utc>>(row, "updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgIssuanceStore {
    pool: Arc<PgPool>,
}

impl PgIssuanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl IssuanceStore for PgIssuanceStore {
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, issuance_id = %record.id), err)]
    async fn insert(&self, record: &IssuanceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_issuances (
                tenant_id, id, policy_id, issued_to_type, issued_to_id, quantity, serial_number,
                issue_date, expected_return_date, returned_date, charge_amount, charge_type, status,
                fee_expected, fee_invoice_item_id, return_notes, issued_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(*record.tenant_id.as_uuid())
        .bind(*record.id.as_uuid())
        .bind(*record.policy_id.as_uuid())
        .bind(record.issued_to_type.as_str())
        .bind(*record.issued_to_id.as_uuid())
        .bind(to_i32(record.quantity, "quantity")?)
        .bind(&record.serial_number)
        .bind(record.issue_date)
        .bind(record.expected_return_date)
        .bind(record.returned_date)
        .bind(record.charge_amount.map(|m| m.amount()))
        .bind(record.charge_type.map(|v| v.as_str()))
        .bind(record.status.as_str())
        .bind(record.fee_expected)
        .bind(record.fee_invoice_item_id.map(|i| *i.as_uuid()))
        .bind(&record.return_notes)
        .bind(*record.issued_by.as_uuid())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_issuance", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, issuance_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: IssuanceId) -> StoreResult<Option<IssuanceRecord>> {
        let sql = format!("SELECT {ISSUANCE_COLUMNS} FROM inventory_issuances WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_issuance", e))?;
        row.as_ref().map(issuance_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId, filter: &IssuanceFilter) -> StoreResult<Vec<IssuanceRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ISSUANCE_COLUMNS} FROM inventory_issuances WHERE tenant_id = "
        ));
        qb.push_bind(*tenant_id.as_uuid());

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(policy_id) = filter.policy_id {
            qb.push(" AND policy_id = ").push_bind(*policy_id.as_uuid());
        }
        if let Some(kind) = filter.issued_to_type {
            qb.push(" AND issued_to_type = ").push_bind(kind.as_str());
        }
        if let Some(person) = filter.issued_to_id {
            qb.push(" AND issued_to_id = ").push_bind(*person.as_uuid());
        }
        if let Some(as_of) = filter.overdue_as_of {
            qb.push(" AND status = 'issued' AND expected_return_date < ")
                .push_bind(as_of);
        }
        qb.push(" ORDER BY issue_date DESC, created_at DESC");

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_issuances", e))?;
        rows.iter().map(issuance_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, issuance_id = %id, item_id = %item_id), err)]
    async fn link_fee_item(&self, tenant_id: TenantId, id: IssuanceId, item_id: InvoiceItemId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_issuances SET fee_invoice_item_id = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .bind(*item_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("link_fee_item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, item_id = %item_id), err)]
    async fn find_by_fee_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<IssuanceId>> {
        let row = sqlx::query(
            "SELECT id FROM inventory_issuances WHERE tenant_id = $1 AND fee_invoice_item_id = $2 LIMIT 1",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*item_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_issuance_by_fee_item", e))?;
        row.map(|r| col::<Uuid>(&r, "id").map(IssuanceId::from)).transpose()
    }

    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, issuance_id = %record.id), err)]
    async fn close(&self, record: &IssuanceRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_issuances
            SET status = $3, returned_date = $4, return_notes = $5, updated_at = $6
            WHERE tenant_id = $1 AND id = $2 AND status = 'issued'
            "#,
        )
        .bind(*record.tenant_id.as_uuid())
        .bind(*record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.returned_date)
        .bind(&record.return_notes)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("close_issuance", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(record.tenant_id, record.id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Invoices

fn item_from_row(row: &PgRow) -> StoreResult<FeeInvoiceItem> {
    Ok(FeeInvoiceItem {
        id: InvoiceItemId::from(col::<Uuid>(row, "id")?),
        invoice_id: InvoiceId::from(col::<Uuid>(row, "invoice_id")?),
        label: col(row, "label")?,
        amount: col(row, "amount")?,
        category: opt_enum(row, "category", FeeCategory::parse)?,
        source_ref: col(row, "source_ref")?,
        created_at: col(row, "created_at")?,
    })
}

const ITEM_COLUMNS: &str = "id, invoice_id, label, amount, category, source_ref, created_at";

/// Load an invoice with its items. `lock` takes a row lock for the
/// surrounding transaction.
async fn load_invoice(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    invoice_id: InvoiceId,
    lock: bool,
) -> StoreResult<Option<FeeInvoice>> {
    let sql = format!(
        r#"
        SELECT id, tenant_id, student_id, academic_year, billing_period, total_amount, created_at, updated_at
        FROM fee_invoices WHERE tenant_id = $1 AND id = $2 {}
        "#,
        if lock { "FOR UPDATE" } else { "" }
    );
    let Some(row) = sqlx::query(&sql)
        .bind(*tenant_id.as_uuid())
        .bind(*invoice_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_invoice", e))?
    else {
        return Ok(None);
    };

    let item_sql = format!(
        "SELECT {ITEM_COLUMNS} FROM fee_invoice_items WHERE tenant_id = $1 AND invoice_id = $2 ORDER BY created_at, id"
    );
    let item_rows = sqlx::query(&item_sql)
        .bind(*tenant_id.as_uuid())
        .bind(*invoice_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_invoice_items", e))?;
    let items = item_rows.iter().map(item_from_row).collect::<StoreResult<Vec<_>>>()?;

    let academic_year: String = col(&row, "academic_year")?;
    let key = InvoiceKey {
        student_id: PersonId::from_uuid(col(&row, "student_id")?),
        academic_year: academic_year
            .parse::<AcademicYear>()
            .map_err(|e| StoreError::Corrupt(format!("academic_year: {e}")))?,
        billing_period: BillingPeriod::new(col::<String>(&row, "billing_period")?),
    };

    FeeInvoice::rehydrate(
        invoice_id,
        tenant_id,
        key,
        items,
        col(&row, "total_amount")?,
        col(&row, "created_at")?,
        col(&row, "updated_at")?,
    )
    .map(Some)
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Recompute `total_amount` from the current item set.
async fn recompute_total(conn: &mut PgConnection, tenant_id: TenantId, invoice_id: InvoiceId) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE fee_invoices SET
            total_amount = (
                SELECT COALESCE(SUM(amount), 0) FROM fee_invoice_items
                WHERE tenant_id = $1 AND invoice_id = $2
            ),
            updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(*tenant_id.as_uuid())
    .bind(*invoice_id.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("recompute_total", e))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgInvoices {
    pool: Arc<PgPool>,
}

impl PgInvoices {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl InvoiceService for PgInvoices {
    #[instrument(skip(self, key), fields(tenant_id = %tenant_id, student_id = %key.student_id, period = %key.billing_period), err)]
    async fn find_or_create_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<InvoiceId> {
        let fresh = FeeInvoice::open(tenant_id, key.clone(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO fee_invoices (tenant_id, id, student_id, academic_year, billing_period, total_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            ON CONFLICT (tenant_id, student_id, academic_year, billing_period) DO NOTHING
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*fresh.id_typed().as_uuid())
        .bind(*key.student_id.as_uuid())
        .bind(key.academic_year.label())
        .bind(key.billing_period.as_str())
        .bind(fresh.created_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_invoice", e))?;

        let row = sqlx::query(
            r#"
            SELECT id FROM fee_invoices
            WHERE tenant_id = $1 AND student_id = $2 AND academic_year = $3 AND billing_period = $4
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*key.student_id.as_uuid())
        .bind(key.academic_year.label())
        .bind(key.billing_period.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_invoice_id", e))?;
        Ok(InvoiceId::from(col::<Uuid>(&row, "id")?))
    }

    #[instrument(skip(self, items), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, count = items.len()), err)]
    async fn add_items(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        items: Vec<NewInvoiceItem>,
    ) -> StoreResult<Vec<FeeInvoiceItem>> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        let mut invoice = load_invoice(&mut tx, tenant_id, invoice_id, true)
            .await?
            .ok_or(StoreError::NotFound)?;
        let billed: HashSet<InvoiceItemId> = invoice.items().iter().map(|i| i.id).collect();
        let lines = invoice.add_items(items, Utc::now())?;

        // Lines already billed under the same source_ref come back without a new row.
        for item in lines.iter().filter(|i| !billed.contains(&i.id)) {
            sqlx::query(
                r#"
                INSERT INTO fee_invoice_items (tenant_id, id, invoice_id, label, amount, category, source_ref, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(*tenant_id.as_uuid())
            .bind(*item.id.as_uuid())
            .bind(*invoice_id.as_uuid())
            .bind(&item.label)
            .bind(item.amount)
            .bind(item.category.map(|c| c.as_str()))
            .bind(&item.source_ref)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_invoice_item", e))?;
        }

        recompute_total(&mut tx, tenant_id, invoice_id).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(lines)
    }

    #[instrument(skip(self, key), fields(tenant_id = %tenant_id, student_id = %key.student_id, period = %key.billing_period), err)]
    async fn find_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<Option<FeeInvoice>> {
        let mut conn = self.pool.acquire().await.map_err(|e| map_sqlx_error("acquire", e))?;
        let row = sqlx::query(
            r#"
            SELECT id FROM fee_invoices
            WHERE tenant_id = $1 AND student_id = $2 AND academic_year = $3 AND billing_period = $4
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*key.student_id.as_uuid())
        .bind(key.academic_year.label())
        .bind(key.billing_period.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_invoice", e))?;

        match row {
            Some(row) => {
                let id = InvoiceId::from(col::<Uuid>(&row, "id")?);
                load_invoice(&mut conn, tenant_id, id, false).await
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> StoreResult<Option<FeeInvoice>> {
        let mut conn = self.pool.acquire().await.map_err(|e| map_sqlx_error("acquire", e))?;
        load_invoice(&mut conn, tenant_id, invoice_id, false).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, item_id = %item_id), err)]
    async fn find_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<FeeInvoiceItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM fee_invoice_items WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(*item_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_invoice_item", e))?;
        row.as_ref().map(item_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, item_id = %item_id), err)]
    async fn remove_item(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    ) -> StoreResult<FeeInvoice> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        if load_invoice(&mut tx, tenant_id, invoice_id, true).await?.is_none() {
            return Err(StoreError::NotFound);
        }

        let deleted = sqlx::query(
            "DELETE FROM fee_invoice_items WHERE tenant_id = $1 AND invoice_id = $2 AND id = $3",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*invoice_id.as_uuid())
        .bind(*item_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_invoice_item", e))?;

        if deleted.rows_affected() == 0 {
            warn!(%tenant_id, %invoice_id, %item_id, "invoice item already gone");
            return Err(StoreError::NotFound);
        }

        recompute_total(&mut tx, tenant_id, invoice_id).await?;
        let invoice = load_invoice(&mut tx, tenant_id, invoice_id, false)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(invoice)
    }
}
