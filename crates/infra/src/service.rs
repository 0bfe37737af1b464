//! `InventoryService`: the capability-checked entry point for every
//! inventory operation. Transport layers call this and nothing below it.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use schoolops_auth::{AuthzError, CapabilityGuard, Permission, Principal};
use schoolops_core::{DomainError, TenantId};
use schoolops_inventory::{
    InventoryItemPolicy, IssuanceFilter, IssuanceId, IssuanceRecord, IssuanceRejection,
    IssuanceRequest, IssuanceStatus, PolicyDraft, PolicyId, PolicyPatch, ReturnRequest,
};
use schoolops_invoicing::{BillingCalendar, InvoiceId};

use crate::config::AppConfig;
use crate::invoice_service::InvoiceService;
use crate::issuance::{
    IssuanceError, IssuanceExecutor, IssuanceOutcome, IssueCommand, ReturnCommand, ReturnError,
    ReturnExecutor, ReturnOutcome, ReversalConfig,
};
use crate::retry::RetryPolicy;
use crate::store::{IssuanceStore, PolicyStore, StoreError, Stores};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Unauthorized(#[from] AuthzError),

    #[error(transparent)]
    Validation(DomainError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Rejected(#[from] IssuanceRejection),

    #[error("issuance {issuance_id} is already {}", .status.as_str())]
    AlreadyReturned {
        issuance_id: IssuanceId,
        status: IssuanceStatus,
    },

    #[error("fee reversal failed for issuance {issuance_id}: {reason}")]
    ReversalFailed {
        issuance_id: IssuanceId,
        invoice_id: Option<InvoiceId>,
        reason: String,
    },

    #[error("issuance {issuance_id} recorded but stock was not decremented: {reason}")]
    StockNotDecremented {
        issuance_id: IssuanceId,
        reason: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(StoreError),
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => ServiceError::NotFound("record"),
            other => ServiceError::Validation(other),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound("record"),
            StoreError::Domain(e) => e.into(),
            other => ServiceError::Persistence(other),
        }
    }
}

impl From<IssuanceError> for ServiceError {
    fn from(err: IssuanceError) -> Self {
        match err {
            IssuanceError::PolicyNotFound => ServiceError::NotFound("policy"),
            IssuanceError::Rejected(r) => ServiceError::Rejected(r),
            IssuanceError::Persistence(e) => e.into(),
            IssuanceError::StockNotDecremented { issuance_id, source } => {
                ServiceError::StockNotDecremented {
                    issuance_id,
                    reason: source.to_string(),
                }
            }
        }
    }
}

impl From<ReturnError> for ServiceError {
    fn from(err: ReturnError) -> Self {
        match err {
            ReturnError::NotFound(what) => ServiceError::NotFound(what),
            ReturnError::AlreadyReturned { issuance_id, status } => {
                ServiceError::AlreadyReturned { issuance_id, status }
            }
            ReturnError::ReversalFailed {
                issuance_id,
                invoice_id,
                reason,
            } => ServiceError::ReversalFailed {
                issuance_id,
                invoice_id,
                reason,
            },
            ReturnError::Persistence(e) => e.into(),
        }
    }
}

pub struct InventoryService {
    guard: Arc<dyn CapabilityGuard>,
    policies: Arc<dyn PolicyStore>,
    issuances: Arc<dyn IssuanceStore>,
    invoices: Arc<dyn InvoiceService>,
    issuer: IssuanceExecutor,
    returns: ReturnExecutor,
}

impl InventoryService {
    pub fn new(
        guard: Arc<dyn CapabilityGuard>,
        stores: Stores,
        calendar: BillingCalendar,
        fee_retry: RetryPolicy,
        reversal: ReversalConfig,
    ) -> Self {
        let issuer = IssuanceExecutor::new(
            stores.policies.clone(),
            stores.issuances.clone(),
            stores.invoices.clone(),
            calendar,
        )
        .with_fee_retry(fee_retry);
        let returns = ReturnExecutor::new(
            stores.policies.clone(),
            stores.issuances.clone(),
            stores.invoices.clone(),
            calendar,
            reversal,
        );
        Self {
            guard,
            policies: stores.policies,
            issuances: stores.issuances,
            invoices: stores.invoices,
            issuer,
            returns,
        }
    }

    pub fn from_config(guard: Arc<dyn CapabilityGuard>, stores: Stores, config: &AppConfig) -> Self {
        Self::new(
            guard,
            stores,
            config.calendar,
            config.fee_attach_retry.clone(),
            config.reversal,
        )
    }

    /// Invoice collaborator, for read-side callers that show fee state.
    pub fn invoices(&self) -> &Arc<dyn InvoiceService> {
        &self.invoices
    }

    fn tenant_for(&self, principal: &Principal, capability: Permission) -> Result<TenantId, ServiceError> {
        Ok(self.guard.assert_capability(principal, &capability)?)
    }

    async fn load_policy(&self, tenant_id: TenantId, id: PolicyId) -> Result<InventoryItemPolicy, ServiceError> {
        self.policies
            .get(tenant_id, id)
            .await?
            .ok_or(ServiceError::NotFound("policy"))
    }

    #[instrument(skip(self, principal, draft), fields(principal_id = %principal.principal_id), err)]
    pub async fn create_policy(
        &self,
        principal: &Principal,
        draft: PolicyDraft,
    ) -> Result<InventoryItemPolicy, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_CREATE)?;
        let policy = InventoryItemPolicy::create(
            tenant_id,
            draft,
            principal.principal_id.user_id(),
            Utc::now(),
        )?;
        self.policies.insert(&policy).await?;
        info!(%tenant_id, policy_id = %policy.id, name = %policy.name, "policy created");
        Ok(policy)
    }

    pub async fn list_policies(&self, principal: &Principal) -> Result<Vec<InventoryItemPolicy>, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_READ)?;
        Ok(self.policies.list(tenant_id).await?)
    }

    pub async fn get_policy(
        &self,
        principal: &Principal,
        id: PolicyId,
    ) -> Result<InventoryItemPolicy, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_READ)?;
        self.load_policy(tenant_id, id).await
    }

    #[instrument(skip(self, principal, patch), fields(principal_id = %principal.principal_id, policy_id = %id), err)]
    pub async fn update_policy(
        &self,
        principal: &Principal,
        id: PolicyId,
        patch: PolicyPatch,
    ) -> Result<InventoryItemPolicy, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_MANAGE)?;
        let current = self.load_policy(tenant_id, id).await?;
        let sets_quantity = patch.sets_quantity();
        let next = current.patched(patch, Utc::now())?;

        self.policies.update(&next).await?;
        if sets_quantity {
            self.policies
                .set_quantity(tenant_id, id, next.current_quantity)
                .await?;
            info!(%tenant_id, policy_id = %id, quantity = ?next.current_quantity, "stock count corrected");
        }
        self.load_policy(tenant_id, id).await
    }

    /// Soft delete. The policy stays readable and its issuances stay returnable.
    #[instrument(skip(self, principal), fields(principal_id = %principal.principal_id, policy_id = %id), err)]
    pub async fn deactivate_policy(
        &self,
        principal: &Principal,
        id: PolicyId,
    ) -> Result<InventoryItemPolicy, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_MANAGE)?;
        let mut policy = self.load_policy(tenant_id, id).await?;
        policy.deactivate(Utc::now());
        self.policies.update(&policy).await?;
        info!(%tenant_id, policy_id = %id, "policy deactivated");
        Ok(policy)
    }

    pub async fn issue(
        &self,
        principal: &Principal,
        policy_id: PolicyId,
        request: IssuanceRequest,
        issue_date: NaiveDate,
    ) -> Result<IssuanceOutcome, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_MANAGE)?;
        let outcome = self
            .issuer
            .issue(IssueCommand {
                tenant_id,
                policy_id,
                request,
                issue_date,
                issued_by: principal.principal_id.user_id(),
                occurred_at: Utc::now(),
            })
            .await?;
        Ok(outcome)
    }

    pub async fn list_issuances(
        &self,
        principal: &Principal,
        filter: &IssuanceFilter,
    ) -> Result<Vec<IssuanceRecord>, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_READ)?;
        Ok(self.issuances.list(tenant_id, filter).await?)
    }

    pub async fn return_issuance(
        &self,
        principal: &Principal,
        issuance_id: IssuanceId,
        request: ReturnRequest,
        today: NaiveDate,
    ) -> Result<ReturnOutcome, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_MANAGE)?;
        let outcome = self
            .returns
            .return_issuance(ReturnCommand {
                tenant_id,
                issuance_id,
                request,
                today,
                occurred_at: Utc::now(),
            })
            .await?;
        Ok(outcome)
    }

    /// Active, quantity-tracked policies at or below their threshold.
    pub async fn list_low_stock(&self, principal: &Principal) -> Result<Vec<InventoryItemPolicy>, ServiceError> {
        let tenant_id = self.tenant_for(principal, Permission::INVENTORY_READ)?;
        let policies = self.policies.list(tenant_id).await?;
        Ok(policies.into_iter().filter(InventoryItemPolicy::is_low_stock).collect())
    }

    /// Issued records whose expected return date is before `as_of`.
    pub async fn list_overdue(
        &self,
        principal: &Principal,
        as_of: NaiveDate,
    ) -> Result<Vec<IssuanceRecord>, ServiceError> {
        let filter = IssuanceFilter {
            overdue_as_of: Some(as_of),
            ..IssuanceFilter::default()
        };
        let mut overdue = self.list_issuances(principal, &filter).await?;
        overdue.sort_by_key(|r| r.expected_return_date);
        Ok(overdue)
    }
}
