use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use schoolops_core::{TenantId, UserId};
use schoolops_inventory::{
    validate, InventoryItemPolicy, IssuanceEffects, IssuanceId, IssuanceRecord, IssuanceRejection,
    IssuanceRequest, PolicyId,
};
use schoolops_invoicing::{BillingCalendar, InvoiceId, InvoiceItemId, NewInvoiceItem};

use crate::invoice_service::InvoiceService;
use crate::retry::RetryPolicy;
use crate::store::{IssuanceStore, PolicyStore, StoreError};

/// Issue-out request scoped to an authorized tenant and actor.
#[derive(Debug, Clone)]
pub struct IssueCommand {
    pub tenant_id: TenantId,
    pub policy_id: PolicyId,
    pub request: IssuanceRequest,
    pub issue_date: NaiveDate,
    pub issued_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Result of the best-effort fee step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeeAttach {
    NotApplicable,
    Attached {
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct IssuanceOutcome {
    pub record: IssuanceRecord,
    pub fee: FeeAttach,
}

impl IssuanceOutcome {
    pub fn issuance_id(&self) -> IssuanceId {
        self.record.id
    }

    pub fn fee_invoice_item_id(&self) -> Option<InvoiceItemId> {
        self.record.fee_invoice_item_id
    }
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("policy not found")]
    PolicyNotFound,

    #[error(transparent)]
    Rejected(#[from] IssuanceRejection),

    #[error("failed to record issuance: {0}")]
    Persistence(StoreError),

    /// The record exists but stock was not decremented; needs manual reconciliation.
    #[error("issuance {issuance_id} recorded but stock was not decremented: {source}")]
    StockNotDecremented {
        issuance_id: IssuanceId,
        #[source]
        source: StoreError,
    },
}

pub struct IssuanceExecutor {
    policies: Arc<dyn PolicyStore>,
    issuances: Arc<dyn IssuanceStore>,
    invoices: Arc<dyn InvoiceService>,
    calendar: BillingCalendar,
    fee_retry: RetryPolicy,
}

impl IssuanceExecutor {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        issuances: Arc<dyn IssuanceStore>,
        invoices: Arc<dyn InvoiceService>,
        calendar: BillingCalendar,
    ) -> Self {
        Self {
            policies,
            issuances,
            invoices,
            calendar,
            fee_retry: RetryPolicy::no_retry(),
        }
    }

    pub fn with_fee_retry(mut self, policy: RetryPolicy) -> Self {
        self.fee_retry = policy;
        self
    }

    /// Validate against the latest policy snapshot, record the issuance,
    /// decrement stock, then attach the fee.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, policy_id = %cmd.policy_id, quantity = cmd.request.quantity)
    )]
    pub async fn issue(&self, cmd: IssueCommand) -> Result<IssuanceOutcome, IssuanceError> {
        let policy = self
            .policies
            .get(cmd.tenant_id, cmd.policy_id)
            .await
            .map_err(IssuanceError::Persistence)?
            .ok_or(IssuanceError::PolicyNotFound)?;

        let effects = validate(&policy, &cmd.request, cmd.issue_date)?;

        let mut record = IssuanceRecord::issue(
            cmd.tenant_id,
            policy.id,
            &cmd.request,
            &effects,
            cmd.issue_date,
            cmd.issued_by,
            cmd.occurred_at,
        );
        self.issuances
            .insert(&record)
            .await
            .map_err(IssuanceError::Persistence)?;

        if effects.decrement_stock {
            match self
                .policies
                .decrement_quantity(cmd.tenant_id, policy.id, effects.quantity)
                .await
            {
                Ok(remaining) => {
                    info!(issuance_id = %record.id, remaining = ?remaining, "stock decremented");
                }
                Err(source) => {
                    error!(
                        issuance_id = %record.id,
                        error = %source,
                        "issuance recorded without stock decrement; manual reconciliation required"
                    );
                    return Err(IssuanceError::StockNotDecremented {
                        issuance_id: record.id,
                        source,
                    });
                }
            }
        }

        let fee = if effects.attach_fee {
            self.attach_fee(&policy, &mut record, &effects).await
        } else {
            FeeAttach::NotApplicable
        };

        info!(issuance_id = %record.id, fee = ?fee, "item issued");
        Ok(IssuanceOutcome { record, fee })
    }

    async fn attach_fee(
        &self,
        policy: &InventoryItemPolicy,
        record: &mut IssuanceRecord,
        effects: &IssuanceEffects,
    ) -> FeeAttach {
        let Some(charge) = effects.charge else {
            return FeeAttach::NotApplicable;
        };
        let key = self.calendar.key_for(record.issued_to_id, record.issue_date);
        let line = NewInvoiceItem {
            label: policy.fee_label(effects.quantity),
            amount: charge.total.amount(),
            category: effects.fee_category,
            source_ref: Some(record.fee_source_ref()),
        };
        let tenant_id = record.tenant_id;

        // The line is keyed by the issuance, so a retry after an append that
        // committed but lost its response gets the billed line back.
        let added = self
            .fee_retry
            .run("attach_fee", |_| {
                let key = key.clone();
                let line = line.clone();
                async move {
                    let invoice_id = self.invoices.find_or_create_invoice(tenant_id, &key).await?;
                    let created = self.invoices.add_items(tenant_id, invoice_id, vec![line]).await?;
                    created
                        .into_iter()
                        .next()
                        .map(|item| (invoice_id, item.id))
                        .ok_or_else(|| StoreError::Backend("invoice service returned no item".to_string()))
                }
            })
            .await;

        let (invoice_id, item_id) = match added {
            Ok(ids) => ids,
            Err(e) => {
                warn!(issuance_id = %record.id, error = %e, "fee attachment failed; issuance kept without fee link");
                return FeeAttach::Failed { reason: e.to_string() };
            }
        };

        if let Err(e) = self.issuances.link_fee_item(tenant_id, record.id, item_id).await {
            warn!(
                issuance_id = %record.id,
                %invoice_id,
                %item_id,
                error = %e,
                "fee line added but not linked to issuance"
            );
            return FeeAttach::Failed {
                reason: format!("fee line {item_id} added to invoice {invoice_id} but not linked: {e}"),
            };
        }

        record.fee_invoice_item_id = Some(item_id);
        FeeAttach::Attached { invoice_id, item_id }
    }
}
