use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use schoolops_core::TenantId;
use schoolops_inventory::{
    ChargeType, InventoryItemPolicy, IssuanceId, IssuanceRecord, IssuanceStatus, ReturnRequest,
};
use schoolops_invoicing::{BillingCalendar, FeeInvoiceItem, InvoiceId, InvoiceItemId, NewInvoiceItem};

use crate::invoice_service::InvoiceService;
use crate::store::{IssuanceStore, PolicyStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalConfig {
    /// Fall back to matching the original charge by label and amount when
    /// the issuance carries no item link and no line references it.
    pub match_by_label: bool,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self { match_by_label: true }
    }
}

#[derive(Debug, Clone)]
pub struct ReturnCommand {
    pub tenant_id: TenantId,
    pub issuance_id: IssuanceId,
    pub request: ReturnRequest,
    pub today: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// What happened to the fee on the student's invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FeeReversal {
    NotApplicable,
    /// One-time charge line deleted.
    Removed {
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    },
    /// One-time charge line could not be deleted; a negative line was appended.
    Compensated {
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    },
    /// Deposit refunded with a negative line.
    Refunded {
        invoice_id: InvoiceId,
        item_id: InvoiceItemId,
    },
    /// The charge line had already been deleted from the invoice.
    AlreadyCleared { item_id: InvoiceItemId },
    /// No billed line was found, so the invoice was left alone. When
    /// `fee_expected` is set the charge was meant to be billed and the
    /// invoice needs a manual look.
    NotBilled { fee_expected: bool },
}

/// Where the original charge stands on the invoice.
enum Located {
    Billed {
        invoice_id: InvoiceId,
        item: FeeInvoiceItem,
    },
    Cleared {
        item_id: InvoiceItemId,
    },
    NotBilled,
}

#[derive(Debug, Clone)]
pub struct ReturnOutcome {
    pub record: IssuanceRecord,
    pub stock_after: Option<u32>,
    pub fee: FeeReversal,
}

#[derive(Debug, Error)]
pub enum ReturnError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("issuance {issuance_id} is already {}", .status.as_str())]
    AlreadyReturned {
        issuance_id: IssuanceId,
        status: IssuanceStatus,
    },

    /// Status and stock were already updated; the invoice needs follow-up.
    #[error("fee reversal failed for issuance {issuance_id}: {reason}")]
    ReversalFailed {
        issuance_id: IssuanceId,
        invoice_id: Option<InvoiceId>,
        reason: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(StoreError),
}

struct ReversalFailure {
    invoice_id: Option<InvoiceId>,
    reason: String,
}

impl ReversalFailure {
    fn new(invoice_id: Option<InvoiceId>, reason: impl ToString) -> Self {
        Self {
            invoice_id,
            reason: reason.to_string(),
        }
    }
}

pub struct ReturnExecutor {
    policies: Arc<dyn PolicyStore>,
    issuances: Arc<dyn IssuanceStore>,
    invoices: Arc<dyn InvoiceService>,
    calendar: BillingCalendar,
    config: ReversalConfig,
}

impl ReturnExecutor {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        issuances: Arc<dyn IssuanceStore>,
        invoices: Arc<dyn InvoiceService>,
        calendar: BillingCalendar,
        config: ReversalConfig,
    ) -> Self {
        Self {
            policies,
            issuances,
            invoices,
            calendar,
            config,
        }
    }

    /// Close an issuance, restore stock and reverse its fee.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, issuance_id = %cmd.issuance_id, lost = cmd.request.mark_as_lost)
    )]
    pub async fn return_issuance(&self, cmd: ReturnCommand) -> Result<ReturnOutcome, ReturnError> {
        let mut record = self
            .issuances
            .get(cmd.tenant_id, cmd.issuance_id)
            .await
            .map_err(ReturnError::Persistence)?
            .ok_or(ReturnError::NotFound("issuance"))?;

        if record.status.is_terminal() {
            return Err(ReturnError::AlreadyReturned {
                issuance_id: record.id,
                status: record.status,
            });
        }

        let policy = self
            .policies
            .get(cmd.tenant_id, record.policy_id)
            .await
            .map_err(ReturnError::Persistence)?
            .ok_or(ReturnError::NotFound("policy"))?;

        let already = ReturnError::AlreadyReturned {
            issuance_id: record.id,
            status: record.status,
        };
        record
            .close(
                cmd.request.mark_as_lost,
                cmd.request.notes.clone(),
                cmd.today,
                cmd.occurred_at,
            )
            .map_err(|_| already)?;

        let closed = self
            .issuances
            .close(&record)
            .await
            .map_err(ReturnError::Persistence)?;
        if !closed {
            // Lost a race with a concurrent return.
            let current = self
                .issuances
                .get(cmd.tenant_id, record.id)
                .await
                .map_err(ReturnError::Persistence)?
                .map(|r| r.status)
                .unwrap_or(IssuanceStatus::Returned);
            return Err(ReturnError::AlreadyReturned {
                issuance_id: record.id,
                status: current,
            });
        }

        let stock_after = if policy.tracks_quantity {
            let restored = self
                .policies
                .increment_quantity(cmd.tenant_id, policy.id, record.quantity)
                .await
                .map_err(|e| {
                    error!(error = %e, "issuance closed but stock was not restored");
                    ReturnError::Persistence(e)
                })?;
            info!(restored = ?restored, "stock restored");
            restored
        } else {
            None
        };

        let fee = if record.needs_fee_reversal() {
            self.reverse_fee(&policy, &record).await.map_err(|f| {
                error!(
                    invoice_id = ?f.invoice_id,
                    reason = %f.reason,
                    "fee reversal failed; issuance already closed"
                );
                ReturnError::ReversalFailed {
                    issuance_id: record.id,
                    invoice_id: f.invoice_id,
                    reason: f.reason,
                }
            })?
        } else {
            FeeReversal::NotApplicable
        };

        info!(status = record.status.as_str(), fee = ?fee, "issuance closed");
        Ok(ReturnOutcome {
            record,
            stock_after,
            fee,
        })
    }

    async fn reverse_fee(
        &self,
        policy: &InventoryItemPolicy,
        record: &IssuanceRecord,
    ) -> Result<FeeReversal, ReversalFailure> {
        let tenant_id = record.tenant_id;
        let total = record
            .total_charge()
            .map_err(|e| ReversalFailure::new(None, e))?
            .ok_or_else(|| ReversalFailure::new(None, "issuance carries no charge"))?;
        let charge_type = record
            .charge_type
            .ok_or_else(|| ReversalFailure::new(None, "issuance carries no charge type"))?;

        let (invoice_id, original) = match self.locate_charge(policy, record, total.amount()).await? {
            Located::Billed { invoice_id, item } => (invoice_id, item),
            Located::Cleared { item_id } => {
                warn!(%item_id, "linked fee line no longer exists; nothing to reverse");
                return Ok(FeeReversal::AlreadyCleared { item_id });
            }
            Located::NotBilled => {
                if record.fee_expected {
                    warn!("billed charge not found on the invoice; needs manual follow-up");
                } else {
                    info!("charge was never billed; invoice left unchanged");
                }
                return Ok(FeeReversal::NotBilled {
                    fee_expected: record.fee_expected,
                });
            }
        };

        let credit_line = NewInvoiceItem {
            label: policy.refund_label(),
            amount: total.as_credit(),
            category: original.category.or(policy.fee_category),
            source_ref: Some(record.reversal_source_ref()),
        };

        match charge_type {
            ChargeType::Deposit => {
                let item_id = self.append(tenant_id, invoice_id, credit_line).await?;
                Ok(FeeReversal::Refunded { invoice_id, item_id })
            }
            ChargeType::OneTime => match self.invoices.remove_item(tenant_id, invoice_id, original.id).await {
                Ok(invoice) => {
                    info!(%invoice_id, item_id = %original.id, total = %invoice.total_amount(), "one-time charge removed");
                    Ok(FeeReversal::Removed {
                        invoice_id,
                        item_id: original.id,
                    })
                }
                Err(StoreError::NotFound) => {
                    warn!(%invoice_id, item_id = %original.id, "charge line deleted concurrently");
                    Ok(FeeReversal::AlreadyCleared { item_id: original.id })
                }
                Err(StoreError::Conflict(reason)) => {
                    warn!(%invoice_id, item_id = %original.id, %reason, "charge line cannot be deleted; appending compensating line");
                    let item_id = self.append(tenant_id, invoice_id, credit_line).await?;
                    Ok(FeeReversal::Compensated { invoice_id, item_id })
                }
                Err(e) => Err(ReversalFailure::new(Some(invoice_id), e)),
            },
        }
    }

    /// Find the line that billed this issuance. A stored item link is
    /// authoritative. Without one, the invoice for the issue date is searched
    /// for a line referencing the issuance, then (optionally) for an
    /// unreferenced line with the same label and amount that no other
    /// issuance is linked to.
    async fn locate_charge(
        &self,
        policy: &InventoryItemPolicy,
        record: &IssuanceRecord,
        total: Decimal,
    ) -> Result<Located, ReversalFailure> {
        let tenant_id = record.tenant_id;

        if let Some(item_id) = record.fee_invoice_item_id {
            return match self.invoices.find_item(tenant_id, item_id).await {
                Ok(Some(item)) => Ok(Located::Billed {
                    invoice_id: item.invoice_id,
                    item,
                }),
                Ok(None) => Ok(Located::Cleared { item_id }),
                Err(e) => Err(ReversalFailure::new(None, e)),
            };
        }

        let key = self.calendar.key_for(record.issued_to_id, record.issue_date);
        let Some(invoice) = self
            .invoices
            .find_invoice(tenant_id, &key)
            .await
            .map_err(|e| ReversalFailure::new(None, e))?
        else {
            debug!(student_id = %key.student_id, period = %key.billing_period, "no fee invoice for the issue period");
            return Ok(Located::NotBilled);
        };
        let invoice_id = invoice.id_typed();

        if let Some(item) = invoice.item_by_source(&record.fee_source_ref()) {
            return Ok(Located::Billed {
                invoice_id,
                item: item.clone(),
            });
        }
        if !self.config.match_by_label {
            return Ok(Located::NotBilled);
        }

        let label = policy.fee_label(record.quantity);
        for item in invoice.unreferenced_charges(&label).filter(|i| i.amount == total) {
            match self.issuances.find_by_fee_item(tenant_id, item.id).await {
                Ok(None) => {
                    return Ok(Located::Billed {
                        invoice_id,
                        item: item.clone(),
                    });
                }
                Ok(Some(owner)) => debug!(item_id = %item.id, %owner, "label match is linked to another issuance"),
                Err(e) => return Err(ReversalFailure::new(Some(invoice_id), e)),
            }
        }
        Ok(Located::NotBilled)
    }

    async fn append(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        line: NewInvoiceItem,
    ) -> Result<InvoiceItemId, ReversalFailure> {
        let created = self
            .invoices
            .add_items(tenant_id, invoice_id, vec![line])
            .await
            .map_err(|e| ReversalFailure::new(Some(invoice_id), e))?;
        created
            .first()
            .map(|item| item.id)
            .ok_or_else(|| ReversalFailure::new(Some(invoice_id), "invoice service returned no item"))
    }
}
