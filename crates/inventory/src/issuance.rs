use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use schoolops_core::{DomainError, DomainResult, Entity, Money, PersonId, TenantId, UserId, time};
use schoolops_invoicing::InvoiceItemId;

use crate::{ChargeType, IssuanceEffects, PolicyId};

schoolops_core::entity_id!(
    /// Issuance record identifier (tenant-scoped).
    IssuanceId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    Student,
    Staff,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::Student => "student",
            RecipientType::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(RecipientType::Student),
            "staff" => Some(RecipientType::Staff),
            _ => None,
        }
    }
}

impl core::fmt::Display for RecipientType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle: `issued -> returned | lost`. Both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuanceStatus {
    Issued,
    Returned,
    Lost,
}

impl IssuanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IssuanceStatus::Issued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssuanceStatus::Issued => "issued",
            IssuanceStatus::Returned => "returned",
            IssuanceStatus::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(IssuanceStatus::Issued),
            "returned" => Some(IssuanceStatus::Returned),
            "lost" => Some(IssuanceStatus::Lost),
            _ => None,
        }
    }
}

/// Request to hand out units of a policy's item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub issued_to_type: RecipientType,
    pub issued_to_id: PersonId,
    pub quantity: u32,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Replaces the policy's per-unit charge when positive.
    #[serde(default)]
    pub charge_amount_override: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnRequest {
    pub notes: Option<String>,
    pub mark_as_lost: bool,
}

/// One act of handing items to a recipient, with the financial terms
/// snapshotted at issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    pub id: IssuanceId,
    pub tenant_id: TenantId,
    pub policy_id: PolicyId,
    pub issued_to_type: RecipientType,
    pub issued_to_id: PersonId,
    pub quantity: u32,
    pub serial_number: Option<String>,
    pub issue_date: NaiveDate,
    pub expected_return_date: Option<NaiveDate>,
    pub returned_date: Option<NaiveDate>,
    /// Per-unit charge in effect when issued.
    pub charge_amount: Option<Money>,
    pub charge_type: Option<ChargeType>,
    pub status: IssuanceStatus,
    /// Whether the charge was to be billed to the student's invoice when issued.
    #[serde(default)]
    pub fee_expected: bool,
    /// Invoice line created for this issuance, when fee attachment succeeded.
    pub fee_invoice_item_id: Option<InvoiceItemId>,
    pub return_notes: Option<String>,
    pub issued_by: UserId,
    #[serde(with = "time::flexible")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "time::flexible")]
    pub updated_at: DateTime<Utc>,
}

impl IssuanceRecord {
    /// New `issued` record from a validated request.
    pub fn issue(
        tenant_id: TenantId,
        policy_id: PolicyId,
        request: &IssuanceRequest,
        effects: &IssuanceEffects,
        issue_date: NaiveDate,
        issued_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IssuanceId::generate(),
            tenant_id,
            policy_id,
            issued_to_type: request.issued_to_type,
            issued_to_id: request.issued_to_id,
            quantity: effects.quantity,
            serial_number: request.serial_number.clone(),
            issue_date,
            expected_return_date: effects.expected_return_date,
            returned_date: None,
            charge_amount: effects.charge.as_ref().map(|c| c.unit_amount),
            charge_type: effects.charge.as_ref().map(|c| c.charge_type),
            status: IssuanceStatus::Issued,
            fee_expected: effects.attach_fee,
            fee_invoice_item_id: None,
            return_notes: None,
            issued_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// `charge_amount × quantity`, if a charge was snapshotted.
    pub fn total_charge(&self) -> DomainResult<Option<Money>> {
        self.charge_amount.map(|unit| unit.times(self.quantity)).transpose()
    }

    /// `source_ref` of the invoice line billing this issuance.
    pub fn fee_source_ref(&self) -> String {
        format!("issuance:{}", self.id)
    }

    /// `source_ref` of the line crediting this issuance's charge back.
    pub fn reversal_source_ref(&self) -> String {
        format!("issuance:{}:reversal", self.id)
    }

    /// Whether closing this record must reverse a fee on the student's invoice.
    pub fn needs_fee_reversal(&self) -> bool {
        self.issued_to_type == RecipientType::Student
            && self.charge_type.is_some()
            && self.charge_amount.is_some_and(|m| m.is_positive())
    }

    /// Move out of `issued`. Fails with a conflict if already closed.
    ///
    /// Lost records keep no returned date.
    pub fn close(
        &mut self,
        lost: bool,
        notes: Option<String>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "issuance {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        if lost {
            self.status = IssuanceStatus::Lost;
            self.returned_date = None;
        } else {
            self.status = IssuanceStatus::Returned;
            self.returned_date = Some(today);
        }
        if notes.is_some() {
            self.return_notes = notes;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Still out and past its expected return date.
    pub fn is_overdue(&self, as_of: NaiveDate) -> bool {
        self.status == IssuanceStatus::Issued
            && self.expected_return_date.is_some_and(|due| due < as_of)
    }
}

impl Entity for IssuanceRecord {
    type Id = IssuanceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceFilter {
    pub status: Option<IssuanceStatus>,
    pub policy_id: Option<PolicyId>,
    pub issued_to_type: Option<RecipientType>,
    pub issued_to_id: Option<PersonId>,
    pub overdue_as_of: Option<NaiveDate>,
}

impl IssuanceFilter {
    pub fn matches(&self, record: &IssuanceRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self.policy_id.is_none_or(|p| p == record.policy_id)
            && self.issued_to_type.is_none_or(|t| t == record.issued_to_type)
            && self.issued_to_id.is_none_or(|id| id == record.issued_to_id)
            && self.overdue_as_of.is_none_or(|d| record.is_overdue(d))
    }
}
