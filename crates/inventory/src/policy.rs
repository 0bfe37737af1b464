use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use schoolops_core::{DomainError, DomainResult, Entity, Money, TenantId, UserId, time};
use schoolops_invoicing::FeeCategory;

use crate::RecipientType;

schoolops_core::entity_id!(
    /// Inventory item policy identifier (tenant-scoped).
    PolicyId
);

/// Who an item type may be issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueTo {
    Student,
    Staff,
    Both,
}

impl IssueTo {
    pub fn admits(&self, recipient: RecipientType) -> bool {
        matches!(
            (self, recipient),
            (IssueTo::Both, _)
                | (IssueTo::Student, RecipientType::Student)
                | (IssueTo::Staff, RecipientType::Staff)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueTo::Student => "student",
            IssueTo::Staff => "staff",
            IssueTo::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(IssueTo::Student),
            "staff" => Some(IssueTo::Staff),
            "both" => Some(IssueTo::Both),
            _ => None,
        }
    }
}

impl core::fmt::Display for IssueTo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an issuance charge behaves on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    /// Removed from the invoice when the item comes back.
    OneTime,
    /// Refunded with a compensating negative line; never deleted.
    Deposit,
}

impl ChargeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeType::OneTime => "one_time",
            ChargeType::Deposit => "deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(ChargeType::OneTime),
            "deposit" => Some(ChargeType::Deposit),
            _ => None,
        }
    }
}

/// Input for creating a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDraft {
    pub name: String,
    pub description: Option<String>,

    pub tracks_quantity: bool,
    pub current_quantity: Option<u32>,
    pub low_stock_threshold: Option<u32>,
    pub tracks_serially: bool,

    pub can_be_issued: bool,
    pub issue_to: Option<IssueTo>,
    pub must_be_returned: bool,
    pub return_duration_days: Option<u32>,

    pub is_chargeable: bool,
    pub charge_type: Option<ChargeType>,
    pub charge_amount: Option<Money>,
    pub auto_add_to_fees: bool,
    pub fee_category: Option<FeeCategory>,

    pub unit_cost: Option<Money>,
    pub allow_price_override: bool,
    pub internal_notes: Option<String>,
}

/// Partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyPatch {
    pub name: Option<String>,
    pub description: Option<String>,

    pub tracks_quantity: Option<bool>,
    /// Administrative stock correction (count-on-hand).
    pub current_quantity: Option<u32>,
    pub low_stock_threshold: Option<u32>,
    pub tracks_serially: Option<bool>,

    pub can_be_issued: Option<bool>,
    pub issue_to: Option<IssueTo>,
    pub must_be_returned: Option<bool>,
    pub return_duration_days: Option<u32>,

    pub is_chargeable: Option<bool>,
    pub charge_type: Option<ChargeType>,
    pub charge_amount: Option<Money>,
    pub auto_add_to_fees: Option<bool>,
    pub fee_category: Option<FeeCategory>,

    pub unit_cost: Option<Money>,
    pub allow_price_override: Option<bool>,
    pub internal_notes: Option<String>,

    pub is_active: Option<bool>,
}

impl PolicyPatch {
    pub fn sets_quantity(&self) -> bool {
        self.current_quantity.is_some()
    }
}

/// Per-tenant configuration of how an item type is tracked, issued and charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItemPolicy {
    pub id: PolicyId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,

    pub tracks_quantity: bool,
    pub current_quantity: Option<u32>,
    pub low_stock_threshold: Option<u32>,
    pub tracks_serially: bool,

    pub can_be_issued: bool,
    pub issue_to: Option<IssueTo>,
    pub must_be_returned: bool,
    pub return_duration_days: Option<u32>,

    pub is_chargeable: bool,
    pub charge_type: Option<ChargeType>,
    pub charge_amount: Option<Money>,
    pub auto_add_to_fees: bool,
    pub fee_category: Option<FeeCategory>,

    pub unit_cost: Option<Money>,
    pub allow_price_override: bool,
    pub internal_notes: Option<String>,

    pub is_active: bool,
    pub created_by: UserId,
    #[serde(with = "time::flexible")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "time::flexible")]
    pub updated_at: DateTime<Utc>,
}

impl InventoryItemPolicy {
    /// Build and structurally validate a new, active policy.
    pub fn create(
        tenant_id: TenantId,
        draft: PolicyDraft,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let policy = Self {
            id: PolicyId::generate(),
            tenant_id,
            name: draft.name.trim().to_string(),
            description: draft.description,
            tracks_quantity: draft.tracks_quantity,
            current_quantity: draft.current_quantity,
            low_stock_threshold: draft.low_stock_threshold,
            tracks_serially: draft.tracks_serially,
            can_be_issued: draft.can_be_issued,
            issue_to: draft.issue_to,
            must_be_returned: draft.must_be_returned,
            return_duration_days: draft.return_duration_days,
            is_chargeable: draft.is_chargeable,
            charge_type: draft.charge_type,
            charge_amount: draft.charge_amount,
            auto_add_to_fees: draft.auto_add_to_fees,
            fee_category: draft.fee_category,
            unit_cost: draft.unit_cost,
            allow_price_override: draft.allow_price_override,
            internal_notes: draft.internal_notes,
            is_active: true,
            created_by,
            created_at: now,
            updated_at: now,
        };
        policy.check_structure()?;
        Ok(policy)
    }

    /// Apply a partial update, returning the new state if it is structurally valid.
    pub fn patched(&self, patch: PolicyPatch, now: DateTime<Utc>) -> DomainResult<Self> {
        let mut next = self.clone();

        if let Some(v) = patch.name {
            next.name = v.trim().to_string();
        }
        if let Some(v) = patch.description {
            next.description = Some(v);
        }
        if let Some(v) = patch.tracks_quantity {
            next.tracks_quantity = v;
        }
        if let Some(v) = patch.current_quantity {
            next.current_quantity = Some(v);
        }
        if let Some(v) = patch.low_stock_threshold {
            next.low_stock_threshold = Some(v);
        }
        if let Some(v) = patch.tracks_serially {
            next.tracks_serially = v;
        }
        if let Some(v) = patch.can_be_issued {
            next.can_be_issued = v;
        }
        if let Some(v) = patch.issue_to {
            next.issue_to = Some(v);
        }
        if let Some(v) = patch.must_be_returned {
            next.must_be_returned = v;
        }
        if let Some(v) = patch.return_duration_days {
            next.return_duration_days = Some(v);
        }
        if let Some(v) = patch.is_chargeable {
            next.is_chargeable = v;
        }
        if let Some(v) = patch.charge_type {
            next.charge_type = Some(v);
        }
        if let Some(v) = patch.charge_amount {
            next.charge_amount = Some(v);
        }
        if let Some(v) = patch.auto_add_to_fees {
            next.auto_add_to_fees = v;
        }
        if let Some(v) = patch.fee_category {
            next.fee_category = Some(v);
        }
        if let Some(v) = patch.unit_cost {
            next.unit_cost = Some(v);
        }
        if let Some(v) = patch.allow_price_override {
            next.allow_price_override = v;
        }
        if let Some(v) = patch.internal_notes {
            next.internal_notes = Some(v);
        }
        if let Some(v) = patch.is_active {
            next.is_active = v;
        }

        next.check_structure()?;
        next.updated_at = now;
        Ok(next)
    }

    /// Structural invariants, checked in a fixed order so the first
    /// violation reported is deterministic.
    pub fn check_structure(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name", "name cannot be empty"));
        }
        if self.tracks_serially && !self.tracks_quantity {
            return Err(DomainError::validation(
                "tracks_serially",
                "serial tracking requires quantity tracking",
            ));
        }
        if self.can_be_issued && self.issue_to.is_none() {
            return Err(DomainError::validation(
                "issue_to",
                "required when the item can be issued",
            ));
        }
        match self.return_duration_days {
            Some(0) => {
                return Err(DomainError::validation(
                    "return_duration_days",
                    "must be a positive number of days",
                ));
            }
            None if self.must_be_returned => {
                return Err(DomainError::validation(
                    "return_duration_days",
                    "required when the item must be returned",
                ));
            }
            _ => {}
        }
        if self.is_chargeable && self.charge_type.is_none() {
            return Err(DomainError::validation(
                "charge_type",
                "required when the item is chargeable",
            ));
        }
        if self.is_chargeable && self.charge_amount.is_none() {
            return Err(DomainError::validation(
                "charge_amount",
                "required when the item is chargeable",
            ));
        }
        if self.auto_add_to_fees && self.fee_category.is_none() {
            return Err(DomainError::validation(
                "fee_category",
                "required when charges are added to fees automatically",
            ));
        }
        Ok(())
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }

    /// Active, quantity-tracked, and at or below its threshold.
    pub fn is_low_stock(&self) -> bool {
        if !self.is_active || !self.tracks_quantity {
            return false;
        }
        matches!(
            (self.current_quantity, self.low_stock_threshold),
            (Some(q), Some(t)) if q <= t
        )
    }

    /// Invoice label for a charge of `quantity` units.
    pub fn fee_label(&self, quantity: u32) -> String {
        format!("{} (x{})", self.name, quantity)
    }

    /// Invoice label for a compensating refund line.
    pub fn refund_label(&self) -> String {
        format!("Refund: {} — Returned", self.name)
    }
}

impl Entity for InventoryItemPolicy {
    type Id = PolicyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
