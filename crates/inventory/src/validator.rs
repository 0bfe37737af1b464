//! Pre-issuance validation.
//!
//! [`validate`] is a pure function of the policy snapshot, the request and the
//! issue date. It either rejects with the first failing rule or returns the
//! side effects the executor must carry out. Checks run in a fixed order:
//!
//! 1. quantity is at least one
//! 2. the item is active and issuable
//! 3. the recipient type is admitted
//! 4. enough stock is on hand (when tracked and known)
//! 5. a chargeable item resolves to a positive per-unit amount

use chrono::{Days, NaiveDate};
use thiserror::Error;

use schoolops_core::Money;
use schoolops_invoicing::FeeCategory;

use crate::{ChargeType, InventoryItemPolicy, IssuanceRequest, IssueTo, RecipientType};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssuanceRejection {
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    #[error("'{name}' is not available for issuance")]
    NotIssuable { name: String },

    #[error("'{name}' can only be issued to {allowed}, not {requested}")]
    RecipientTypeMismatch {
        name: String,
        allowed: IssueTo,
        requested: RecipientType,
    },

    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: u32, requested: u32 },

    #[error("'{name}' is chargeable but has no positive charge amount")]
    ChargeAmountRequired { name: String },
}

impl IssuanceRejection {
    /// Request or policy field the rejection is about.
    pub fn field(&self) -> &'static str {
        match self {
            IssuanceRejection::InvalidQuantity => "quantity",
            IssuanceRejection::NotIssuable { .. } => "can_be_issued",
            IssuanceRejection::RecipientTypeMismatch { .. } => "issued_to_type",
            IssuanceRejection::InsufficientStock { .. } => "quantity",
            IssuanceRejection::ChargeAmountRequired { .. } => "charge_amount",
        }
    }
}

/// Charge terms resolved for one issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeSnapshot {
    pub charge_type: ChargeType,
    pub unit_amount: Money,
    /// `unit_amount × quantity`.
    pub total: Money,
}

/// What an accepted issuance must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceEffects {
    pub quantity: u32,
    pub decrement_stock: bool,
    pub charge: Option<ChargeSnapshot>,
    /// Add `charge.total` to the student's invoice.
    pub attach_fee: bool,
    pub fee_category: Option<FeeCategory>,
    pub expected_return_date: Option<NaiveDate>,
}

pub fn validate(
    policy: &InventoryItemPolicy,
    request: &IssuanceRequest,
    issue_date: NaiveDate,
) -> Result<IssuanceEffects, IssuanceRejection> {
    let quantity = request.quantity;
    if quantity == 0 {
        return Err(IssuanceRejection::InvalidQuantity);
    }

    if !policy.is_active || !policy.can_be_issued {
        return Err(IssuanceRejection::NotIssuable {
            name: policy.name.clone(),
        });
    }

    if let Some(allowed) = policy.issue_to {
        if !allowed.admits(request.issued_to_type) {
            return Err(IssuanceRejection::RecipientTypeMismatch {
                name: policy.name.clone(),
                allowed,
                requested: request.issued_to_type,
            });
        }
    }

    if policy.tracks_quantity {
        if let Some(available) = policy.current_quantity {
            if available < quantity {
                return Err(IssuanceRejection::InsufficientStock {
                    available,
                    requested: quantity,
                });
            }
        }
    }

    let charge = if policy.is_chargeable {
        let unit_amount = request
            .charge_amount_override
            .filter(Money::is_positive)
            .or(policy.charge_amount.filter(Money::is_positive))
            .ok_or_else(|| IssuanceRejection::ChargeAmountRequired {
                name: policy.name.clone(),
            })?;
        let total = unit_amount
            .times(quantity)
            .map_err(|_| IssuanceRejection::InvalidQuantity)?;
        Some(ChargeSnapshot {
            // Structural validation guarantees a charge type on chargeable policies.
            charge_type: policy.charge_type.unwrap_or(ChargeType::OneTime),
            unit_amount,
            total,
        })
    } else {
        None
    };

    let attach_fee = charge.is_some()
        && policy.auto_add_to_fees
        && request.issued_to_type == RecipientType::Student;

    let expected_return_date = if policy.must_be_returned {
        policy
            .return_duration_days
            .map(|days| {
                issue_date
                    .checked_add_days(Days::new(u64::from(days)))
                    .unwrap_or(NaiveDate::MAX)
            })
    } else {
        None
    };

    Ok(IssuanceEffects {
        quantity,
        decrement_stock: policy.tracks_quantity,
        charge,
        attach_fee,
        fee_category: policy.fee_category,
        expected_return_date,
    })
}
