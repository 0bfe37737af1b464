//! Non-negative monetary amounts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult, ValueObject};

/// A non-negative decimal amount in the tenant's currency.
///
/// # Invariants
/// - Must be >= 0. Signed amounts only exist on invoice credit lines, which use
///   a raw `Decimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// # Errors
    /// Returns `DomainError::Validation` if `amount` is negative.
    pub fn new(amount: Decimal) -> DomainResult<Self> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(DomainError::validation(
                "amount",
                format!("amount must be non-negative, got {amount}"),
            ));
        }
        Ok(Self(amount))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// `self × quantity`, failing on overflow.
    pub fn times(&self, quantity: u32) -> DomainResult<Money> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .map(Money)
            .ok_or_else(|| DomainError::invariant("amount overflow"))
    }

    /// Signed credit amount (`-self`) for compensating lines.
    pub fn as_credit(&self) -> Decimal {
        -self.0
    }
}

impl ValueObject for Money {}

impl TryFrom<Decimal> for Money {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
