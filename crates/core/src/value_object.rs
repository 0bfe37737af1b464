//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are compared by their attribute values
/// (`Money`, `AcademicYear`, `BillingPeriod`). They are immutable: "changing"
/// one means constructing a new value.
///
/// ```ignore
/// let a = Money::new(dec!(50))?;
/// let b = Money::new(dec!(50.00))?;
/// assert_eq!(a, b);
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
