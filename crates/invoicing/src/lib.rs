//! Fee invoicing domain module.
//!
//! Tenant-scoped student fee invoices keyed by (student, academic year,
//! billing period), implemented purely as deterministic domain logic (no IO,
//! no HTTP, no storage).

pub mod calendar;
pub mod invoice;

pub use calendar::{AcademicYear, BillingCalendar, BillingCycle, BillingPeriod};
pub use invoice::{
    FeeCategory, FeeInvoice, FeeInvoiceItem, InvoiceId, InvoiceItemId, InvoiceKey, NewInvoiceItem,
};
