//! Academic years and billing periods.

use core::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use schoolops_core::{DomainError, DomainResult, PersonId, ValueObject};

use crate::InvoiceKey;

/// An academic year, identified by the calendar year it starts in.
///
/// Rendered as `"2026-27"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcademicYear {
    start_year: i32,
}

impl AcademicYear {
    pub fn new(start_year: i32) -> Self {
        Self { start_year }
    }

    /// Academic year a date falls in, for years starting in `start_month`.
    pub fn containing(date: NaiveDate, start_month: u32) -> Self {
        if date.month() >= start_month {
            Self::new(date.year())
        } else {
            Self::new(date.year() - 1)
        }
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{:02}",
            self.start_year,
            (self.start_year + 1).rem_euclid(100)
        )
    }
}

impl ValueObject for AcademicYear {}

impl core::fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for AcademicYear {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            DomainError::validation("academic_year", format!("expected 'YYYY-YY', got '{s}'"))
        };
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start_year: i32 = start.parse().map_err(|_| invalid())?;
        let end: i32 = end.parse().map_err(|_| invalid())?;
        if end != (start_year + 1).rem_euclid(100) {
            return Err(invalid());
        }
        Ok(Self::new(start_year))
    }
}

impl TryFrom<String> for AcademicYear {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AcademicYear> for String {
    fn from(value: AcademicYear) -> Self {
        value.label()
    }
}

/// Invoicing window inside an academic year (e.g. `"2026-10"`, `"2026-27/Q3"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingPeriod(String);

impl BillingPeriod {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for BillingPeriod {}

impl core::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How often a student receives a fee invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

impl FromStr for BillingCycle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "annual" | "yearly" => Ok(Self::Annual),
            other => Err(DomainError::validation(
                "billing_cycle",
                format!("must be one of monthly, quarterly, annual; got '{other}'"),
            )),
        }
    }
}

/// Resolves dates to (academic year, billing period).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingCalendar {
    academic_year_start_month: u32,
    cycle: BillingCycle,
}

impl BillingCalendar {
    pub const DEFAULT_START_MONTH: u32 = 4;

    pub fn new(academic_year_start_month: u32, cycle: BillingCycle) -> DomainResult<Self> {
        if !(1..=12).contains(&academic_year_start_month) {
            return Err(DomainError::validation(
                "academic_year_start_month",
                format!("must be within 1..=12, got {academic_year_start_month}"),
            ));
        }
        Ok(Self {
            academic_year_start_month,
            cycle,
        })
    }

    pub fn cycle(&self) -> BillingCycle {
        self.cycle
    }

    pub fn academic_year(&self, date: NaiveDate) -> AcademicYear {
        AcademicYear::containing(date, self.academic_year_start_month)
    }

    pub fn billing_period(&self, date: NaiveDate) -> BillingPeriod {
        match self.cycle {
            BillingCycle::Monthly => {
                BillingPeriod::new(format!("{}-{:02}", date.year(), date.month()))
            }
            BillingCycle::Quarterly => {
                let offset = (date.month() + 12 - self.academic_year_start_month) % 12;
                let quarter = offset / 3 + 1;
                BillingPeriod::new(format!("{}/Q{}", self.academic_year(date), quarter))
            }
            BillingCycle::Annual => BillingPeriod::new(self.academic_year(date).label()),
        }
    }

    /// Invoice key for a student's charges dated `date`.
    pub fn key_for(&self, student_id: PersonId, date: NaiveDate) -> InvoiceKey {
        InvoiceKey {
            student_id,
            academic_year: self.academic_year(date),
            billing_period: self.billing_period(date),
        }
    }
}

impl Default for BillingCalendar {
    fn default() -> Self {
        Self {
            academic_year_start_month: Self::DEFAULT_START_MONTH,
            cycle: BillingCycle::Monthly,
        }
    }
}
