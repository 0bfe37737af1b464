use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use schoolops_infra::issuance::{IssuanceOutcome, ReturnOutcome};
use schoolops_inventory::{IssuanceRequest, ReturnRequest};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct IssueBody {
    #[serde(flatten)]
    pub request: IssuanceRequest,
    /// Defaults to today (UTC).
    pub issue_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnBody {
    #[serde(flatten)]
    pub request: ReturnRequest,
    /// Defaults to today (UTC).
    pub returned_on: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OverdueQuery {
    pub as_of: Option<NaiveDate>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn issuance_outcome_to_json(outcome: &IssuanceOutcome) -> Value {
    json!({
        "issuance_id": outcome.issuance_id().to_string(),
        "fee_invoice_item_id": outcome.fee_invoice_item_id().map(|id| id.to_string()),
        "fee": outcome.fee,
        "issuance": outcome.record,
    })
}

pub fn return_outcome_to_json(outcome: &ReturnOutcome) -> Value {
    json!({
        "issuance": outcome.record,
        "stock_after": outcome.stock_after,
        "fee": outcome.fee,
    })
}
