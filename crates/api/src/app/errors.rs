use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{json, Value};

use schoolops_infra::ServiceError;
use schoolops_inventory::IssuanceRejection;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Unauthorized(e) => json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()),
        ServiceError::Validation(e) => {
            let field = e.field().map(str::to_string);
            json_error_with(
                StatusCode::BAD_REQUEST,
                "validation_error",
                e.to_string(),
                json!({ "field": field }),
            )
        }
        ServiceError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        ServiceError::Rejected(r) => rejection_to_response(r),
        e @ ServiceError::AlreadyReturned { .. } => {
            json_error(StatusCode::CONFLICT, "already_returned", e.to_string())
        }
        ServiceError::ReversalFailed {
            issuance_id,
            invoice_id,
            reason,
        } => {
            tracing::error!(%issuance_id, invoice_id = ?invoice_id, %reason, "fee reversal needs follow-up");
            json_error_with(
                StatusCode::BAD_GATEWAY,
                "fee_reversal_failed",
                reason,
                json!({
                    "issuance_id": issuance_id.to_string(),
                    "invoice_id": invoice_id.map(|id| id.to_string()),
                }),
            )
        }
        ServiceError::StockNotDecremented { issuance_id, reason } => {
            tracing::error!(%issuance_id, %reason, "stock not decremented");
            json_error_with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "stock_not_decremented",
                reason,
                json!({ "issuance_id": issuance_id.to_string() }),
            )
        }
        ServiceError::Persistence(e) => {
            tracing::error!(error = %e, "persistence failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "persistence_error", e.to_string())
        }
    }
}

fn rejection_to_response(r: IssuanceRejection) -> axum::response::Response {
    let (status, code) = match &r {
        IssuanceRejection::InvalidQuantity => (StatusCode::BAD_REQUEST, "invalid_quantity"),
        IssuanceRejection::InsufficientStock { .. } => (StatusCode::CONFLICT, "insufficient_stock"),
        IssuanceRejection::NotIssuable { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "not_issuable"),
        IssuanceRejection::RecipientTypeMismatch { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "recipient_type_mismatch")
        }
        IssuanceRejection::ChargeAmountRequired { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "charge_amount_required")
        }
    };
    json_error_with(status, code, r.to_string(), json!({ "field": r.field() }))
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    json_error_with(status, code, message, Value::Null)
}

/// Like [`json_error`], with the keys of `extra` merged into the body.
pub fn json_error_with(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    extra: Value,
) -> axum::response::Response {
    let mut body = json!({
        "error": code,
        "message": message.into(),
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (status, axum::Json(body)).into_response()
}

pub fn invalid_id(what: &'static str) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id"))
}
