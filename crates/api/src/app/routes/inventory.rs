use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use schoolops_infra::InventoryService;
use schoolops_inventory::{IssuanceFilter, IssuanceId, PolicyDraft, PolicyId, PolicyPatch};

use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/policies", post(create_policy).get(list_policies))
        .route("/policies/low-stock", get(list_low_stock))
        .route(
            "/policies/:id",
            get(get_policy).patch(update_policy).delete(deactivate_policy),
        )
        .route("/policies/:id/issue", post(issue))
        .route("/issuances", get(list_issuances))
        .route("/issuances/overdue", get(list_overdue))
        .route("/issuances/:id/return", post(return_issuance))
}

pub async fn create_policy(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<PolicyDraft>,
) -> axum::response::Response {
    match service.create_policy(&principal.principal(&tenant), body).await {
        Ok(policy) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": policy.id.to_string(),
                "policy": policy,
            })),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_policies(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match service.list_policies(&principal.principal(&tenant)).await {
        Ok(policies) => (StatusCode::OK, Json(policies)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_low_stock(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match service.list_low_stock(&principal.principal(&tenant)).await {
        Ok(policies) => (StatusCode::OK, Json(policies)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_policy(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<PolicyId>() else {
        return errors::invalid_id("policy");
    };
    match service.get_policy(&principal.principal(&tenant), id).await {
        Ok(policy) => (StatusCode::OK, Json(policy)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn update_policy(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(patch): Json<PolicyPatch>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<PolicyId>() else {
        return errors::invalid_id("policy");
    };
    match service.update_policy(&principal.principal(&tenant), id, patch).await {
        Ok(policy) => (StatusCode::OK, Json(policy)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Soft delete: the policy is deactivated, not removed.
pub async fn deactivate_policy(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<PolicyId>() else {
        return errors::invalid_id("policy");
    };
    match service.deactivate_policy(&principal.principal(&tenant), id).await {
        Ok(policy) => (StatusCode::OK, Json(policy)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn issue(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::IssueBody>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<PolicyId>() else {
        return errors::invalid_id("policy");
    };
    let issue_date = body.issue_date.unwrap_or_else(|| Utc::now().date_naive());

    match service
        .issue(&principal.principal(&tenant), id, body.request, issue_date)
        .await
    {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(dto::issuance_outcome_to_json(&outcome)),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_issuances(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(filter): Query<IssuanceFilter>,
) -> axum::response::Response {
    match service.list_issuances(&principal.principal(&tenant), &filter).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_overdue(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::OverdueQuery>,
) -> axum::response::Response {
    let as_of = query.as_of.unwrap_or_else(|| Utc::now().date_naive());
    match service.list_overdue(&principal.principal(&tenant), as_of).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn return_issuance(
    Extension(service): Extension<Arc<InventoryService>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReturnBody>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<IssuanceId>() else {
        return errors::invalid_id("issuance");
    };
    let today = body.returned_on.unwrap_or_else(|| Utc::now().date_naive());

    match service
        .return_issuance(&principal.principal(&tenant), id, body.request, today)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(dto::return_outcome_to_json(&outcome))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
