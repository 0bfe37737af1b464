//! Request context from gateway-asserted headers.
//!
//! Authentication happens upstream; this layer only refuses requests that
//! arrive without a well-formed identity.

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use thiserror::Error;

use schoolops_auth::{PrincipalId, Role};
use schoolops_core::TenantId;

use crate::app::errors;
use crate::context::{PrincipalContext, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const PRINCIPAL_HEADER: &str = "x-principal-id";
pub const ROLES_HEADER: &str = "x-roles";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("missing {0} header")]
    Missing(&'static str),

    #[error("malformed {0} header")]
    Malformed(&'static str),
}

pub async fn gateway_context(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let (tenant, principal) = extract_context(req.headers())
        .map_err(|e| errors::json_error(StatusCode::UNAUTHORIZED, "unauthenticated", e.to_string()))?;

    req.extensions_mut().insert(tenant);
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

pub fn extract_context(headers: &HeaderMap) -> Result<(TenantContext, PrincipalContext), ContextError> {
    let tenant_id: TenantId = required(headers, TENANT_HEADER)?
        .parse()
        .map_err(|_| ContextError::Malformed(TENANT_HEADER))?;
    let principal_id: PrincipalId = required(headers, PRINCIPAL_HEADER)?
        .parse()
        .map_err(|_| ContextError::Malformed(PRINCIPAL_HEADER))?;

    let roles = match headers.get(ROLES_HEADER) {
        Some(raw) => raw
            .to_str()
            .map_err(|_| ContextError::Malformed(ROLES_HEADER))?
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| Role::new(r.to_string()))
            .collect(),
        None => Vec::new(),
    };

    Ok((
        TenantContext::new(tenant_id),
        PrincipalContext::new(principal_id, roles),
    ))
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ContextError> {
    let value = headers
        .get(name)
        .ok_or(ContextError::Missing(name))?
        .to_str()
        .map_err(|_| ContextError::Malformed(name))?
        .trim();
    if value.is_empty() {
        return Err(ContextError::Missing(name));
    }
    Ok(value)
}
