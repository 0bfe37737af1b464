//! HTTP API: routing, request context and JSON mapping over `InventoryService`.

pub mod app;
pub mod context;
pub mod middleware;
