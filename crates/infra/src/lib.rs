//! Infrastructure layer: storage, executors, the inventory service facade,
//! and configuration.

pub mod config;
pub mod invoice_service;
pub mod issuance;
pub mod retry;
pub mod service;
pub mod store;

mod integration_tests;

pub use config::{AppConfig, ConfigError};
pub use invoice_service::InvoiceService;
pub use service::{InventoryService, ServiceError};
pub use store::{StoreError, Stores};
