//! Process configuration read from the environment.

use std::time::Duration;

use thiserror::Error;

use schoolops_invoicing::{BillingCalendar, BillingCycle};

use crate::issuance::ReversalConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// `None` selects the in-memory stores.
    pub database_url: Option<String>,
    pub calendar: BillingCalendar,
    pub fee_attach_retry: RetryPolicy,
    pub reversal: ReversalConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            calendar: BillingCalendar::default(),
            fee_attach_retry: RetryPolicy::no_retry(),
            reversal: ReversalConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let bind_addr = get("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let database_url = get("DATABASE_URL");

        let start_month = match get("ACADEMIC_YEAR_START_MONTH") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| ConfigError::invalid("ACADEMIC_YEAR_START_MONTH", e.to_string()))?,
            None => BillingCalendar::DEFAULT_START_MONTH,
        };
        let cycle = match get("BILLING_CYCLE") {
            Some(raw) => raw
                .parse::<BillingCycle>()
                .map_err(|e| ConfigError::invalid("BILLING_CYCLE", e.to_string()))?,
            None => BillingCycle::default(),
        };
        let calendar = BillingCalendar::new(start_month, cycle)
            .map_err(|e| ConfigError::invalid("ACADEMIC_YEAR_START_MONTH", e.to_string()))?;

        let max_retries = match get("FEE_ATTACH_MAX_RETRIES") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| ConfigError::invalid("FEE_ATTACH_MAX_RETRIES", e.to_string()))?,
            None => 0,
        };
        let delay_ms = match get("FEE_ATTACH_RETRY_DELAY_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid("FEE_ATTACH_RETRY_DELAY_MS", e.to_string()))?,
            None => 200,
        };
        let fee_attach_retry = if max_retries == 0 {
            RetryPolicy::no_retry()
        } else {
            RetryPolicy::fixed(max_retries, Duration::from_millis(delay_ms))
        };

        let match_by_label = match get("FEE_MATCH_BY_LABEL") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid("FEE_MATCH_BY_LABEL", format!("expected true/false, got '{raw}'"))
            })?,
            None => true,
        };

        Ok(Self {
            bind_addr,
            database_url,
            calendar,
            fee_attach_retry,
            reversal: ReversalConfig { match_by_label },
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
