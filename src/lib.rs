//! tagsrv - field-protocol to database telemetry gateway
//!
//! Subscribes to data-change notifications from a field-protocol session,
//! keeps the latest sample per configured tag in a concurrent cache, serves
//! the cache over HTTP, and periodically persists mapped columns to SQL
//! storage. Both external sessions are kept alive by a uniform reconnect
//! policy.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod supervisor;

pub use error::{GatewayError, Result};

/// Service identity used in logs and the audit trail
pub const SERVICE_NAME: &str = "tagsrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
