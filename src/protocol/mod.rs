//! Field-protocol client boundary
//!
//! The gateway does not implement the wire protocol; it consumes this trait.
//! A real driver owns session establishment, certificates and the
//! subscription machinery, and delivers data changes over the event channel.

pub mod sim;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One data-change notification delivered by the protocol session
#[derive(Debug, Clone)]
pub struct FieldEvent {
    pub node_id: String,
    /// Raw payload as delivered; may be non-numeric
    pub raw: Value,
    /// Server-reported timestamp, diagnostics only. Samples are stamped
    /// with the gateway clock at capture.
    pub server_time: Option<DateTime<Utc>>,
}

/// Client session toward the field-protocol server
#[async_trait]
pub trait FieldClient: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Register a data-change subscription for one node
    async fn subscribe(&self, node_id: &str) -> Result<()>;

    /// Read the current value of a node (used for initial seeding)
    async fn read_value(&self, node_id: &str) -> Result<Value>;

    /// Open a fresh event channel
    ///
    /// The client re-arms its sender, so any previous receiver stops
    /// getting events. Called once at startup and again after each
    /// successful session recovery.
    fn subscribe_events(&self) -> mpsc::Receiver<FieldEvent>;
}

/// Build the configured protocol driver
pub fn build_client(config: &Config) -> Result<Arc<dyn FieldClient>> {
    match config.field.driver.as_str() {
        "sim" => {
            let client = sim::SimFieldClient::new();
            if config.field.publish_interval_ms > 0 {
                client.spawn_feed(std::time::Duration::from_millis(
                    config.field.publish_interval_ms,
                ));
            }
            Ok(Arc::new(client))
        }
        other => Err(GatewayError::Configuration(format!(
            "Unknown field driver: {}",
            other
        ))),
    }
}
