//! Simulated field-protocol driver
//!
//! Stands in for a real protocol session in development deployments without
//! field access, and gives tests a scriptable event source: values can be
//! set per node, events emitted on demand, and connect attempts forced to
//! fail.

use super::{FieldClient, FieldEvent};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct SimInner {
    connected: AtomicBool,
    fail_connects: AtomicBool,
    values: DashMap<String, Value>,
    subscriptions: DashSet<String>,
    sender: Mutex<Option<mpsc::Sender<FieldEvent>>>,
}

/// Simulated field-protocol session
#[derive(Clone, Default)]
pub struct SimFieldClient {
    inner: Arc<SimInner>,
}

impl SimFieldClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load current values for nodes
    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let client = Self::new();
        for (node, value) in values {
            client.inner.values.insert(node.into(), value);
        }
        client
    }

    /// Set the stored current value for a node (affects later reads)
    pub fn set_value(&self, node_id: &str, value: Value) {
        self.inner.values.insert(node_id.to_string(), value);
    }

    /// Deliver one data-change event through the armed channel
    ///
    /// Returns false when no receiver is listening or the channel is full.
    pub fn emit(&self, node_id: &str, raw: Value) -> bool {
        self.inner.values.insert(node_id.to_string(), raw.clone());
        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(tx) => tx
                .try_send(FieldEvent {
                    node_id: node_id.to_string(),
                    raw,
                    server_time: Some(Utc::now()),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Make subsequent connect attempts fail (test switch)
    pub fn fail_connects(&self, fail: bool) {
        self.inner.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Drop the event sender, closing the receiver side as a lost session
    /// would
    pub fn close_events(&self) {
        self.inner.sender.lock().take();
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Periodically emit a small random walk for every subscribed node
    ///
    /// Only runs while connected; silently idles otherwise.
    pub fn spawn_feed(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !inner.connected.load(Ordering::SeqCst) {
                    continue;
                }
                let sender = inner.sender.lock().clone();
                let Some(tx) = sender else { continue };

                for node in inner.subscriptions.iter() {
                    let base = inner
                        .values
                        .get(node.key())
                        .and_then(|v| v.as_f64())
                        .unwrap_or(20.0);
                    let next = base + rand::thread_rng().gen_range(-0.5..0.5);
                    let raw = serde_json::json!(next);
                    inner.values.insert(node.key().clone(), raw.clone());
                    let _ = tx.try_send(FieldEvent {
                        node_id: node.key().clone(),
                        raw,
                        server_time: Some(Utc::now()),
                    });
                }
            }
        })
    }
}

#[async_trait]
impl FieldClient for SimFieldClient {
    async fn connect(&self) -> Result<()> {
        if self.inner.fail_connects.load(Ordering::SeqCst) {
            return Err(GatewayError::FieldConnection {
                endpoint: "sim".to_string(),
                reason: "simulated connect failure".to_string(),
            });
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        debug!("sim field session connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.sender.lock().take();
        debug!("sim field session disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, node_id: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::FieldDisconnected);
        }
        self.inner.subscriptions.insert(node_id.to_string());
        Ok(())
    }

    async fn read_value(&self, node_id: &str) -> Result<Value> {
        if !self.is_connected() {
            return Err(GatewayError::FieldDisconnected);
        }
        Ok(self
            .inner
            .values
            .get(node_id)
            .map(|v| v.clone())
            .unwrap_or(Value::Null))
    }

    fn subscribe_events(&self) -> mpsc::Receiver<FieldEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.inner.sender.lock() = Some(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_connect_and_read() {
        let client = SimFieldClient::with_values(vec![("ns=2;i=5", json!(23.456))]);
        assert!(!client.is_connected());

        client.connect().await.unwrap();
        assert!(client.is_connected());

        let value = client.read_value("ns=2;i=5").await.unwrap();
        assert_eq!(value, json!(23.456));

        // Unknown node reads as null, not an error
        assert_eq!(client.read_value("ns=2;i=99").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_read_requires_connection() {
        let client = SimFieldClient::new();
        assert!(client.read_value("n").await.is_err());
        assert!(client.subscribe("n").await.is_err());
    }

    #[tokio::test]
    async fn test_forced_connect_failure() {
        let client = SimFieldClient::new();
        client.fail_connects(true);
        assert!(client.connect().await.is_err());

        client.fail_connects(false);
        assert!(client.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_event_delivery() {
        let client = SimFieldClient::new();
        client.connect().await.unwrap();

        let mut rx = client.subscribe_events();
        assert!(client.emit("ns=2;i=5", json!(1.0)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id, "ns=2;i=5");
        assert_eq!(event.raw, json!(1.0));
        assert!(event.server_time.is_some());
    }

    #[tokio::test]
    async fn test_close_events_ends_receiver() {
        let client = SimFieldClient::new();
        client.connect().await.unwrap();

        let mut rx = client.subscribe_events();
        client.close_events();

        assert!(rx.recv().await.is_none());
        assert!(!client.emit("n", json!(1)));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_channel() {
        let client = SimFieldClient::new();
        client.connect().await.unwrap();

        let mut old_rx = client.subscribe_events();
        let mut new_rx = client.subscribe_events();

        client.emit("n", json!(2));
        assert!(old_rx.recv().await.is_none());
        assert_eq!(new_rx.recv().await.unwrap().raw, json!(2));
    }
}
