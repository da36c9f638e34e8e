//! Data-change fan-out
//!
//! Resolves incoming field events to tags, normalizes payloads and pushes
//! the resulting samples to the cache and to registered listeners. Also
//! owns the event pump task: the loop that drains the protocol channel and
//! triggers session recovery when the channel closes.
//!
//! Listener failures never interrupt the update path. A listener that
//! returns an error is logged and skipped for that update; the cache write
//! has already happened and the remaining listeners still run.

use crate::cache::{Sample, ValueCache};
use crate::protocol::{FieldClient, FieldEvent};
use crate::registry::TagRegistry;
use crate::supervisor::ReconnectSupervisor;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every accepted sample, after the cache write
pub trait UpdateListener: Send + Sync + 'static {
    /// Short name used in failure logs
    fn name(&self) -> &str;

    fn on_update(&self, tag: &str, sample: &Sample) -> anyhow::Result<()>;
}

/// Convert a raw protocol payload into a stored value
///
/// Numbers and numeric strings are accepted and rounded to two decimals;
/// booleans map to 1.0/0.0. Everything else (null, non-numeric strings,
/// structured payloads, non-finite numbers) yields no value, which is
/// still stored as a fresh sample with an absent reading.
pub fn normalize(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };

    if !value.is_finite() {
        return None;
    }
    Some((value * 100.0).round() / 100.0)
}

/// Fan-out hub between the protocol session and the in-process consumers
pub struct NotificationFanout {
    registry: Arc<TagRegistry>,
    cache: Arc<ValueCache>,
    listeners: Vec<Arc<dyn UpdateListener>>,
}

impl NotificationFanout {
    pub fn new(registry: Arc<TagRegistry>, cache: Arc<ValueCache>) -> Self {
        Self {
            registry,
            cache,
            listeners: Vec::new(),
        }
    }

    /// Register a listener; must happen before the pump starts
    pub fn register_listener(&mut self, listener: Arc<dyn UpdateListener>) {
        info!(listener = listener.name(), "registered update listener");
        self.listeners.push(listener);
    }

    /// Process one data-change event
    ///
    /// Events for nodes outside the registry are dropped; the sample is
    /// stamped with the gateway clock at this point, not the server time
    /// carried in the event.
    pub fn handle_event(&self, event: &FieldEvent) {
        let Some(tag) = self.registry.lookup_node(&event.node_id) else {
            debug!(node_id = %event.node_id, "dropping event for unknown node");
            return;
        };

        let value = normalize(&event.raw);
        if value.is_none() {
            debug!(tag = %tag.name, raw = %event.raw, "payload not numeric, storing absent value");
        }
        self.apply(&tag.name, Sample::new(value, tag.unit.clone()));
    }

    fn apply(&self, tag: &str, sample: Sample) {
        self.cache.set(tag, sample.clone());

        for listener in &self.listeners {
            if let Err(e) = listener.on_update(tag, &sample) {
                warn!(listener = listener.name(), tag = %tag, error = %e, "update listener failed");
            }
        }
    }

    /// Prime the cache with one read per tag
    ///
    /// Runs at startup and after each field-session recovery so consumers
    /// see values before the first data change arrives. Individual read
    /// failures are logged and skipped.
    pub async fn seed_initial(&self, client: &Arc<dyn FieldClient>) {
        for tag in self.registry.tags() {
            match client.read_value(&tag.node_id).await {
                Ok(raw) => {
                    let sample = Sample::new(normalize(&raw), tag.unit.clone());
                    self.apply(&tag.name, sample);
                }
                Err(e) => {
                    warn!(tag = %tag.name, error = %e, "initial read failed");
                }
            }
        }
        info!(count = self.cache.len(), "seeded initial values");
    }

    /// Drain the protocol event channel until cancelled
    ///
    /// A closed channel means the session dropped its subscription side:
    /// the pump runs field recovery, reopens the channel and reseeds, then
    /// resumes draining. A failed recovery attempt loops back into another
    /// one (the supervisor's backoff paces the retries).
    pub async fn run(
        self: Arc<Self>,
        client: Arc<dyn FieldClient>,
        supervisor: Arc<ReconnectSupervisor>,
        token: CancellationToken,
    ) {
        let mut events = client.subscribe_events();
        info!("event pump started");

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("event pump stopping");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(&event),
                        None => {
                            warn!("field event channel closed, recovering session");
                            if supervisor.reconnect_field().await {
                                events = client.subscribe_events();
                                self.seed_initial(&client).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FieldConfig, TagConfig};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_registry() -> Arc<TagRegistry> {
        let config = Config {
            service: Default::default(),
            field: FieldConfig {
                driver: "sim".to_string(),
                endpoint: "sim".to_string(),
                publish_interval_ms: 0,
            },
            tags: vec![
                TagConfig {
                    name: "Temp1".to_string(),
                    node_id: "ns=2;i=5".to_string(),
                    unit: "C".to_string(),
                },
                TagConfig {
                    name: "Pressure1".to_string(),
                    node_id: "ns=2;i=6".to_string(),
                    unit: "bar".to_string(),
                },
            ],
            database: Default::default(),
            http: Default::default(),
        };
        Arc::new(TagRegistry::load(&config).unwrap())
    }

    fn event(node_id: &str, raw: Value) -> FieldEvent {
        FieldEvent {
            node_id: node_id.to_string(),
            raw,
            server_time: Some(Utc::now()),
        }
    }

    struct CountingListener {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingListener {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl UpdateListener for CountingListener {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_update(&self, _tag: &str, _sample: &Sample) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("listener exploded");
            }
            Ok(())
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&json!(23.456)), Some(23.46));
        assert_eq!(normalize(&json!(42)), Some(42.0));
        assert_eq!(normalize(&json!("23.456")), Some(23.46));
        assert_eq!(normalize(&json!(" 7.5 ")), Some(7.5));
        assert_eq!(normalize(&json!(true)), Some(1.0));
        assert_eq!(normalize(&json!(false)), Some(0.0));
        assert_eq!(normalize(&json!("N/A")), None);
        assert_eq!(normalize(&json!(null)), None);
        assert_eq!(normalize(&json!({"v": 1})), None);
        assert_eq!(normalize(&json!("NaN")), None);
        assert_eq!(normalize(&json!("inf")), None);
    }

    #[test]
    fn test_event_updates_cache() {
        let cache = Arc::new(ValueCache::new());
        let fanout = NotificationFanout::new(test_registry(), cache.clone());

        fanout.handle_event(&event("ns=2;i=5", json!("23.456")));

        let sample = cache.get("Temp1").unwrap();
        assert_eq!(sample.value, Some(23.46));
        assert_eq!(sample.unit, "C");
    }

    #[test]
    fn test_bad_payload_stores_absent_value() {
        let cache = Arc::new(ValueCache::new());
        let fanout = NotificationFanout::new(test_registry(), cache.clone());

        fanout.handle_event(&event("ns=2;i=5", json!(23.456)));
        fanout.handle_event(&event("ns=2;i=5", json!("N/A")));

        // The sample is refreshed with no value rather than keeping the
        // stale reading
        let sample = cache.get("Temp1").unwrap();
        assert_eq!(sample.value, None);
        assert_eq!(sample.unit, "C");
    }

    #[test]
    fn test_unknown_node_dropped() {
        let cache = Arc::new(ValueCache::new());
        let fanout = NotificationFanout::new(test_registry(), cache.clone());

        fanout.handle_event(&event("ns=2;i=99", json!(1.0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let cache = Arc::new(ValueCache::new());
        let mut fanout = NotificationFanout::new(test_registry(), cache.clone());

        let failing = CountingListener::new(true);
        let healthy = CountingListener::new(false);
        fanout.register_listener(failing.clone());
        fanout.register_listener(healthy.clone());

        fanout.handle_event(&event("ns=2;i=5", json!(1.0)));

        // Cache updated, both listeners invoked despite the first failing
        assert_eq!(cache.get("Temp1").unwrap().value, Some(1.0));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_seed_initial_reads_all_tags() {
        use crate::protocol::sim::SimFieldClient;

        let client = SimFieldClient::with_values(vec![
            ("ns=2;i=5", json!(21.0)),
            ("ns=2;i=6", json!("2.345")),
        ]);
        client.connect().await.unwrap();
        let client: Arc<dyn FieldClient> = Arc::new(client);

        let cache = Arc::new(ValueCache::new());
        let fanout = NotificationFanout::new(test_registry(), cache.clone());
        fanout.seed_initial(&client).await;

        assert_eq!(cache.get("Temp1").unwrap().value, Some(21.0));
        assert_eq!(cache.get("Pressure1").unwrap().value, Some(2.35));
    }

    #[tokio::test]
    async fn test_pump_recovers_after_channel_close() {
        use crate::protocol::sim::SimFieldClient;
        use crate::storage::ColumnMapping;
        use std::time::Duration;

        let sim = SimFieldClient::with_values(vec![("ns=2;i=5", json!(20.0))]);
        sim.connect().await.unwrap();
        let client: Arc<dyn FieldClient> = Arc::new(sim.clone());

        let cache = Arc::new(ValueCache::new());
        let fanout = Arc::new(NotificationFanout::new(test_registry(), cache.clone()));
        let supervisor = Arc::new(ReconnectSupervisor::new(
            client.clone(),
            test_registry(),
            None,
            Arc::new(ColumnMapping::empty()),
            Duration::from_millis(1),
        ));

        let token = CancellationToken::new();
        let pump = tokio::spawn(fanout.clone().run(
            client.clone(),
            supervisor,
            token.clone(),
        ));

        // Give the pump time to arm the channel, then drop the session
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.close_events();

        // After recovery the cache is reseeded and new events flow again
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("Temp1").unwrap().value, Some(20.0));

        assert!(sim.emit("ns=2;i=5", json!(25.0)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("Temp1").unwrap().value, Some(25.0));

        token.cancel();
        pump.await.unwrap();
    }
}
