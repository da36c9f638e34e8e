//! Reconnection supervisor
//!
//! Uniform failure-recovery policy for both external sessions: tear down
//! swallowing errors, wait a short fixed backoff, attempt one fresh
//! connect. A storage recovery reloads the column mapping before
//! persistence resumes; a field recovery resubscribes every registry node.
//! Attempts are best-effort: failures are logged and retried on the next
//! triggering failure, never escalated.

use crate::protocol::FieldClient;
use crate::registry::TagRegistry;
use crate::storage::{ColumnMapping, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct ReconnectSupervisor {
    field: Arc<dyn FieldClient>,
    registry: Arc<TagRegistry>,
    storage: Option<Arc<dyn Storage>>,
    mapping: Arc<ColumnMapping>,
    backoff: Duration,
    // one in-flight attempt per session type
    field_gate: Mutex<()>,
    storage_gate: Mutex<()>,
}

impl ReconnectSupervisor {
    pub fn new(
        field: Arc<dyn FieldClient>,
        registry: Arc<TagRegistry>,
        storage: Option<Arc<dyn Storage>>,
        mapping: Arc<ColumnMapping>,
        backoff: Duration,
    ) -> Self {
        Self {
            field,
            registry,
            storage,
            mapping,
            backoff,
            field_gate: Mutex::new(()),
            storage_gate: Mutex::new(()),
        }
    }

    /// Recover the storage session; returns true when a usable session is
    /// back up
    pub async fn reconnect_storage(&self) -> bool {
        let Some(storage) = &self.storage else {
            debug!("storage reconnect requested but persistence is disabled");
            return false;
        };
        let _gate = self.storage_gate.lock().await;

        if let Err(e) = storage.disconnect().await {
            debug!(error = %e, "storage teardown reported an error");
        }

        tokio::time::sleep(self.backoff).await;

        match storage.connect().await {
            Ok(()) => {
                match storage.load_mapping().await {
                    Ok(mapping) => {
                        info!(columns = mapping.len(), "storage session reestablished");
                        self.mapping.replace(mapping);
                    }
                    Err(e) => {
                        // Session is usable; the mapping stays stale until
                        // the next reconnect cycle
                        warn!(error = %e, "storage reconnected but mapping reload failed");
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "storage reconnect failed, will retry on next failure");
                false
            }
        }
    }

    /// Recover the field-protocol session and its subscriptions
    ///
    /// The caller is expected to reopen the event channel and reseed
    /// initial values after a successful recovery.
    pub async fn reconnect_field(&self) -> bool {
        let _gate = self.field_gate.lock().await;

        if let Err(e) = self.field.disconnect().await {
            debug!(error = %e, "field teardown reported an error");
        }

        tokio::time::sleep(self.backoff).await;

        match self.field.connect().await {
            Ok(()) => {
                for tag in self.registry.tags() {
                    if let Err(e) = self.field.subscribe(&tag.node_id).await {
                        warn!(tag = %tag.name, error = %e, "resubscribe failed");
                    }
                }
                info!("field session reestablished");
                true
            }
            Err(e) => {
                warn!(error = %e, "field reconnect failed, will retry on next failure");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FieldConfig, TagConfig};
    use crate::protocol::sim::SimFieldClient;
    use crate::storage::MemoryStorage;
    use std::collections::HashMap;

    fn test_registry() -> Arc<TagRegistry> {
        let config = Config {
            service: Default::default(),
            field: FieldConfig {
                driver: "sim".to_string(),
                endpoint: "sim".to_string(),
                publish_interval_ms: 0,
            },
            tags: vec![TagConfig {
                name: "Temp1".to_string(),
                node_id: "ns=2;i=5".to_string(),
                unit: "C".to_string(),
            }],
            database: Default::default(),
            http: Default::default(),
        };
        Arc::new(TagRegistry::load(&config).unwrap())
    }

    #[tokio::test]
    async fn test_storage_reconnect_reloads_mapping() {
        let field = Arc::new(SimFieldClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let mapping = Arc::new(ColumnMapping::empty());

        storage.set_mapping(HashMap::from([(
            "Temp1".to_string(),
            "temp_inlet".to_string(),
        )]));

        let supervisor = ReconnectSupervisor::new(
            field,
            test_registry(),
            Some(storage.clone() as Arc<dyn Storage>),
            mapping.clone(),
            Duration::from_millis(1),
        );

        assert!(supervisor.reconnect_storage().await);
        assert!(storage.is_connected());
        assert_eq!(mapping.column_for("Temp1").unwrap(), "temp_inlet");
        assert_eq!(storage.mapping_load_count(), 1);

        // A later reconnect picks up operator edits to the mapping table
        storage.set_mapping(HashMap::from([(
            "Temp1".to_string(),
            "temp_outlet".to_string(),
        )]));
        assert!(supervisor.reconnect_storage().await);
        assert_eq!(mapping.column_for("Temp1").unwrap(), "temp_outlet");
    }

    #[tokio::test]
    async fn test_storage_reconnect_failure_is_contained() {
        let field = Arc::new(SimFieldClient::new());
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_connects(true);

        let supervisor = ReconnectSupervisor::new(
            field,
            test_registry(),
            Some(storage.clone() as Arc<dyn Storage>),
            Arc::new(ColumnMapping::empty()),
            Duration::from_millis(1),
        );

        assert!(!supervisor.reconnect_storage().await);
        assert!(!storage.is_connected());
        assert_eq!(storage.mapping_load_count(), 0);
    }

    #[tokio::test]
    async fn test_field_reconnect_resubscribes() {
        let field = Arc::new(SimFieldClient::new());
        field.connect().await.unwrap();

        let supervisor = ReconnectSupervisor::new(
            field.clone(),
            test_registry(),
            None,
            Arc::new(ColumnMapping::empty()),
            Duration::from_millis(1),
        );

        assert!(supervisor.reconnect_field().await);
        assert!(field.is_connected());
        assert_eq!(field.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_storage_is_noop() {
        let field = Arc::new(SimFieldClient::new());
        let supervisor = ReconnectSupervisor::new(
            field,
            test_registry(),
            None,
            Arc::new(ColumnMapping::empty()),
            Duration::from_millis(1),
        );

        assert!(!supervisor.reconnect_storage().await);
    }
}
