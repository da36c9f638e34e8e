//! Static tag registry
//!
//! Built once at startup from configuration and never mutated afterwards,
//! so it is shared across threads as a plain `Arc` without synchronization.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use std::collections::HashMap;

/// One monitored point: stable name, protocol address, display unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub node_id: String,
    pub unit: String,
}

/// Mapping from tag name and protocol node id to tag metadata
#[derive(Debug)]
pub struct TagRegistry {
    tags: Vec<Tag>,
    by_name: HashMap<String, usize>,
    by_node: HashMap<String, usize>,
}

impl TagRegistry {
    /// Build the registry from configuration
    ///
    /// Fails when a declared tag is missing its node identifier or when tag
    /// names collide; both would make later event resolution ambiguous.
    pub fn load(config: &Config) -> Result<Self> {
        let mut tags = Vec::with_capacity(config.tags.len());
        let mut by_name = HashMap::with_capacity(config.tags.len());
        let mut by_node = HashMap::with_capacity(config.tags.len());

        for (i, tc) in config.tags.iter().enumerate() {
            if tc.node_id.is_empty() {
                return Err(GatewayError::MissingConfig(format!(
                    "tags[{}].node_id (tag '{}')",
                    i, tc.name
                )));
            }

            let idx = tags.len();
            if by_name.insert(tc.name.clone(), idx).is_some() {
                return Err(GatewayError::Configuration(format!(
                    "Duplicate tag name: {}",
                    tc.name
                )));
            }
            if by_node.insert(tc.node_id.clone(), idx).is_some() {
                return Err(GatewayError::Configuration(format!(
                    "Duplicate node id: {}",
                    tc.node_id
                )));
            }

            tags.push(Tag {
                name: tc.name.clone(),
                node_id: tc.node_id.clone(),
                unit: tc.unit.clone(),
            });
        }

        Ok(Self {
            tags,
            by_name,
            by_node,
        })
    }

    /// Look up a tag by its configured name
    pub fn lookup(&self, name: &str) -> Option<&Tag> {
        self.by_name.get(name).map(|&i| &self.tags[i])
    }

    /// Resolve a protocol node id back to its tag
    pub fn lookup_node(&self, node_id: &str) -> Option<&Tag> {
        self.by_node.get(node_id).map(|&i| &self.tags[i])
    }

    /// All tags in configuration order
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
