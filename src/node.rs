use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form properties a node publishes to the rest of its group.
pub type PropertiesMap = HashMap<String, serde_json::Value>;

/// Identity record for one member of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node_id: String,
    pub group_id: String,
    pub properties: PropertiesMap,
    /// Set from insert until some node's failure detector first announces it
    pub is_new_node: bool,
    /// Whether the node held the coordinator lock when this record was read
    pub is_coordinator: bool,
    /// `None` for snapshots of nodes that have already been removed
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeDetail {
    pub fn new(node_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            group_id: group_id.into(),
            properties: PropertiesMap::new(),
            is_new_node: false,
            is_coordinator: false,
            last_heartbeat: None,
        }
    }

    pub fn with_properties(mut self, properties: PropertiesMap) -> Self {
        self.properties = properties;
        self
    }

    /// Heartbeat age at `now`; `None` when no heartbeat is known.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_heartbeat.map(|hb| now - hb)
    }
}

pub(crate) fn encode_properties(properties: &PropertiesMap) -> serde_json::Result<String> {
    serde_json::to_string(properties)
}

pub(crate) fn decode_properties(raw: &str) -> serde_json::Result<PropertiesMap> {
    if raw.is_empty() {
        return Ok(PropertiesMap::new());
    }
    serde_json::from_str(raw)
}
