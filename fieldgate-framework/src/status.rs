//! Gateway status messages on `<prefix>/@/status`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::publisher::Publisher;

/// Interval between "running" heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Produces extra fields for each heartbeat, e.g. device counts.
pub type MetadataFn = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub gateway: String,
    pub version: String,
    /// "running", "offline" or "error".
    pub status: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl GatewayStatus {
    fn with_state(gateway: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            gateway: gateway.into(),
            version: version.into(),
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: Map::new(),
        }
    }

    pub fn running(gateway: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(gateway, version, "running")
    }

    pub fn offline(gateway: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(gateway, version, "offline")
    }

    pub fn error(
        gateway: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut status = Self::with_state(gateway, version, "error");
        status
            .metadata
            .insert("error".to_string(), Value::String(error.into()));
        status
    }

    /// Merge the fields of a JSON object; anything else is ignored.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(fields) = metadata {
            self.metadata.extend(fields);
        }
        self
    }

    pub async fn publish(&self, publisher: &Publisher) -> Result<()> {
        publisher
            .publish_json(&publisher.keys().status_key(), self)
            .await
    }
}

/// Publishes the gateway's status under its name and version.
#[derive(Clone)]
pub struct StatusPublisher {
    publisher: Publisher,
    gateway: String,
    version: String,
    metadata: Option<MetadataFn>,
}

impl StatusPublisher {
    pub fn new(publisher: Publisher, gateway: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            publisher,
            gateway: gateway.into(),
            version: version.into(),
            metadata: None,
        }
    }

    /// Attach live metadata to every "running" message.
    pub fn with_metadata_fn(mut self, metadata: MetadataFn) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub async fn publish_running(&self) -> Result<()> {
        let mut status = GatewayStatus::running(&self.gateway, &self.version);
        if let Some(metadata) = &self.metadata {
            status = status.with_metadata(metadata());
        }
        status.publish(&self.publisher).await
    }

    pub async fn publish_offline(&self) -> Result<()> {
        GatewayStatus::offline(&self.gateway, &self.version)
            .publish(&self.publisher)
            .await
    }

    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        GatewayStatus::error(&self.gateway, &self.version, error)
            .publish(&self.publisher)
            .await
    }

    /// Publish "running" every `interval` until the task is dropped.
    pub async fn heartbeat(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.publish_running().await {
                tracing::warn!(error = %e, "Failed to publish status heartbeat");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = GatewayStatus::running("modbus", "0.2.0");
        assert_eq!(status.gateway, "modbus");
        assert_eq!(status.status, "running");
        assert!(status.timestamp > 0);
    }

    #[test]
    fn test_status_metadata_is_flattened() {
        let status = GatewayStatus::running("modbus", "0.2.0")
            .with_metadata(serde_json::json!({ "devices_total": 4, "devices_linked": 3 }))
            .with_metadata(serde_json::json!("ignored"));

        let json: Value = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["devices_total"], 4);
        assert_eq!(json["devices_linked"], 3);
    }

    #[test]
    fn test_status_error_carries_message() {
        let status = GatewayStatus::error("modbus", "0.2.0", "zenoh down");
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"zenoh down\""));
    }
}
