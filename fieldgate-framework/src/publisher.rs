//! Telemetry publisher over a Zenoh session.

use std::sync::Arc;

use fieldgate_common::{Format, KeyExprBuilder, TelemetryPoint, encode};

use crate::error::{FrameworkError, Result};

/// Serializes [`TelemetryPoint`]s and puts them under the gateway prefix.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    keys: KeyExprBuilder,
    format: Format,
}

impl Publisher {
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>, format: Format) -> Self {
        Self {
            session,
            keys: KeyExprBuilder::new(key_prefix),
            format,
        }
    }

    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    pub fn key_prefix(&self) -> &str {
        self.keys.prefix()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Publish one point on `<prefix>/<device>/<metric>`.
    pub async fn publish(&self, device: &str, point: &TelemetryPoint) -> Result<()> {
        let key = self.keys.telemetry(device, &point.metric);
        self.publish_to_key(&key, point).await
    }

    pub async fn publish_to_key(&self, key: &str, point: &TelemetryPoint) -> Result<()> {
        let payload =
            encode(point, self.format).map_err(|e| FrameworkError::Serialization(e.to_string()))?;
        self.publish_raw(key, payload).await
    }

    /// Publish every point of one device; failures are logged and counted.
    pub async fn publish_batch(&self, device: &str, points: &[TelemetryPoint]) -> PublishStats {
        let mut stats = PublishStats::default();

        for point in points {
            match self.publish(device, point).await {
                Ok(()) => stats.success += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(device = %device, metric = %point.metric, error = %e, "Failed to publish telemetry");
                }
            }
        }

        stats
    }

    pub async fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| FrameworkError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Always JSON, whatever the telemetry format.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: usize,
    pub failed: usize,
}

impl PublishStats {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Percentage of successful publishes; 100 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }
}
