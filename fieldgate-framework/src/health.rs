//! Per-device link health and gateway-wide counters.
//!
//! Devices move through [`DeviceStatus`] on link events:
//!
//! - linked or data received: `Online`, failure streak reset
//! - poll failure on a live link: `Degraded`
//! - link lost or never established: `Offline`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::liveliness::LivelinessManager;
use crate::publisher::Publisher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health of one device as published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device: String,
    pub status: DeviceStatus,
    /// Last link-up or data, epoch millis.
    pub last_seen: i64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Gateway-wide snapshot published on `<prefix>/@/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub gateway: String,
    /// "healthy", "degraded" or "error".
    pub status: String,
    pub uptime_secs: u64,
    pub devices_total: u64,
    pub devices_online: u64,
    pub devices_offline: u64,
    pub errors_total: u64,
    pub values_published: u64,
    pub devices: Vec<DeviceHealth>,
}

#[derive(Debug)]
pub struct GatewayHealth {
    gateway: String,
    start_time: Instant,
    devices_total: AtomicU64,
    errors_total: AtomicU64,
    values_published: AtomicU64,
    devices: RwLock<HashMap<String, DeviceHealth>>,
    publisher: Option<Publisher>,
    liveliness: Option<Arc<LivelinessManager>>,
}

impl GatewayHealth {
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            start_time: Instant::now(),
            devices_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            values_published: AtomicU64::new(0),
            devices: RwLock::new(HashMap::new()),
            publisher: None,
            liveliness: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Keep device liveliness tokens in step with link events.
    pub fn with_liveliness(mut self, liveliness: Arc<LivelinessManager>) -> Self {
        self.liveliness = Some(liveliness);
        self
    }

    pub fn set_devices_total(&self, count: u64) {
        self.devices_total.store(count, Ordering::SeqCst);
    }

    fn update<F: FnOnce(&mut DeviceHealth)>(&self, device: &str, apply: F) -> DeviceStatus {
        let mut devices = self.devices.write();
        let entry = devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceHealth {
                device: device.to_string(),
                ..Default::default()
            });
        apply(entry);
        entry.status
    }

    fn mark_online(health: &mut DeviceHealth) {
        health.status = DeviceStatus::Online;
        health.last_seen = chrono::Utc::now().timestamp_millis();
        health.consecutive_failures = 0;
        health.last_error = None;
    }

    pub fn record_linked(&self, device: &str) {
        self.update(device, Self::mark_online);
    }

    /// The link dropped or could not be opened.
    pub fn record_unlinked(&self, device: &str, error: &str) {
        self.update(device, |h| {
            h.status = DeviceStatus::Offline;
            h.consecutive_failures += 1;
            h.last_error = Some(error.to_string());
        });
        self.errors_total.fetch_add(1, Ordering::SeqCst);
    }

    /// A poll failed while the link stayed up.
    pub fn record_collect_failure(&self, device: &str, error: &str) {
        self.update(device, |h| {
            if h.status != DeviceStatus::Offline {
                h.status = DeviceStatus::Degraded;
            }
            h.consecutive_failures += 1;
            h.last_error = Some(error.to_string());
        });
        self.errors_total.fetch_add(1, Ordering::SeqCst);
    }

    /// A poll decoded `count` values.
    pub fn record_values(&self, device: &str, count: u64) {
        self.update(device, Self::mark_online);
        self.values_published.fetch_add(count, Ordering::SeqCst);
    }

    pub async fn record_linked_async(&self, device: &str) {
        self.record_linked(device);
        if let Some(liveliness) = &self.liveliness {
            if let Err(e) = liveliness.declare_device_alive(device).await {
                tracing::warn!(device = %device, error = %e, "Failed to declare device liveliness");
            }
        }
    }

    pub async fn record_unlinked_async(&self, device: &str, error: &str) {
        self.record_unlinked(device, error);
        if let Some(liveliness) = &self.liveliness {
            liveliness.undeclare_device(device).await;
        }
    }

    pub fn device_health(&self, device: &str) -> Option<DeviceHealth> {
        self.devices.read().get(device).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.device.cmp(&b.device));

        let devices_total = self.devices_total.load(Ordering::SeqCst);
        let online = devices
            .iter()
            .filter(|d| matches!(d.status, DeviceStatus::Online | DeviceStatus::Degraded))
            .count() as u64;
        let offline = devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Offline)
            .count() as u64;

        let status = if offline == 0 {
            "healthy"
        } else if online > 0 {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            gateway: self.gateway.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            devices_total,
            devices_online: online,
            devices_offline: offline,
            errors_total: self.errors_total.load(Ordering::SeqCst),
            values_published: self.values_published.load(Ordering::SeqCst),
            devices,
        }
    }

    pub async fn publish_health(&self) -> Result<()> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        publisher
            .publish_json(&publisher.keys().health_key(), &self.snapshot())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_new() {
        let health = GatewayHealth::new("modbus");
        let snapshot = health.snapshot();
        assert_eq!(snapshot.gateway, "modbus");
        assert_eq!(snapshot.status, "healthy");
        assert!(snapshot.devices.is_empty());
    }

    #[test]
    fn test_link_lifecycle() {
        let health = GatewayHealth::new("modbus");
        health.set_devices_total(1);

        health.record_unlinked("plc", "connection refused");
        let plc = health.device_health("plc").unwrap();
        assert_eq!(plc.status, DeviceStatus::Offline);
        assert_eq!(plc.last_error.as_deref(), Some("connection refused"));

        health.record_linked("plc");
        let plc = health.device_health("plc").unwrap();
        assert_eq!(plc.status, DeviceStatus::Online);
        assert_eq!(plc.consecutive_failures, 0);
        assert!(plc.last_error.is_none());
    }

    #[test]
    fn test_collect_failure_degrades_but_values_recover() {
        let health = GatewayHealth::new("modbus");
        health.record_linked("plc");

        health.record_collect_failure("plc", "exception 2");
        health.record_collect_failure("plc", "exception 2");
        let plc = health.device_health("plc").unwrap();
        assert_eq!(plc.status, DeviceStatus::Degraded);
        assert_eq!(plc.consecutive_failures, 2);

        health.record_values("plc", 5);
        assert_eq!(health.device_health("plc").unwrap().status, DeviceStatus::Online);
        assert_eq!(health.snapshot().values_published, 5);
    }

    #[test]
    fn test_collect_failure_keeps_offline() {
        let health = GatewayHealth::new("modbus");
        health.record_unlinked("plc", "reset");
        health.record_collect_failure("plc", "timeout");
        assert_eq!(health.device_health("plc").unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn test_overall_status() {
        let health = GatewayHealth::new("modbus");
        health.set_devices_total(2);
        health.record_linked("a");
        health.record_linked("b");
        assert_eq!(health.snapshot().status, "healthy");

        health.record_unlinked("a", "broken pipe");
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, "degraded");
        assert_eq!(snapshot.devices_offline, 1);
        assert_eq!(snapshot.errors_total, 1);

        health.record_unlinked("b", "broken pipe");
        assert_eq!(health.snapshot().status, "error");
    }
}
