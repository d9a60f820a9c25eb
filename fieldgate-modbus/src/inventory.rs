//! Where device, point and collection-rule records come from.
//!
//! [`Inventory`] is the seam to the configuration store. The gateway ships
//! [`MemoryInventory`], filled from the config file; a database-backed store
//! implements the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{CollectionRule, Device, Point};

#[async_trait]
pub trait Inventory: Send + Sync {
    /// Devices with the cut-in flag set.
    async fn enabled_devices(&self) -> Vec<Arc<Device>>;

    async fn points(&self, device_id: &str) -> Vec<Arc<Point>>;

    /// Collection rules of a device, in record order.
    async fn rules(&self, device_id: &str) -> Vec<CollectionRule>;
}

/// Records held in memory, keyed by device id.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    devices: Vec<Arc<Device>>,
    points: HashMap<String, Vec<Arc<Point>>>,
    rules: HashMap<String, Vec<CollectionRule>>,
}

impl MemoryInventory {
    pub fn new(devices: Vec<Device>, points: Vec<Point>, rules: Vec<CollectionRule>) -> Self {
        let mut inventory = Self {
            devices: devices.into_iter().map(Arc::new).collect(),
            ..Default::default()
        };
        for point in points {
            inventory
                .points
                .entry(point.device_id.clone())
                .or_default()
                .push(Arc::new(point));
        }
        for rule in rules {
            inventory
                .rules
                .entry(rule.device_id.clone())
                .or_default()
                .push(rule);
        }
        inventory
    }

    pub fn device(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Points whose device id matches no device.
    pub fn orphan_points(&self) -> impl Iterator<Item = &Arc<Point>> {
        self.points
            .iter()
            .filter(|(id, _)| self.device(id).is_none())
            .flat_map(|(_, points)| points)
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn enabled_devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().filter(|d| d.enabled).cloned().collect()
    }

    async fn points(&self, device_id: &str) -> Vec<Arc<Point>> {
        self.points.get(device_id).cloned().unwrap_or_default()
    }

    async fn rules(&self, device_id: &str) -> Vec<CollectionRule> {
        self.rules.get(device_id).cloned().unwrap_or_default()
    }
}
