//! All task processors of the gateway, addressable by device id or table flag.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::processor::{RetryPolicy, TaskProcessor};
use crate::command::{ControlCarrier, SignType};
use crate::connector::{CollectFailCallback, DataSwapCallback, LinkedCallback, UnlinkedCallback};
use crate::error::PoolError;
use crate::inventory::Inventory;
use crate::registry::Registry;

/// Callbacks attached to every connector the pool builds.
#[derive(Clone, Default)]
pub struct CallbackSet {
    pub linked: Option<LinkedCallback>,
    pub unlinked: Option<UnlinkedCallback>,
    pub data: Option<DataSwapCallback>,
    pub collect_fail: Option<CollectFailCallback>,
}

#[derive(Debug, Default)]
pub struct TaskPool {
    by_id: HashMap<String, Arc<TaskProcessor>>,
    by_table: HashMap<String, Arc<TaskProcessor>>,
    starters: Mutex<Vec<JoinHandle<bool>>>,
}

impl TaskPool {
    /// One processor per enabled device. Devices that cannot be built are
    /// logged and left out.
    pub async fn build(
        inventory: &dyn Inventory,
        registry: &Registry,
        callbacks: &CallbackSet,
        policy: RetryPolicy,
    ) -> Self {
        let mut pool = Self::default();

        for device in inventory.enabled_devices().await {
            let points = inventory.points(&device.id).await;
            let rules = inventory.rules(&device.id).await;
            let processor =
                match TaskProcessor::new(Arc::clone(&device), &points, &rules, registry, policy) {
                    Ok(processor) => Arc::new(processor),
                    Err(e) => {
                        error!("Skipping device {}: {}", device.identifier(), e);
                        continue;
                    }
                };
            attach(&processor, callbacks);
            pool.insert(processor);
        }

        info!("Task pool holds {} devices", pool.len());
        pool
    }

    fn insert(&mut self, processor: Arc<TaskProcessor>) {
        let device = processor.device();
        if !device.table.is_empty() {
            if self.by_table.contains_key(&device.table) {
                warn!(
                    "Table flag '{}' of {} is already taken, reachable by id only",
                    device.table,
                    device.identifier()
                );
            } else {
                self.by_table
                    .insert(device.table.clone(), Arc::clone(&processor));
            }
        }
        if let Some(previous) = self.by_id.insert(device.id.clone(), processor) {
            warn!("Device id '{}' appears twice, keeping the last", previous.device().id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&Arc<TaskProcessor>> {
        self.by_id.get(device_id)
    }

    pub fn processors(&self) -> impl Iterator<Item = &Arc<TaskProcessor>> {
        self.by_id.values()
    }

    /// Start every processor in the background; each keeps retrying its
    /// link until it comes up or the pool shuts down.
    pub fn start_all(&self) {
        let mut starters = self.starters.lock();
        for processor in self.by_id.values() {
            let processor = Arc::clone(processor);
            starters.push(tokio::spawn(async move { processor.start().await }));
        }
    }

    pub async fn shutdown(&self) {
        for processor in self.by_id.values() {
            processor.shutdown().await;
        }
        let starters = std::mem::take(&mut *self.starters.lock());
        for starter in starters {
            if let Err(e) = starter.await {
                warn!("Processor start task failed: {}", e);
            }
        }
        info!("Task pool stopped");
    }

    /// Validate a carrier, route it, and run its command.
    ///
    /// A failed command is retried `reply_size` times; the first success
    /// wins, otherwise the last error is returned.
    pub async fn exec(&self, carrier: &ControlCarrier) -> Result<Vec<u8>, PoolError> {
        let cmd = carrier.check(chrono::Utc::now().timestamp_millis())?;
        let processor = self.resolve(carrier)?;

        let mut result = processor.operate(cmd).await;
        for attempt in 0..carrier.reply_size {
            let Err(e) = &result else { break };
            debug!(
                "Command {} on {} failed: {}, retry {}/{}",
                carrier.unique_identifier,
                processor.device().identifier(),
                e,
                attempt + 1,
                carrier.reply_size
            );
            result = processor.operate(cmd).await;
        }
        Ok(result?)
    }

    fn resolve(&self, carrier: &ControlCarrier) -> Result<&Arc<TaskProcessor>, PoolError> {
        let found = match carrier.sign_type {
            Some(SignType::Id) => self.by_id.get(&carrier.sign),
            Some(SignType::TableFlag) => self.by_table.get(&carrier.sign),
            None => None,
        };
        found.ok_or_else(|| PoolError::NotFound {
            sign_type: carrier
                .sign_type
                .map(|s| s.as_str())
                .unwrap_or("none")
                .to_string(),
            sign: carrier.sign.clone(),
        })
    }
}

fn attach(processor: &TaskProcessor, callbacks: &CallbackSet) {
    let connector = processor.connector();
    if let Some(cb) = &callbacks.linked {
        connector.add_success_linked_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.unlinked {
        connector.add_fail_linked_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.data {
        connector.add_data_swap_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.collect_fail {
        connector.add_collect_fail_callback(Arc::clone(cb));
    }
}
