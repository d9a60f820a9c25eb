//! Glue between the task pool and Zenoh.
//!
//! Connector callbacks run on I/O tasks and must not block, so they only
//! push [`GatewayEvent`]s into a channel. [`run_events`] drains it: decoded
//! values become telemetry, link changes drive health and liveliness.

use fieldgate_common::{TelemetryPoint, TelemetryValue};
use fieldgate_framework::{GatewayHealth, Publisher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::ControlCarrier;
use crate::error::{ConnectorError, ControlError};
use crate::inventory::Inventory;
use crate::model::{Device, Point};
use crate::snapshot::PointGroup;
use crate::task::{CallbackSet, TaskPool};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Linked {
        device_id: String,
    },
    Unlinked {
        device_id: String,
        error: String,
    },
    Data {
        device_id: String,
        values: HashMap<String, TelemetryValue>,
        timestamp: i64,
    },
    CollectFailed {
        device_id: String,
        function_code: u8,
        start: u16,
        error: String,
    },
}

/// Callbacks that forward every connector event into `tx`.
pub fn event_callbacks(tx: mpsc::UnboundedSender<GatewayEvent>) -> CallbackSet {
    let linked = tx.clone();
    let unlinked = tx.clone();
    let data = tx.clone();
    let failed = tx;

    CallbackSet {
        linked: Some(Arc::new(move |device: &Device| {
            info!("{} linked", device.identifier());
            let _ = linked.send(GatewayEvent::Linked {
                device_id: device.id.clone(),
            });
        })),
        unlinked: Some(Arc::new(move |device: &Device, error: &ConnectorError| {
            warn!("{} unlinked: {}", device.identifier(), error);
            let _ = unlinked.send(GatewayEvent::Unlinked {
                device_id: device.id.clone(),
                error: error.to_string(),
            });
        })),
        data: Some(Arc::new(
            move |device: &Device, values: HashMap<String, TelemetryValue>, timestamp: i64| {
                let _ = data.send(GatewayEvent::Data {
                    device_id: device.id.clone(),
                    values,
                    timestamp,
                });
            },
        )),
        collect_fail: Some(Arc::new(
            move |device: &Device, group: &PointGroup, error: &ConnectorError| {
                debug!(
                    "{} poll of fc {} at {} failed: {}",
                    device.identifier(),
                    group.function_code(),
                    group.start(),
                    error
                );
                let _ = failed.send(GatewayEvent::CollectFailed {
                    device_id: device.id.clone(),
                    function_code: group.function_code(),
                    start: group.start(),
                    error: error.to_string(),
                });
            },
        )),
    }
}

struct DeviceEntry {
    device: Arc<Device>,
    points: HashMap<String, Arc<Point>>,
}

/// Turns decoded `{tag: value}` maps into labeled telemetry points.
#[derive(Default)]
pub struct TelemetryMapper {
    devices: HashMap<String, DeviceEntry>,
}

impl TelemetryMapper {
    pub async fn from_inventory(inventory: &dyn Inventory) -> Self {
        let mut devices = HashMap::new();
        for device in inventory.enabled_devices().await {
            let points = inventory
                .points(&device.id)
                .await
                .into_iter()
                .map(|p| (p.tag.clone(), p))
                .collect();
            devices.insert(device.id.clone(), DeviceEntry { device, points });
        }
        Self { devices }
    }

    /// Points sorted by tag. Tags unknown to the inventory are still
    /// published, without point labels.
    pub fn map(
        &self,
        device_id: &str,
        values: HashMap<String, TelemetryValue>,
        timestamp: i64,
    ) -> Vec<TelemetryPoint> {
        let entry = self.devices.get(device_id);
        let protocol = entry.map_or("modbus", |e| e.device.protocol_type.as_str());

        let mut points: Vec<_> = values
            .into_iter()
            .map(|(tag, value)| {
                let mut point = TelemetryPoint::new(device_id, protocol, tag, value)
                    .at(timestamp)
                    .with_label("device_id", device_id);
                if let Some(entry) = entry {
                    if !entry.device.table.is_empty() {
                        point = point.with_label("table", entry.device.table.as_str());
                    }
                    if let Some(meta) = entry.points.get(&point.metric) {
                        point = point.with_label("function_code", meta.function_code.to_string());
                        if let Some(unit) = &meta.unit {
                            point = point.with_label("unit", unit.as_str());
                        }
                    }
                }
                point
            })
            .collect();
        points.sort_by(|a, b| a.metric.cmp(&b.metric));
        points
    }
}

/// Drain connector events until every sender is gone.
pub async fn run_events(
    mut rx: mpsc::UnboundedReceiver<GatewayEvent>,
    mapper: TelemetryMapper,
    publisher: Publisher,
    health: Arc<GatewayHealth>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            GatewayEvent::Linked { device_id } => {
                health.record_linked_async(&device_id).await;
                publish_health(&health).await;
            }
            GatewayEvent::Unlinked { device_id, error } => {
                health.record_unlinked_async(&device_id, &error).await;
                publish_health(&health).await;
            }
            GatewayEvent::Data {
                device_id,
                values,
                timestamp,
            } => {
                let points = mapper.map(&device_id, values, timestamp);
                let stats = publisher.publish_batch(&device_id, &points).await;
                debug!(
                    "{}: published {}/{} values",
                    device_id,
                    stats.success,
                    stats.total()
                );
                health.record_values(&device_id, stats.success as u64);
            }
            GatewayEvent::CollectFailed {
                device_id, error, ..
            } => {
                health.record_collect_failure(&device_id, &error);
            }
        }
    }
    debug!("Event channel closed");
}

async fn publish_health(health: &GatewayHealth) {
    if let Err(e) = health.publish_health().await {
        warn!("Failed to publish health: {}", e);
    }
}

/// Successful control reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    pub unique_identifier: String,
    /// Response payload as hex.
    pub response: String,
}

/// Decode a JSON carrier, run it, and build the reply.
pub async fn handle_control(pool: &TaskPool, payload: &[u8]) -> Result<ControlReply, ControlError> {
    let carrier: ControlCarrier = serde_json::from_slice(payload)?;
    debug!(
        "Control {} for {:?} {:?}",
        carrier.unique_identifier, carrier.sign_type, carrier.sign
    );
    let response = pool.exec(&carrier).await?;
    Ok(ControlReply {
        ok: true,
        unique_identifier: carrier.unique_identifier,
        response: hex::encode(response),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OperateCmd;
    use crate::connector::Connector;
    use crate::error::PoolError;
    use crate::inventory::MemoryInventory;
    use crate::registry::{CodecOptions, Registry};
    use crate::task::RetryPolicy;
    use crate::task::mock::{self, MOCK_INTERFACE, MockConnector};

    fn inventory() -> MemoryInventory {
        let mut temp = mock::point("boiler", 0);
        temp.tag = "temp".into();
        temp.unit = Some("degC".into());
        MemoryInventory::new(
            vec![(*mock::device("boiler")).clone()],
            vec![temp, mock::point("boiler", 1)],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_callbacks_forward_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = event_callbacks(tx);
        let connector = MockConnector::new(mock::device("boiler"));
        connector.add_success_linked_callback(callbacks.linked.clone().unwrap());
        connector.add_fail_linked_callback(callbacks.unlinked.clone().unwrap());

        connector.open().await.unwrap();
        connector.close().await;

        assert_eq!(
            rx.recv().await,
            Some(GatewayEvent::Linked {
                device_id: "boiler".into()
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Unlinked { ref device_id, .. }) if device_id == "boiler"
        ));

        let data = callbacks.data.unwrap();
        data(
            &*mock::device("boiler"),
            HashMap::from([("temp".to_string(), TelemetryValue::Float(21.5))]),
            42,
        );
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Data { timestamp: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_mapper_labels_points() {
        let mapper = TelemetryMapper::from_inventory(&inventory()).await;
        let values = HashMap::from([
            ("temp".to_string(), TelemetryValue::Float(21.5)),
            ("r1".to_string(), TelemetryValue::Unsigned(7)),
            ("stray".to_string(), TelemetryValue::Boolean(true)),
        ]);

        let points = mapper.map("boiler", values, 1_700_000_000_000);
        let metrics: Vec<_> = points.iter().map(|p| p.metric.as_str()).collect();
        assert_eq!(metrics, vec!["r1", "stray", "temp"]);

        let temp = &points[2];
        assert_eq!(temp.timestamp, 1_700_000_000_000);
        assert_eq!(temp.protocol, "modbus_tcp");
        assert_eq!(temp.labels["table"], "boiler_table");
        assert_eq!(temp.labels["function_code"], "3");
        assert_eq!(temp.labels["unit"], "degC");

        let stray = &points[1];
        assert_eq!(stray.labels["device_id"], "boiler");
        assert!(!stray.labels.contains_key("function_code"));
    }

    async fn pool() -> (TaskPool, Arc<MockConnector>) {
        let slot: Arc<parking_lot::Mutex<Option<Arc<MockConnector>>>> = Arc::default();
        let sink = Arc::clone(&slot);
        let mut registry = Registry::with_defaults(Default::default(), CodecOptions::default());
        registry.register_connector(
            MOCK_INTERFACE,
            Arc::new(
                move |device: Arc<Device>,
                      _: Box<dyn crate::codec::ProtocolCodec>,
                      _: &crate::connector::ConnectorOptions|
                      -> Arc<dyn Connector> {
                    let connector = Arc::new(MockConnector::new(device));
                    *sink.lock() = Some(Arc::clone(&connector));
                    connector
                },
            ),
        );
        let pool = TaskPool::build(
            &inventory(),
            &registry,
            &CallbackSet::default(),
            RetryPolicy::default(),
        )
        .await;
        let mock = slot.lock().take().unwrap();
        (pool, mock)
    }

    #[tokio::test]
    async fn test_handle_control_replies_hex() {
        let (pool, mock) = pool().await;
        mock.open().await.unwrap();

        let carrier = ControlCarrier::new(OperateCmd::copy_read(3, 0, 1)).by_table_flag("boiler_table");
        let payload = serde_json::to_vec(&carrier).unwrap();
        let reply = handle_control(&pool, &payload).await.unwrap();

        assert!(reply.ok);
        assert_eq!(reply.unique_identifier, carrier.unique_identifier);
        assert_eq!(reply.response, "002a");
    }

    #[tokio::test]
    async fn test_handle_control_errors() {
        let (pool, _mock) = pool().await;

        assert!(matches!(
            handle_control(&pool, b"not json").await,
            Err(ControlError::Payload(_))
        ));

        let carrier = ControlCarrier::new(OperateCmd::copy_read(3, 0, 1)).by_device_id("boiler");
        let payload = serde_json::to_vec(&carrier).unwrap();
        assert!(matches!(
            handle_control(&pool, &payload).await,
            Err(ControlError::Pool(PoolError::Processor(_)))
        ));
    }
}
