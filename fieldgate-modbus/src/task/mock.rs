//! Scripted connector for processor and pool tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::codec::DecodedFrame;
use crate::command::OperateCmd;
use crate::connector::{
    CollectFailCallback, Connector, DataSwapCallback, LinkState, LinkedCallback,
    UnlinkedCallback,
};
use crate::error::ConnectorError;
use crate::model::Device;
use crate::snapshot::PointGroup;

pub const MOCK_INTERFACE: &str = "mock";

#[derive(Debug)]
pub struct MockConnector {
    device: Arc<Device>,
    link: LinkState,
    /// Opens that fail before one succeeds.
    pub failing_opens: AtomicU32,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    /// Start address of every collected group, in order.
    pub collected: Mutex<Vec<u16>>,
    /// Operations that time out before one succeeds.
    pub failing_operations: AtomicU32,
    pub operations: AtomicUsize,
    /// Reply to successful operations.
    pub reply: Vec<u8>,
    dropped: AtomicBool,
}

impl MockConnector {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            link: LinkState::default(),
            failing_opens: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            collected: Mutex::new(Vec::new()),
            failing_operations: AtomicU32::new(0),
            operations: AtomicUsize::new(0),
            reply: vec![0x00, 0x2A],
            dropped: AtomicBool::new(false),
        }
    }

    /// Simulate the peer going away.
    pub fn drop_link(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.link
            .unlinked(&self.device, &ConnectorError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn interface_type(&self) -> &str {
        MOCK_INTERFACE
    }

    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    async fn open(&self) -> Result<(), ConnectorError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.failing_opens) {
            let e = ConnectorError::Io(std::io::ErrorKind::ConnectionRefused.into());
            self.link.unlinked(&self.device, &e);
            return Err(e);
        }
        self.dropped.store(false, Ordering::SeqCst);
        self.link.linked(&self.device);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.link.is_linked() {
            self.link.unlinked(&self.device, &ConnectorError::NotLinked);
        }
    }

    async fn flush(&self) {}

    async fn write(&self, _data: &[u8]) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn write_by_timeout(&self, _timeout: Duration, _data: &[u8]) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn read(&self) -> Result<DecodedFrame, ConnectorError> {
        Err(ConnectorError::Closed)
    }

    async fn read_by_timeout(&self, _timeout: Duration) -> Result<DecodedFrame, ConnectorError> {
        Err(ConnectorError::DeadlineExceeded)
    }

    async fn send_and_wait_for_reply_by_timeout(
        &self,
        _key: &str,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<DecodedFrame, ConnectorError> {
        Err(ConnectorError::DeadlineExceeded)
    }

    async fn collect(
        &self,
        _key: String,
        _frame: Vec<u8>,
        group: Arc<PointGroup>,
    ) -> Result<(), ConnectorError> {
        self.collected.lock().push(group.start());
        Ok(())
    }

    async fn operate(&self, _cmd: &OperateCmd) -> Result<Vec<u8>, ConnectorError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.failing_operations) {
            return Err(ConnectorError::DeadlineExceeded);
        }
        Ok(self.reply.clone())
    }

    fn is_linked(&self) -> bool {
        self.link.is_linked() && !self.dropped.load(Ordering::SeqCst)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn add_success_linked_callback(&self, callback: LinkedCallback) {
        self.link.add_linked(callback);
    }

    fn add_fail_linked_callback(&self, callback: UnlinkedCallback) {
        self.link.add_unlinked(callback);
    }

    fn add_data_swap_callback(&self, callback: DataSwapCallback) {
        self.link.add_data(callback);
    }

    fn add_collect_fail_callback(&self, callback: CollectFailCallback) {
        self.link.add_collect_fail(callback);
    }
}

pub fn device(id: &str) -> Arc<Device> {
    Arc::new(
        serde_json::from_value(serde_json::json!({
            "id": id,
            "table": format!("{}_table", id),
            "interface_type": MOCK_INTERFACE,
            "protocol_type": "modbus_tcp",
            "address": "127.0.0.1:1502"
        }))
        .unwrap(),
    )
}

pub fn point(device_id: &str, address: u16) -> crate::model::Point {
    serde_json::from_value(serde_json::json!({
        "id": format!("{}-{}", device_id, address),
        "device_id": device_id,
        "tag": format!("r{}", address),
        "function_code": 3,
        "address": address,
        "data_type": "uint16"
    }))
    .unwrap()
}
