//! Transport links to field devices.
//!
//! A [`Connector`] owns one physical link (a TCP stream or a serial line),
//! frames traffic through its [`ProtocolCodec`], and reports what happens on
//! the link through registered callbacks. Polls go through
//! [`Connector::collect`]; control commands through [`Connector::operate`].

pub mod serial;
pub mod tcp;

use async_trait::async_trait;
use fieldgate_common::TelemetryValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::DecodedFrame;
use crate::command::OperateCmd;
use crate::correlation::DEFAULT_QUEUE_CAPACITY;
use crate::decoder::PointDecoder;
use crate::error::ConnectorError;
use crate::model::Device;
use crate::snapshot::PointGroup;

pub use serial::{SerialConnector, SerialIo, SerialOpener, open_serial_port};
pub use tcp::TcpConnector;

/// Reply timeout for commands that do not carry their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive serial failures before the port is reopened.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 6;

/// Fired once the link comes up.
pub type LinkedCallback = Arc<dyn Fn(&Device) + Send + Sync>;
/// Fired when a link attempt fails or a live link drops.
pub type UnlinkedCallback = Arc<dyn Fn(&Device, &ConnectorError) + Send + Sync>;
/// Fired with the decoded `{tag: value}` map of one poll and its timestamp.
pub type DataSwapCallback = Arc<dyn Fn(&Device, HashMap<String, TelemetryValue>, i64) + Send + Sync>;
/// Fired when a poll fails after its request was written.
pub type CollectFailCallback = Arc<dyn Fn(&Device, &PointGroup, &ConnectorError) + Send + Sync>;

/// Tuning shared by every connector built from one registry.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Poll requests awaiting a response (TCP only).
    pub queue_capacity: usize,
    /// Reply or write deadline when neither the command nor the device sets one.
    pub default_timeout: Duration,
    /// Consecutive serial failures before a forced reopen.
    pub failure_threshold: u32,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_timeout: DEFAULT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Registry name of the transport, e.g. "tcp_client".
    fn interface_type(&self) -> &str;

    fn device(&self) -> &Arc<Device>;

    /// Bring the link up. A no-op when already linked.
    async fn open(&self) -> Result<(), ConnectorError>;

    /// Tear the link down. Safe to call repeatedly.
    async fn close(&self);

    /// Discard inbound bytes or frames nobody asked for.
    async fn flush(&self);

    /// Write with the device's write deadline.
    async fn write(&self, data: &[u8]) -> Result<(), ConnectorError>;

    /// Write with an explicit deadline; [`Duration::ZERO`] waits forever.
    async fn write_by_timeout(&self, timeout: Duration, data: &[u8]) -> Result<(), ConnectorError>;

    /// Next inbound frame that did not match a pending request.
    async fn read(&self) -> Result<DecodedFrame, ConnectorError>;

    async fn read_by_timeout(&self, timeout: Duration) -> Result<DecodedFrame, ConnectorError>;

    /// Write `data` and wait for the frame correlated by `key`, using the
    /// default timeout.
    async fn send_and_wait_for_reply(
        &self,
        key: &str,
        data: &[u8],
    ) -> Result<DecodedFrame, ConnectorError> {
        self.send_and_wait_for_reply_by_timeout(key, data, self.default_timeout())
            .await
    }

    async fn send_and_wait_for_reply_by_timeout(
        &self,
        key: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<DecodedFrame, ConnectorError>;

    /// Send one poll request. The decoded values arrive through the data
    /// swap callback, failures after the write through the collect-fail
    /// callback.
    async fn collect(
        &self,
        key: String,
        frame: Vec<u8>,
        group: Arc<PointGroup>,
    ) -> Result<(), ConnectorError>;

    /// Run a control command and return the response payload.
    async fn operate(&self, cmd: &OperateCmd) -> Result<Vec<u8>, ConnectorError>;

    fn is_linked(&self) -> bool;

    fn default_timeout(&self) -> Duration;

    fn add_success_linked_callback(&self, callback: LinkedCallback);

    fn add_fail_linked_callback(&self, callback: UnlinkedCallback);

    fn add_data_swap_callback(&self, callback: DataSwapCallback);

    fn add_collect_fail_callback(&self, callback: CollectFailCallback);
}

#[derive(Default)]
struct Callbacks {
    linked: Vec<LinkedCallback>,
    unlinked: Vec<UnlinkedCallback>,
    data: Vec<DataSwapCallback>,
    collect_fail: Vec<CollectFailCallback>,
}

struct LinkInner {
    linked: bool,
    callbacks: Callbacks,
}

/// Link flag and the callbacks observing it, behind one lock.
///
/// Link callbacks run while the lock is held, so observers see transitions
/// in order. Data callbacks run outside it.
pub struct LinkState {
    inner: Mutex<LinkInner>,
}

impl fmt::Debug for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkState")
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LinkInner {
                linked: false,
                callbacks: Callbacks::default(),
            }),
        }
    }
}

impl LinkState {
    pub fn is_linked(&self) -> bool {
        self.inner.lock().linked
    }

    pub fn linked(&self, device: &Device) {
        let mut inner = self.inner.lock();
        inner.linked = true;
        for callback in &inner.callbacks.linked {
            callback(device);
        }
    }

    /// Mark the link down and notify. Returns whether it was up.
    pub fn unlinked(&self, device: &Device, error: &ConnectorError) -> bool {
        let mut inner = self.inner.lock();
        let was_linked = std::mem::replace(&mut inner.linked, false);
        for callback in &inner.callbacks.unlinked {
            callback(device, error);
        }
        was_linked
    }

    pub fn emit_data(&self, device: &Device, values: HashMap<String, TelemetryValue>, timestamp: i64) {
        let callbacks = self.inner.lock().callbacks.data.clone();
        match callbacks.as_slice() {
            [] => {}
            [only] => only(device, values, timestamp),
            many => {
                for callback in many {
                    callback(device, values.clone(), timestamp);
                }
            }
        }
    }

    pub fn emit_collect_fail(&self, device: &Device, group: &PointGroup, error: &ConnectorError) {
        let callbacks = self.inner.lock().callbacks.collect_fail.clone();
        for callback in callbacks {
            callback(device, group, error);
        }
    }

    pub fn add_linked(&self, callback: LinkedCallback) {
        self.inner.lock().callbacks.linked.push(callback);
    }

    pub fn add_unlinked(&self, callback: UnlinkedCallback) {
        self.inner.lock().callbacks.unlinked.push(callback);
    }

    pub fn add_data(&self, callback: DataSwapCallback) {
        self.inner.lock().callbacks.data.push(callback);
    }

    pub fn add_collect_fail(&self, callback: CollectFailCallback) {
        self.inner.lock().callbacks.collect_fail.push(callback);
    }
}

/// State every connector carries regardless of transport.
#[derive(Debug)]
pub(crate) struct ConnectorCore {
    pub device: Arc<Device>,
    pub link: LinkState,
    pub decoder: PointDecoder,
    pub options: ConnectorOptions,
}

impl ConnectorCore {
    pub fn new(device: Arc<Device>, options: ConnectorOptions) -> Self {
        Self {
            device,
            link: LinkState::default(),
            decoder: PointDecoder::new(),
            options,
        }
    }

    /// Write deadline of the device, or the default when unset.
    pub fn write_timeout(&self) -> Duration {
        match self.device.write_timeout_ms {
            0 => self.options.default_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    /// Read deadline of the device, or the default when unset.
    pub fn read_timeout(&self) -> Duration {
        match self.device.read_timeout_ms {
            0 => self.options.default_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn command_timeout(&self, cmd: &OperateCmd) -> Duration {
        match cmd.timeout_ms {
            0 => self.options.default_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    /// Hand a poll response to the data or collect-fail callbacks.
    pub fn deliver(&self, group: &PointGroup, frame: DecodedFrame) {
        let device = &self.device;
        let frame = match frame.into_result() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: poll of fc {:#04x} at {} rejected: {}", device.identifier(), group.function_code(), group.start(), e);
                self.link.emit_collect_fail(device, group, &e);
                return;
            }
        };

        match group.parse(&frame.payload, frame.item_width, &self.decoder) {
            Ok(values) => {
                debug!("{}: decoded {} values", device.identifier(), values.len());
                self.link
                    .emit_data(device, values, fieldgate_common::current_timestamp_millis());
            }
            Err(e) => {
                let e = ConnectorError::from(e);
                warn!("{}: failed to decode poll response: {}", device.identifier(), e);
                self.link.emit_collect_fail(device, group, &e);
            }
        }
    }
}

/// Run `fut` under a deadline; [`Duration::ZERO`] means none.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, ConnectorError>
where
    F: Future<Output = io::Result<T>>,
{
    if timeout.is_zero() {
        return Ok(fut.await?);
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ConnectorError::DeadlineExceeded),
    }
}

const DEAD_LINK_MARKERS: [&str; 6] = [
    "connection reset",
    "broken pipe",
    "wsaeconnreset",
    "forcibly closed",
    "closed by peer",
    "use of closed network connection",
];

/// Whether an I/O error means the peer is gone and the link must be rebuilt.
/// Timeouts are not.
pub fn is_disconnected(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => true,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => false,
        _ => {
            let message = error.to_string().to_ascii_lowercase();
            DEAD_LINK_MARKERS.iter().any(|m| message.contains(m))
        }
    }
}

/// Same check on a connector error.
pub fn is_dead_link(error: &ConnectorError) -> bool {
    match error {
        ConnectorError::Io(e) => is_disconnected(e),
        _ => false,
    }
}

/// Rebuild an I/O error so it can be both reported and returned.
pub(crate) fn duplicate_io(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device() -> Device {
        serde_json::from_value(serde_json::json!({
            "id": "d1",
            "interface_type": "tcp_client",
            "protocol_type": "modbus_tcp",
            "address": "127.0.0.1:502"
        }))
        .unwrap()
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(is_disconnected(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_disconnected(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_disconnected(&io::Error::other("use of closed network connection")));
        assert!(!is_disconnected(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_disconnected(&io::Error::other("checksum glitch")));
        assert!(!is_dead_link(&ConnectorError::DeadlineExceeded));
    }

    #[test]
    fn test_link_state_fires_callbacks() {
        let state = LinkState::default();
        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ups);
        state.add_linked(Arc::new(move |_: &Device| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&downs);
        state.add_unlinked(Arc::new(move |_: &Device, _: &ConnectorError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let device = device();
        assert!(!state.unlinked(&device, &ConnectorError::NotLinked));
        state.linked(&device);
        assert!(state.is_linked());
        assert!(state.unlinked(&device, &ConnectorError::Closed));
        assert!(!state.is_linked());

        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unset_timeouts_fall_back_to_default() {
        let options = ConnectorOptions {
            default_timeout: Duration::from_millis(750),
            ..Default::default()
        };
        let core = ConnectorCore::new(Arc::new(device()), options.clone());
        assert_eq!(core.write_timeout(), Duration::from_millis(750));
        assert_eq!(core.read_timeout(), Duration::from_millis(750));

        let mut device = device();
        device.write_timeout_ms = 200;
        let core = ConnectorCore::new(Arc::new(device), options);
        assert_eq!(core.write_timeout(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, io::Error>(1)
        };
        let err = with_deadline(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(err.is_timeout());

        let value = with_deadline(Duration::ZERO, async { Ok::<_, io::Error>(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
