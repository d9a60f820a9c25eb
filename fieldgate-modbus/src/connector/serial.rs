//! Serial line connector (RS-232/RS-485).
//!
//! A serial line is half duplex and strictly request/response: one exchange
//! holds the line from the write until its reply decodes, and replies are
//! matched by position rather than by key. Consecutive failures past the
//! configured threshold force the port closed and reopened.

use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CollectFailCallback, Connector, ConnectorCore, ConnectorOptions, DataSwapCallback,
    LinkedCallback, UnlinkedCallback, with_deadline,
};
use crate::codec::{DecodedFrame, ProtocolCodec};
use crate::command::OperateCmd;
use crate::error::ConnectorError;
use crate::model::Device;
use crate::snapshot::PointGroup;

pub const SERIAL: &str = "serial";
pub const RS485: &str = "rs485";

/// Byte stream a serial connector talks through.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the port for a device. Swapped out in tests.
pub type SerialOpener =
    Arc<dyn Fn(&Device) -> Result<Box<dyn SerialIo>, ConnectorError> + Send + Sync>;

/// Open the device's port with its line settings.
pub fn open_serial_port(device: &Device) -> Result<Box<dyn SerialIo>, ConnectorError> {
    let builder = tokio_serial::new(device.address.as_str(), device.baud_rate)
        .data_bits(data_bits(device.data_bits)?)
        .stop_bits(stop_bits(device.stop_bits)?)
        .parity(parity(&device.parity)?);

    let port = tokio_serial::SerialStream::open(&builder)
        .map_err(|e| ConnectorError::Io(io::Error::from(e)))?;
    Ok(Box::new(port))
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits, ConnectorError> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ConnectorError::Setting(format!("{} data bits", other))),
    }
}

fn stop_bits(bits: u8) -> Result<tokio_serial::StopBits, ConnectorError> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(ConnectorError::Setting(format!("{} stop bits", other))),
    }
}

fn parity(parity: &str) -> Result<tokio_serial::Parity, ConnectorError> {
    match parity.to_ascii_uppercase().as_str() {
        "N" | "NONE" | "" => Ok(tokio_serial::Parity::None),
        "E" | "EVEN" => Ok(tokio_serial::Parity::Even),
        "O" | "ODD" => Ok(tokio_serial::Parity::Odd),
        other => Err(ConnectorError::Setting(format!("parity {:?} is not supported", other))),
    }
}

/// Time for `len` bytes to leave the wire at the device's line settings,
/// rounded up to the millisecond.
pub fn transmission_delay(len: usize, device: &Device) -> Duration {
    if device.baud_rate == 0 {
        return Duration::ZERO;
    }
    let bits = len as u64 * device.bits_per_byte() as u64 * 1000;
    Duration::from_millis(bits.div_ceil(device.baud_rate as u64))
}

struct Line {
    port: Option<Box<dyn SerialIo>>,
    buf: BytesMut,
    codec: Box<dyn ProtocolCodec>,
}

impl Line {
    /// Write a request and wait out its transmission time.
    async fn send(&mut self, data: &[u8], timeout: Duration, device: &Device) -> Result<(), ConnectorError> {
        let port = self.port.as_mut().ok_or(ConnectorError::NotLinked)?;
        // Stale bytes would be taken for the reply.
        self.buf.clear();
        with_deadline(timeout, async {
            port.write_all(data).await?;
            port.flush().await
        })
        .await?;
        tokio::time::sleep(transmission_delay(data.len(), device)).await;
        Ok(())
    }

    /// Read until one frame decodes or `timeout` runs out.
    async fn receive(&mut self, timeout: Duration) -> Result<DecodedFrame, ConnectorError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    debug!("serial: skipping byte: {}", e);
                    continue;
                }
            }

            let port = self.port.as_mut().ok_or(ConnectorError::NotLinked)?;
            let read = tokio::time::timeout_at(deadline, port.read_buf(&mut self.buf))
                .await
                .map_err(|_| ConnectorError::DeadlineExceeded)?;
            if read? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn exchange(
        &mut self,
        data: &[u8],
        timeout: Duration,
        core: &ConnectorCore,
    ) -> Result<DecodedFrame, ConnectorError> {
        self.send(data, core.write_timeout(), &core.device).await?;
        self.receive(timeout).await
    }
}

pub struct SerialConnector {
    core: ConnectorCore,
    interface_type: String,
    codec: Box<dyn ProtocolCodec>,
    opener: SerialOpener,
    line: tokio::sync::Mutex<Line>,
    failures: AtomicU32,
    operate_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SerialConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnector")
            .field("device", &self.core.device.id)
            .field("port", &self.core.device.address)
            .field("interface_type", &self.interface_type)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SerialConnector {
    pub fn new(device: Arc<Device>, codec: Box<dyn ProtocolCodec>, options: &ConnectorOptions) -> Self {
        Self::with_opener(device, codec, options, SERIAL, Arc::new(open_serial_port))
    }

    pub fn with_opener(
        device: Arc<Device>,
        codec: Box<dyn ProtocolCodec>,
        options: &ConnectorOptions,
        interface_type: &str,
        opener: SerialOpener,
    ) -> Self {
        Self {
            line: tokio::sync::Mutex::new(Line {
                port: None,
                buf: BytesMut::with_capacity(256),
                codec: codec.copy(),
            }),
            core: ConnectorCore::new(device, options.clone()),
            interface_type: interface_type.to_string(),
            codec,
            opener,
            failures: AtomicU32::new(0),
            operate_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Consecutive failed exchanges since the last success or reopen.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn record<T>(&self, result: &Result<T, ConnectorError>) {
        match result {
            Ok(_) => self.failures.store(0, Ordering::Relaxed),
            Err(e) => self.record_failure(e).await,
        }
    }

    async fn record_failure(&self, error: &ConnectorError) {
        if !matches!(error, ConnectorError::Io(_) | ConnectorError::DeadlineExceeded) {
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.core.options.failure_threshold;
        if threshold == 0 || failures < threshold {
            return;
        }

        let id = self.core.device.identifier();
        warn!("{}: {} consecutive failures ({}), reopening port", id, failures, error);
        self.failures.store(0, Ordering::Relaxed);
        self.close().await;
        if let Err(e) = self.open().await {
            warn!("{}: reopen failed: {}", id, e);
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn interface_type(&self) -> &str {
        &self.interface_type
    }

    fn device(&self) -> &Arc<Device> {
        &self.core.device
    }

    async fn open(&self) -> Result<(), ConnectorError> {
        if self.core.link.is_linked() {
            return Ok(());
        }
        let device = &self.core.device;

        match (self.opener)(device) {
            Ok(port) => {
                {
                    let mut line = self.line.lock().await;
                    line.port = Some(port);
                    line.buf.clear();
                }
                self.failures.store(0, Ordering::Relaxed);
                info!(
                    "{}: opened {} at {} baud",
                    device.identifier(),
                    device.address,
                    device.baud_rate
                );
                self.core.link.linked(device);
                Ok(())
            }
            Err(e) => {
                warn!("{}: cannot open {}: {}", device.identifier(), device.address, e);
                self.core.link.unlinked(device, &e);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let port = self.line.lock().await.port.take();
        drop(port);
        let device = &self.core.device;
        if self.core.link.is_linked() {
            info!("{}: closed {}", device.identifier(), device.address);
            self.core.link.unlinked(device, &ConnectorError::NotLinked);
        }
    }

    async fn flush(&self) {
        self.line.lock().await.buf.clear();
    }

    async fn write(&self, data: &[u8]) -> Result<(), ConnectorError> {
        self.write_by_timeout(self.core.write_timeout(), data).await
    }

    async fn write_by_timeout(&self, timeout: Duration, data: &[u8]) -> Result<(), ConnectorError> {
        let result = self
            .line
            .lock()
            .await
            .send(data, timeout, &self.core.device)
            .await;
        self.record(&result).await;
        result
    }

    async fn read(&self) -> Result<DecodedFrame, ConnectorError> {
        self.read_by_timeout(self.core.read_timeout()).await
    }

    async fn read_by_timeout(&self, timeout: Duration) -> Result<DecodedFrame, ConnectorError> {
        let result = self.line.lock().await.receive(timeout).await;
        self.record(&result).await;
        result
    }

    async fn send_and_wait_for_reply_by_timeout(
        &self,
        _key: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<DecodedFrame, ConnectorError> {
        let result = self
            .line
            .lock()
            .await
            .exchange(data, timeout, &self.core)
            .await;
        self.record(&result).await;
        result
    }

    async fn collect(
        &self,
        _key: String,
        frame: Vec<u8>,
        group: Arc<PointGroup>,
    ) -> Result<(), ConnectorError> {
        let outcome = {
            let mut line = self.line.lock().await;
            match line
                .send(&frame, self.core.write_timeout(), &self.core.device)
                .await
            {
                Ok(()) => Ok(line.receive(self.core.read_timeout()).await),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
            Ok(Ok(reply)) => {
                self.failures.store(0, Ordering::Relaxed);
                self.core.deliver(&group, reply);
                Ok(())
            }
            Ok(Err(e)) => {
                debug!(
                    "{}: no reply to poll at {}: {}",
                    self.core.device.identifier(),
                    group.start(),
                    e
                );
                self.core
                    .link
                    .emit_collect_fail(&self.core.device, &group, &e);
                self.record_failure(&e).await;
                Ok(())
            }
        }
    }

    async fn operate(&self, cmd: &OperateCmd) -> Result<Vec<u8>, ConnectorError> {
        let _serialized = self.operate_lock.lock().await;
        let mut codec = self.codec.copy();
        let (key, frame) = codec.opt(cmd)?;
        debug!("{}: -> {}", self.core.device.identifier(), hex::encode(&frame));

        let reply = self
            .send_and_wait_for_reply_by_timeout(&key, &frame, self.core.command_timeout(cmd))
            .await?
            .into_result()?;
        codec.check_resp(&frame, &reply.payload)?;
        Ok(reply.payload)
    }

    fn is_linked(&self) -> bool {
        self.core.link.is_linked()
    }

    fn default_timeout(&self) -> Duration {
        self.core.options.default_timeout
    }

    fn add_success_linked_callback(&self, callback: LinkedCallback) {
        self.core.link.add_linked(callback);
    }

    fn add_fail_linked_callback(&self, callback: UnlinkedCallback) {
        self.core.link.add_unlinked(callback);
    }

    fn add_data_swap_callback(&self, callback: DataSwapCallback) {
        self.core.link.add_data(callback);
    }

    fn add_collect_fail_callback(&self, callback: CollectFailCallback) {
        self.core.link.add_collect_fail(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ModbusRtuCodec;
    use crate::codec::crc::append_crc;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn device() -> Arc<Device> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": "meter",
                "interface_type": SERIAL,
                "protocol_type": "modbus_rtu",
                "address": "/dev/ttyUSB0",
                "baud_rate": 9600,
                "parity": "E",
                "read_timeout_ms": 100
            }))
            .unwrap(),
        )
    }

    /// Opener handing the far end of each new duplex pipe to the test.
    fn pipe_opener(opened: Arc<AtomicUsize>) -> (SerialOpener, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener: SerialOpener = Arc::new(move |_: &Device| {
            opened.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(256);
            tx.send(far).map_err(|_| ConnectorError::Closed)?;
            Ok(Box::new(near) as Box<dyn SerialIo>)
        });
        (opener, rx)
    }

    fn connector(opener: SerialOpener, threshold: u32) -> SerialConnector {
        let options = ConnectorOptions {
            failure_threshold: threshold,
            ..Default::default()
        };
        let codec = Box::new(ModbusRtuCodec::new(1).unwrap());
        SerialConnector::with_opener(device(), codec, &options, SERIAL, opener)
    }

    fn rtu(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_transmission_delay() {
        // 8E1: 11 bits per byte, 88 bits at 9600 baud is 9.17 ms.
        let device = device();
        assert_eq!(device.bits_per_byte(), 11);
        assert_eq!(transmission_delay(8, &device), Duration::from_millis(10));
        assert_eq!(transmission_delay(0, &device), Duration::ZERO);
    }

    #[test]
    fn test_line_settings() {
        assert!(matches!(parity("e"), Ok(tokio_serial::Parity::Even)));
        assert!(parity("M").is_err());
        assert!(stop_bits(3).is_err());
        assert!(data_bits(9).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operate_over_pipe() {
        let opened = Arc::new(AtomicUsize::new(0));
        let (opener, mut pipes) = pipe_opener(Arc::clone(&opened));
        let connector = connector(opener, 6);
        assert_ok!(connector.open().await);

        let mut far = pipes.recv().await.unwrap();
        let request = rtu(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        let reply = rtu(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let expected = request.clone();
        let device_side = tokio::spawn(async move {
            let mut buf = vec![0u8; expected.len()];
            far.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            far.write_all(&reply).await.unwrap();
            far
        });

        let payload = assert_ok!(connector.operate(&OperateCmd::copy_read(3, 0, 1)).await);
        assert_eq!(payload, vec![0x00, 0x2A]);
        assert_eq!(connector.failures(), 0);
        device_side.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_coil_against_mock_line() {
        let request = rtu(&[0x01, 0x05, 0x00, 0x10, 0xFF, 0x00]);
        let line = tokio_test::io::Builder::new()
            .write(&request)
            .read(&request)
            .build();
        let slot = Arc::new(parking_lot::Mutex::new(Some(line)));
        let opener: SerialOpener = Arc::new(move |_: &Device| {
            let line = slot.lock().take().ok_or(ConnectorError::NotLinked)?;
            Ok(Box::new(line) as Box<dyn SerialIo>)
        });

        let connector = connector(opener, 6);
        assert_ok!(connector.open().await);
        let payload = assert_ok!(
            connector
                .operate(&OperateCmd::set_single(5, 0x10, 0xFF00))
                .await
        );
        assert_eq!(payload, vec![0x00, 0x10, 0xFF, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_reply_is_error() {
        let (opener, mut pipes) = pipe_opener(Arc::new(AtomicUsize::new(0)));
        let connector = connector(opener, 6);
        assert_ok!(connector.open().await);

        let mut far = pipes.recv().await.unwrap();
        let device_side = tokio::spawn(async move {
            let mut buf = vec![0u8; 8];
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(&rtu(&[0x01, 0x86, 0x02])).await.unwrap();
            far
        });

        let err = assert_err!(connector.operate(&OperateCmd::set_single(6, 1, 7)).await);
        assert!(matches!(
            err,
            ConnectorError::Exception {
                function: 6,
                code: 2
            }
        ));
        device_side.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_timeouts_reopen_port() {
        let opened = Arc::new(AtomicUsize::new(0));
        let (opener, mut pipes) = pipe_opener(Arc::clone(&opened));
        let connector = connector(opener, 2);

        let downs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&downs);
        connector.add_fail_linked_callback(Arc::new(move |_: &Device, _: &ConnectorError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_ok!(connector.open().await);
        let _first = pipes.recv().await.unwrap();

        let request = rtu(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        for _ in 0..2 {
            let err = assert_err!(
                connector
                    .send_and_wait_for_reply_by_timeout("", &request, Duration::from_millis(50))
                    .await
            );
            assert!(err.is_timeout());
        }

        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert!(connector.is_linked());
        assert_eq!(connector.failures(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_reports() {
        let opener: SerialOpener = Arc::new(|_: &Device| Err(ConnectorError::Setting("no such port".into())));
        let connector = connector(opener, 6);
        assert_err!(connector.open().await);
        assert!(!connector.is_linked());
        assert!(matches!(
            connector.write(&[0x01]).await,
            Err(ConnectorError::NotLinked)
        ));
    }
}
