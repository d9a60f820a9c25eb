//! TCP client connector.
//!
//! Requests are written on the caller's task while a spawned decode loop owns
//! the read half. Each decoded frame goes to the first taker: a control
//! command waiting on its key, then a parked poll group, then the inbox
//! drained by [`Connector::read`].

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CollectFailCallback, Connector, ConnectorCore, ConnectorOptions, DataSwapCallback,
    LinkedCallback, UnlinkedCallback, duplicate_io, is_disconnected, with_deadline,
};
use crate::codec::{DecodedFrame, ProtocolCodec};
use crate::command::OperateCmd;
use crate::correlation::{CorrelationQueue, PendingReplies};
use crate::error::ConnectorError;
use crate::model::Device;
use crate::snapshot::PointGroup;

pub const TCP_CLIENT: &str = "tcp_client";
pub const TCP_CLIENT_REUSE: &str = "tcp_client_reuse";

/// Unmatched frames kept for [`Connector::read`].
const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    core: ConnectorCore,
    interface_type: &'static str,
    /// Bind a stable local port with SO_REUSEADDR on every reconnect.
    reuse_port: bool,
    local_port: AtomicU16,
    codec: Box<dyn ProtocolCodec>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    session: parking_lot::Mutex<Option<CancellationToken>>,
    queue: CorrelationQueue<Arc<PointGroup>>,
    pending: PendingReplies<DecodedFrame>,
    inbox_tx: mpsc::Sender<DecodedFrame>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<DecodedFrame>>,
    operate_lock: tokio::sync::Mutex<()>,
}

impl TcpConnector {
    /// Plain client: the OS picks a fresh local port per connection.
    pub fn new(device: Arc<Device>, codec: Box<dyn ProtocolCodec>, options: &ConnectorOptions) -> Self {
        Self::build(device, codec, options, false)
    }

    /// Client that reconnects from the same local port.
    pub fn with_port_reuse(
        device: Arc<Device>,
        codec: Box<dyn ProtocolCodec>,
        options: &ConnectorOptions,
    ) -> Self {
        Self::build(device, codec, options, true)
    }

    fn build(
        device: Arc<Device>,
        codec: Box<dyn ProtocolCodec>,
        options: &ConnectorOptions,
        reuse_port: bool,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queue: CorrelationQueue::new(options.queue_capacity),
                core: ConnectorCore::new(device, options.clone()),
                interface_type: if reuse_port { TCP_CLIENT_REUSE } else { TCP_CLIENT },
                reuse_port,
                local_port: AtomicU16::new(0),
                codec,
                writer: tokio::sync::Mutex::new(None),
                session: parking_lot::Mutex::new(None),
                pending: PendingReplies::new(),
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
                operate_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Local port pinned by a reusing connector, once it has connected.
    pub fn local_port(&self) -> Option<u16> {
        match self.inner.local_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    /// Poll requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Inner {
    async fn connect(&self) -> Result<TcpStream, ConnectorError> {
        let address = &self.core.device.address;
        let target = lookup_host(address.as_str())
            .await?
            .next()
            .ok_or_else(|| ConnectorError::Setting(format!("{} resolves to no address", address)))?;

        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if self.reuse_port {
            socket.set_reuseaddr(true)?;
            let unspecified = match target {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            let port = self.local_port.load(Ordering::Relaxed);
            socket.bind(SocketAddr::new(unspecified, port))?;
            if port == 0 {
                self.local_port
                    .store(socket.local_addr()?.port(), Ordering::Relaxed);
            }
        }

        let stream = with_deadline(self.core.options.default_timeout, socket.connect(target)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Drop the session. `reason` is reported if the link was up.
    async fn teardown(&self, reason: ConnectorError) {
        if let Some(token) = self.session.lock().take() {
            token.cancel();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let device = &self.core.device;
        if self.core.link.is_linked() {
            info!("{}: link closed: {}", device.identifier(), reason);
            self.core.link.unlinked(device, &reason);
        }
    }

    async fn write(&self, timeout: Duration, data: &[u8]) -> Result<(), ConnectorError> {
        let result = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(ConnectorError::NotLinked)?;
            with_deadline(timeout, writer.write_all(data)).await
        };

        if let Err(ConnectorError::Io(e)) = &result {
            if is_disconnected(e) {
                self.teardown(ConnectorError::Io(duplicate_io(e))).await;
            }
        }
        result
    }

    fn dispatch(&self, frame: DecodedFrame) {
        debug!("{}: <- {}", self.core.device.identifier(), frame.trace);

        let key = frame.key.clone();
        let Some(frame) = self.pending.complete(&key, frame) else {
            return;
        };
        if let Some(group) = self.queue.take(&key) {
            self.core.deliver(&group, frame);
            return;
        }
        if self.inbox_tx.try_send(frame).is_err() {
            debug!(
                "{}: inbox full, dropping unmatched frame",
                self.core.device.identifier()
            );
        }
    }
}

/// Own the read half until the session is cancelled or the peer goes away.
async fn decode_loop(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    mut codec: Box<dyn ProtocolCodec>,
    token: CancellationToken,
) {
    let id = inner.core.device.identifier();
    let read_timeout = inner.core.read_timeout();
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = tokio::time::timeout(read_timeout, reader.read_buf(&mut buf)) => read,
        };

        match read {
            // Idle link; the deadline only bounds each read.
            Err(_) => continue,
            Ok(Ok(0)) => {
                inner
                    .teardown(ConnectorError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))
                    .await;
                break;
            }
            Ok(Ok(_)) => loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => inner.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => debug!("{}: skipping byte: {}", id, e),
                }
            },
            Ok(Err(e)) if is_disconnected(&e) => {
                inner.teardown(ConnectorError::Io(e)).await;
                break;
            }
            Ok(Err(e)) => warn!("{}: read failed: {}", id, e),
        }
    }
    debug!("{}: decode loop stopped", id);
}

#[async_trait]
impl Connector for TcpConnector {
    fn interface_type(&self) -> &str {
        self.inner.interface_type
    }

    fn device(&self) -> &Arc<Device> {
        &self.inner.core.device
    }

    async fn open(&self) -> Result<(), ConnectorError> {
        let inner = &self.inner;
        if inner.core.link.is_linked() {
            return Ok(());
        }
        let device = &inner.core.device;

        let stream = match inner.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}: connect to {} failed: {}", device.identifier(), device.address, e);
                inner.core.link.unlinked(device, &e);
                return Err(e);
            }
        };

        let (reader, writer) = stream.into_split();
        *inner.writer.lock().await = Some(writer);

        let token = CancellationToken::new();
        if let Some(stale) = inner.session.lock().replace(token.clone()) {
            stale.cancel();
        }

        // Linked before the decode loop starts, so an immediate EOF unlinks.
        info!("{}: linked to {}", device.identifier(), device.address);
        inner.core.link.linked(device);
        tokio::spawn(decode_loop(
            Arc::clone(inner),
            reader,
            inner.codec.copy(),
            token,
        ));
        Ok(())
    }

    async fn close(&self) {
        self.inner.teardown(ConnectorError::NotLinked).await;
    }

    async fn flush(&self) {
        let mut inbox = self.inner.inbox_rx.lock().await;
        while inbox.try_recv().is_ok() {}
    }

    async fn write(&self, data: &[u8]) -> Result<(), ConnectorError> {
        self.inner.write(self.inner.core.write_timeout(), data).await
    }

    async fn write_by_timeout(&self, timeout: Duration, data: &[u8]) -> Result<(), ConnectorError> {
        self.inner.write(timeout, data).await
    }

    async fn read(&self) -> Result<DecodedFrame, ConnectorError> {
        self.inner
            .inbox_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ConnectorError::Closed)
    }

    async fn read_by_timeout(&self, timeout: Duration) -> Result<DecodedFrame, ConnectorError> {
        tokio::time::timeout(timeout, self.read())
            .await
            .map_err(|_| ConnectorError::DeadlineExceeded)?
    }

    async fn send_and_wait_for_reply_by_timeout(
        &self,
        key: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<DecodedFrame, ConnectorError> {
        let (_registration, handle) = self.inner.pending.register(key, timeout);
        Connector::write(self, data).await?;
        handle.wait().await
    }

    async fn collect(
        &self,
        key: String,
        frame: Vec<u8>,
        group: Arc<PointGroup>,
    ) -> Result<(), ConnectorError> {
        let inner = &self.inner;
        if let Some((evicted, _)) = inner.queue.add(&key, group) {
            debug!(
                "{}: poll {} never answered, evicted",
                inner.core.device.identifier(),
                evicted
            );
        }
        if let Err(e) = Connector::write(self, &frame).await {
            inner.queue.take(&key);
            return Err(e);
        }
        Ok(())
    }

    async fn operate(&self, cmd: &OperateCmd) -> Result<Vec<u8>, ConnectorError> {
        let _serialized = self.inner.operate_lock.lock().await;
        let mut codec = self.inner.codec.copy();
        let (key, frame) = codec.opt(cmd)?;
        debug!(
            "{}: -> {}",
            self.inner.core.device.identifier(),
            hex::encode(&frame)
        );

        let timeout = self.inner.core.command_timeout(cmd);
        let reply = self
            .send_and_wait_for_reply_by_timeout(&key, &frame, timeout)
            .await?
            .into_result()?;
        codec.check_resp(&frame, &reply.payload)?;
        Ok(reply.payload)
    }

    fn is_linked(&self) -> bool {
        self.inner.core.link.is_linked()
    }

    fn default_timeout(&self) -> Duration {
        self.inner.core.options.default_timeout
    }

    fn add_success_linked_callback(&self, callback: LinkedCallback) {
        self.inner.core.link.add_linked(callback);
    }

    fn add_fail_linked_callback(&self, callback: UnlinkedCallback) {
        self.inner.core.link.add_unlinked(callback);
    }

    fn add_data_swap_callback(&self, callback: DataSwapCallback) {
        self.inner.core.link.add_data(callback);
    }

    fn add_collect_fail_callback(&self, callback: CollectFailCallback) {
        self.inner.core.link.add_collect_fail(callback);
    }
}
