//! One device's poll loop and control entry point.
//!
//! ```text
//! Idle -> Opening -> Linked -> Running
//!            ^                    |
//!            +------ Fault <------+   (link lost: stop, then reconnect)
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binder::PointBinder;
use crate::codec::ProtocolCodec;
use crate::command::OperateCmd;
use crate::connector::Connector;
use crate::error::ProcessorError;
use crate::model::{CollectionRule, Device, Point};
use crate::registry::Registry;
use crate::scheduler::schedule;
use crate::snapshot::PointGroup;

/// Reconnect backoff and inter-poll pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Opening,
    Linked,
    Running,
    Fault,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessorState::Idle => "idle",
            ProcessorState::Opening => "opening",
            ProcessorState::Linked => "linked",
            ProcessorState::Running => "running",
            ProcessorState::Fault => "fault",
        };
        f.write_str(name)
    }
}

pub struct TaskProcessor {
    device: Arc<Device>,
    connector: Arc<dyn Connector>,
    /// Poll-path codec; control commands copy the connector's own.
    codec: Mutex<Box<dyn ProtocolCodec>>,
    binder: PointBinder,
    policy: RetryPolicy,
    state: Mutex<ProcessorState>,
    /// Cancels the current poll loop.
    session: Mutex<Option<CancellationToken>>,
    /// Cancels everything, reconnects included.
    lifetime: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    operate_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("device", &self.device.identifier())
            .field("interface", &self.connector.interface_type())
            .field("groups", &self.binder.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TaskProcessor {
    /// Build the connector, codec and poll groups for a device.
    pub fn new(
        device: Arc<Device>,
        points: &[Arc<Point>],
        rules: &[CollectionRule],
        registry: &Registry,
        policy: RetryPolicy,
    ) -> Result<Self, ProcessorError> {
        if points.is_empty() {
            return Err(ProcessorError::NoPoints(device.identifier()));
        }
        let (connector, codec) = registry.link(Arc::clone(&device))?;
        let groups = schedule(points, rules);
        debug!(
            "{}: {} points in {} poll groups",
            device.identifier(),
            points.len(),
            groups.len()
        );
        Ok(Self::from_parts(connector, codec, groups, policy))
    }

    pub fn from_parts(
        connector: Arc<dyn Connector>,
        codec: Box<dyn ProtocolCodec>,
        groups: Vec<PointGroup>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            device: Arc::clone(connector.device()),
            connector,
            codec: Mutex::new(codec),
            binder: PointBinder::new(groups),
            policy,
            state: Mutex::new(ProcessorState::Idle),
            session: Mutex::new(None),
            lifetime: CancellationToken::new(),
            supervisor: Mutex::new(None),
            operate_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    pub fn group_count(&self) -> usize {
        self.binder.len()
    }

    fn set_state(&self, state: ProcessorState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            debug!("{}: {} -> {}", self.device.identifier(), previous, state);
        }
    }

    /// Connect, retrying until it works, then poll on a background task.
    ///
    /// Returns false if the processor was shut down before it linked.
    pub async fn start(self: &Arc<Self>) -> bool {
        if !self.connect().await {
            return false;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise().await });
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
        true
    }

    async fn connect(&self) -> bool {
        let id = self.device.identifier();
        loop {
            self.set_state(ProcessorState::Opening);
            let opened = tokio::select! {
                _ = self.lifetime.cancelled() => return false,
                opened = self.connector.open() => opened,
            };
            match opened {
                Ok(()) => {
                    self.set_state(ProcessorState::Linked);
                    return true;
                }
                Err(e) => {
                    self.set_state(ProcessorState::Fault);
                    warn!(
                        "{}: open failed: {}, retrying in {:?}",
                        id, e, self.policy.reconnect_delay
                    );
                    tokio::select! {
                        _ = self.lifetime.cancelled() => return false,
                        _ = tokio::time::sleep(self.policy.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Run the poll loop, reconnecting whenever it fails.
    async fn supervise(self: Arc<Self>) {
        loop {
            let token = self.lifetime.child_token();
            *self.session.lock() = Some(token.clone());
            self.set_state(ProcessorState::Running);
            info!("{}: polling {} groups", self.device.identifier(), self.binder.len());

            match self.run(&token).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("{}: poll loop stopped: {}, reconnecting", self.device.identifier(), e);
                    self.set_state(ProcessorState::Fault);
                    self.stop().await;
                    if !self.connect().await {
                        break;
                    }
                }
            }
        }
    }

    /// Poll until cancelled. Losing the link is the only error.
    async fn run(&self, token: &CancellationToken) -> Result<(), ProcessorError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            if let Some(group) = self.binder.next() {
                if !group.is_empty() {
                    if !self.connector.is_linked() {
                        return Err(ProcessorError::NotLinked(self.device.identifier()));
                    }
                    self.poll(group).await;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }
        }
    }

    async fn poll(&self, group: Arc<PointGroup>) {
        let id = self.device.identifier();
        let built = self.codec.lock().build_by_snap(&group);
        let (key, frame) = match built {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: cannot build request for group at {}: {}", id, group.start(), e);
                return;
            }
        };

        debug!("{}: -> {}", id, hex::encode(&frame));
        let start = group.start();
        if let Err(e) = self.connector.collect(key, frame, group).await {
            warn!("{}: poll at {} failed: {}", id, start, e);
        }
    }

    /// End the current poll loop and close the link. Safe to repeat.
    pub async fn stop(&self) {
        let token = self.session.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.connector.close().await;
        self.set_state(ProcessorState::Idle);
    }

    /// Stop for good: no further reconnects.
    pub async fn shutdown(&self) {
        self.lifetime.cancel();
        self.stop().await;
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("{}: poll task ended abnormally: {}", self.device.identifier(), e);
                }
            }
        }
    }

    /// Run a control command on this device.
    pub async fn operate(&self, cmd: &OperateCmd) -> Result<Vec<u8>, ProcessorError> {
        if !self.connector.is_linked() {
            return Err(ProcessorError::NotLinked(self.device.identifier()));
        }
        let _serialized = self.operate_lock.lock().await;
        Ok(self.connector.operate(cmd).await?)
    }
}
