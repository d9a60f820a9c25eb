//! Gateway lifecycle: logging, Zenoh session, worker tasks, shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use fieldgate_common::{connect, init_tracing};

use crate::GatewayArgs;
use crate::config::GatewayConfig;
use crate::error::{FrameworkError, Result};
use crate::publisher::Publisher;
use crate::status::{DEFAULT_HEARTBEAT, MetadataFn, StatusPublisher};

/// Owns the Zenoh session and every background task of a gateway.
///
/// ```ignore
/// let args = GatewayArgs::parse_with_default("gateway.json5");
/// let config = MyConfig::load(&args.config)?;
/// let mut runner = GatewayRunner::new_with_args("modbus", config, Some(&args)).await?;
///
/// runner.spawn(worker(runner.publisher()));
/// runner.run_until(shutdown_signal(), async { /* drain */ }).await?;
/// ```
pub struct GatewayRunner<C: GatewayConfig> {
    name: String,
    version: String,
    config: C,
    session: Arc<zenoh::Session>,
    publisher: Publisher,
    status: Option<(StatusPublisher, Duration)>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: GatewayConfig> GatewayRunner<C> {
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Initialize logging (with the CLI level override, if any), then open
    /// the Zenoh session.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&GatewayArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = config
            .logging()
            .clone()
            .with_level_override(args.and_then(|a| a.log_level.as_deref()));
        init_tracing(&log_config).map_err(|e| FrameworkError::config(e.to_string()))?;

        tracing::info!(gateway = %name, version = %version, "Starting gateway");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| FrameworkError::ZenohConnection(e.to_string()))?,
        );

        let publisher = Publisher::new(session.clone(), config.key_prefix(), config.format());

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status: None,
            tasks: Vec::new(),
        })
    }

    /// Publish "running" on every heartbeat and "offline" at shutdown.
    pub fn with_status(mut self, metadata: Option<MetadataFn>, interval: Option<Duration>) -> Self {
        let mut status = StatusPublisher::new(self.publisher.clone(), &self.name, &self.version);
        if let Some(metadata) = metadata {
            status = status.with_metadata_fn(metadata);
        }
        self.status = Some((status, interval.unwrap_or(DEFAULT_HEARTBEAT)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Track a worker; it is aborted at shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Track a fallible worker and log its error.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
            }
        }));
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal(), async {}).await
    }

    /// Run until `signal` resolves, then run `cleanup` before the workers
    /// are aborted and the session is closed.
    pub async fn run_until<S, D>(mut self, signal: S, cleanup: D) -> Result<()>
    where
        S: Future<Output = ()>,
        D: Future<Output = ()>,
    {
        if let Some((status, interval)) = &self.status {
            self.tasks
                .push(tokio::spawn(status.clone().heartbeat(*interval)));
        }

        tracing::info!(
            gateway = %self.name,
            tasks = self.tasks.len(),
            "Gateway running. Press Ctrl+C to stop."
        );

        signal.await;
        tracing::info!(gateway = %self.name, "Shutting down");

        cleanup.await;

        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Worker ended abnormally");
                }
            }
        }

        if let Some((status, _)) = &self.status {
            if let Err(e) = status.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(gateway = %self.name, "Stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C. If the handler cannot be installed the error is
/// logged and the future never resolves.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
