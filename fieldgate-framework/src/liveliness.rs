//! Liveliness tokens marking linked devices.
//!
//! A token at `<prefix>/@/alive/<device>` exists exactly while the gateway
//! holds a live link to that device. Subscribers on
//! `<prefix>/@/alive/*` see a PUT when a link comes up and a DELETE when it
//! drops or the gateway dies.

use std::collections::HashMap;
use std::sync::Arc;

use fieldgate_common::KeyExprBuilder;
use tokio::sync::RwLock;
use zenoh::Session;
use zenoh::liveliness::LivelinessToken;

use crate::error::{FrameworkError, Result};

#[derive(Debug)]
pub struct LivelinessManager {
    session: Arc<Session>,
    keys: KeyExprBuilder,
    device_tokens: RwLock<HashMap<String, LivelinessToken>>,
}

impl LivelinessManager {
    pub fn new(session: Arc<Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            session,
            keys: KeyExprBuilder::new(key_prefix),
            device_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Declare the device's token. A no-op when it already exists.
    pub async fn declare_device_alive(&self, device: &str) -> Result<()> {
        if self.device_tokens.read().await.contains_key(device) {
            return Ok(());
        }

        let key = self.keys.alive_key(device);
        let token = self
            .session
            .liveliness()
            .declare_token(&key)
            .await
            .map_err(|e| {
                FrameworkError::liveliness(format!("Failed to declare token for {}: {}", device, e))
            })?;

        tracing::debug!(device = %device, key = %key, "Device liveliness token declared");
        self.device_tokens
            .write()
            .await
            .insert(device.to_string(), token);
        Ok(())
    }

    /// Drop the device's token, if any.
    pub async fn undeclare_device(&self, device: &str) {
        let token = self.device_tokens.write().await.remove(device);
        if let Some(token) = token {
            if let Err(e) = token.undeclare().await {
                tracing::warn!(device = %device, error = %e, "Failed to undeclare liveliness token");
            } else {
                tracing::debug!(device = %device, "Device liveliness token undeclared");
            }
        }
    }

    pub async fn is_device_alive(&self, device: &str) -> bool {
        self.device_tokens.read().await.contains_key(device)
    }

    pub async fn alive_devices(&self) -> Vec<String> {
        let mut devices: Vec<_> = self.device_tokens.read().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub async fn undeclare_all_devices(&self) {
        let tokens: Vec<_> = self.device_tokens.write().await.drain().collect();
        let count = tokens.len();
        for (device, token) in tokens {
            if let Err(e) = token.undeclare().await {
                tracing::warn!(device = %device, error = %e, "Failed to undeclare liveliness token");
            }
        }
        if count > 0 {
            tracing::debug!(count, "All device liveliness tokens undeclared");
        }
    }
}
