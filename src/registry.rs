//! Device registry
//!
//! Holds every configured device in registration order. The registry is
//! populated once at startup and never changes afterwards, so it is shared
//! between sessions behind a plain `Arc` without any locking.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::device::Device;
use crate::error::{AppResult, GatewayError};

/// All configured devices, keyed by id
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Build a registry from already constructed devices
    ///
    /// Order is preserved. Fails on duplicate ids.
    pub fn new(devices: Vec<Device>) -> AppResult<Self> {
        let mut registry = Self::default();
        for device in devices {
            if registry.index.contains_key(device.id()) {
                return Err(GatewayError::DuplicateDevice(device.id().to_string()));
            }
            registry
                .index
                .insert(device.id().to_string(), registry.devices.len());
            registry.devices.push(Arc::new(device));
        }
        Ok(registry)
    }

    /// Create every configured device and start its command queue
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &GatewayConfig) -> AppResult<Self> {
        let devices = config
            .devices
            .iter()
            .map(Device::from_definition)
            .collect();
        let registry = Self::new(devices)?;
        info!(devices = registry.len(), "Device registry initialized");
        Ok(registry)
    }

    /// Look up a device by id
    pub fn lookup(&self, id: &str) -> Option<&Arc<Device>> {
        self.index.get(id).map(|&i| &self.devices[i])
    }

    /// All devices in registration order
    pub fn list(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Stop every command queue and close every transport
    ///
    /// Queues stop concurrently; each finishes its in-flight command first.
    pub async fn shutdown(&self) -> AppResult<()> {
        let results =
            futures::future::join_all(self.devices.iter().map(|device| device.shutdown())).await;

        let failed: Vec<String> = self
            .devices
            .iter()
            .zip(results)
            .filter(|(_, ok)| !ok)
            .map(|(device, _)| device.id().to_string())
            .collect();

        if failed.is_empty() {
            info!("All devices shut down");
            Ok(())
        } else {
            warn!(?failed, "Some devices did not shut down cleanly");
            Err(GatewayError::ShutdownFailed(failed))
        }
    }
}
