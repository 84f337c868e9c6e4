//! Configured instruments
//!
//! A [`Device`] pairs the immutable configuration of one instrument with the
//! command queue that owns its transport. Devices are created once at startup
//! and live in the [`DeviceRegistry`](crate::registry::DeviceRegistry) until
//! shutdown.

use bytes::Bytes;
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::{DeviceDefinition, TransportConfig};
use crate::queue::{CommandQueue, PendingResult, QueuePolicy};
use crate::transport::{build_transport, DeviceTransport};

/// One configured instrument and its command queue
pub struct Device {
    id: String,
    description: String,
    transport: TransportConfig,
    response_timeout: Duration,
    response_termination: Option<String>,
    request_termination: Option<String>,
    queue: CommandQueue,
}

impl Device {
    /// Create a device using the transport described by its definition
    ///
    /// Spawns the device's queue worker, which opens the transport.
    pub fn from_definition(definition: &DeviceDefinition) -> Self {
        Self::with_transport(definition, build_transport(&definition.transport))
    }

    /// Create a device backed by an explicit transport
    pub fn with_transport(
        definition: &DeviceDefinition,
        transport: Box<dyn DeviceTransport>,
    ) -> Self {
        let mut policy = QueuePolicy::new(definition.response_timeout());
        if let Some(termination) = &definition.response_termination {
            policy = policy.with_response_termination(Bytes::from(termination.clone()));
        }
        if let Some(termination) = &definition.request_termination {
            policy = policy.with_request_termination(Bytes::from(termination.clone()));
        }

        Self {
            id: definition.id.clone(),
            description: definition.description.clone(),
            transport: definition.transport.clone(),
            response_timeout: definition.response_timeout(),
            response_termination: definition.response_termination.clone(),
            request_termination: definition.request_termination.clone(),
            queue: CommandQueue::spawn(definition.id.clone(), transport, policy),
        }
    }

    /// Unique identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Free-text description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Maximum time to wait for a response
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// End-of-response marker, if any
    pub fn response_termination(&self) -> Option<&str> {
        self.response_termination.as_deref()
    }

    /// Queue a command for this device
    pub fn submit(&self, command: impl Into<String>) -> PendingResult {
        self.queue.submit(command)
    }

    /// Stop the command queue and close the transport
    pub async fn shutdown(&self) -> bool {
        self.queue.shutdown().await
    }

    /// Configuration summary shown by `describe`
    pub fn describe(&self) -> String {
        let mut buf = String::new();

        // Writing into a String cannot fail.
        let _ = match &self.transport {
            TransportConfig::Serial {
                path,
                baud_rate,
                data_bits,
                parity,
            } => writeln!(
                buf,
                "locator: serial:{}\nbaudrate: {}\ndata bits: {}\nparity: {}",
                path, baud_rate, data_bits, parity
            ),
            TransportConfig::Tcp { host, port } => writeln!(buf, "locator: tcp://{}:{}", host, port),
            TransportConfig::Loopback { latency_ms } => {
                writeln!(buf, "locator: loopback\nlatency (ms): {}", latency_ms)
            }
        };

        let _ = writeln!(
            buf,
            "response timeout (ms): {}",
            self.response_timeout.as_millis()
        );
        let _ = writeln!(
            buf,
            "response termination: {}",
            display_termination(self.response_termination.as_deref())
        );
        let _ = write!(
            buf,
            "request termination: {}",
            display_termination(self.request_termination.as_deref())
        );
        buf
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

fn display_termination(termination: Option<&str>) -> String {
    match termination {
        Some(t) => t.escape_debug().to_string(),
        None => "none".to_string(),
    }
}
