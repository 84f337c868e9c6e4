//! Device transports
//!
//! A transport moves bytes between the gateway and one physical instrument.
//! The command queue is the only caller: it owns its device's transport
//! exclusively, so implementations never need internal locking against
//! concurrent commands.
//!
//! Implementations:
//! - [`SerialTransport`] - RS-232/USB-serial instruments (`instrument_serial` feature)
//! - [`TcpTransport`] - network-attached instruments
//! - [`LoopbackTransport`] - echo simulator for the `loopback` device kind
//! - [`MockTransport`] - scriptable transport for tests

pub mod loopback;
pub mod mock;
pub mod serial;
pub mod tcp;

pub use loopback::LoopbackTransport;
pub use mock::{MockReply, MockTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::config::TransportConfig;

/// Errors reported by a device transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// No complete response arrived before the deadline.
    #[error("timeout")]
    Timeout,

    /// Recoverable I/O failure; later commands may succeed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The link to the instrument is gone for good.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// The configuration cannot be honoured by this build or platform.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// `write`/`read_until` was called before a successful `open`.
    #[error("device not open")]
    NotOpen,
}

impl TransportError {
    /// Whether the device must be treated as unusable after this error.
    ///
    /// Fatal errors stick: every later command to the device fails with the
    /// same message until the process is restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::Unsupported(_) | TransportError::NotOpen
        )
    }
}

/// Byte-level link to one instrument.
#[async_trait]
pub trait DeviceTransport: Send {
    /// Open the underlying link. Called once, before the first command.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Write raw command bytes to the device.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read a response.
    ///
    /// With `termination`, bytes are accumulated until the termination sequence
    /// is seen and the response is returned without it. Without it, the first
    /// burst of received bytes is the response. Either way the call returns
    /// [`TransportError::Timeout`] once `timeout` has elapsed.
    async fn read_until(
        &mut self,
        termination: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Release the underlying link. Called once at shutdown.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Build the transport for a configured device. The transport is not opened.
pub fn build_transport(config: &TransportConfig) -> Box<dyn DeviceTransport> {
    match config {
        TransportConfig::Serial {
            path,
            baud_rate,
            data_bits,
            parity,
        } => Box::new(SerialTransport::new(
            path.clone(),
            *baud_rate,
            *data_bits,
            *parity,
        )),
        TransportConfig::Tcp { host, port } => Box::new(TcpTransport::new(host.clone(), *port)),
        TransportConfig::Loopback { latency_ms } => {
            Box::new(LoopbackTransport::new(Duration::from_millis(*latency_ms)))
        }
    }
}

/// Position of `needle` inside `haystack`, if present.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
