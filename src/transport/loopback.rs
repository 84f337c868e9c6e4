//! Loopback transport
//!
//! Echoes every command back after a fixed latency. Used for the `loopback`
//! device kind so clients can be exercised without hardware. Only the echo of
//! the command in flight is held; nothing else is retained.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use super::{find_subsequence, DeviceTransport, TransportError};

/// Echoing transport for bench setups without an instrument
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    latency: Duration,
    is_open: bool,
    pending: Option<Bytes>,
}

impl LoopbackTransport {
    /// Create a loopback answering after `latency`
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DeviceTransport for LoopbackTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.is_open = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::NotOpen);
        }
        self.pending = Some(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn read_until(
        &mut self,
        termination: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let Some(echo) = self.pending.take() else {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        };

        if self.latency >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        }
        tokio::time::sleep(self.latency).await;

        // The echo may or may not carry the terminator; both are answers.
        let end = termination
            .and_then(|t| find_subsequence(&echo, t))
            .unwrap_or(echo.len());
        Ok(echo.slice(..end))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.pending = None;
        Ok(())
    }
}
