//! TCP transport for network-attached instruments
//!
//! Many bench instruments (SCPI over raw socket, terminal servers in front of
//! serial equipment) expose a plain TCP stream. The connection is made once on
//! `open` and kept for the process lifetime; losing it makes the device
//! unusable.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{find_subsequence, DeviceTransport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    /// Bytes received after the last terminator, kept for the next read.
    buffer: BytesMut,
}

impl TcpTransport {
    /// Create a TCP transport. The connection is made by [`DeviceTransport::open`].
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }

    /// Drop anything that arrived after the previous response.
    fn discard_stale_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        let stream = self.stream()?;
        let mut scratch = [0u8; 512];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => {
                    return Err(TransportError::Disconnected(
                        "connection closed by instrument".to_string(),
                    ))
                }
                Ok(n) => trace!(bytes = n, "Discarded stale input"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(classify(e)),
            }
        }
    }

    fn take_response(&mut self, termination: Option<&[u8]>) -> Option<Bytes> {
        match termination {
            Some(term) => {
                let pos = find_subsequence(&self.buffer, term)?;
                let response = self.buffer.split_to(pos).freeze();
                let _ = self.buffer.split_to(term.len());
                Some(response)
            }
            None if !self.buffer.is_empty() => Some(self.buffer.split().freeze()),
            None => None,
        }
    }
}

fn classify(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => TransportError::Disconnected(err.to_string()),
        _ => TransportError::Io(err),
    }
}

#[async_trait]
impl DeviceTransport for TcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Disconnected(format!(
                    "cannot connect to {}:{}: {}",
                    self.host, self.port, e
                )))
            }
            Err(_) => {
                return Err(TransportError::Disconnected(format!(
                    "cannot connect to {}:{}: connect timed out",
                    self.host, self.port
                )))
            }
        };
        stream.set_nodelay(true)?;

        debug!(host = %self.host, port = self.port, "TCP instrument connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.discard_stale_input()?;
        let stream = self.stream()?;
        stream.write_all(data).await.map_err(classify)?;
        stream.flush().await.map_err(classify)
    }

    async fn read_until(
        &mut self,
        termination: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(response) = self.take_response(termination) {
                return Ok(response);
            }

            let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
            let read = tokio::time::timeout_at(deadline, stream.read_buf(&mut self.buffer));
            match read.await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(TransportError::Disconnected(
                        "connection closed by instrument".to_string(),
                    ));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(classify(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!(host = %self.host, port = self.port, "TCP instrument disconnected");
        }
        Ok(())
    }
}
