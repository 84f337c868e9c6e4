//! Serial transport for RS-232 / USB-serial instruments
//!
//! Wraps the `serialport` crate. Serial I/O is blocking, so every operation
//! runs on Tokio's blocking pool while holding the port's mutex. The mutex is
//! never contended by other commands (the owning queue runs one command at a
//! time); it exists so the port can move into `spawn_blocking` and survive a
//! caller that gives up waiting.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use super::{DeviceTransport, TransportError};
use crate::config::Parity;

#[cfg(feature = "instrument_serial")]
use {
    super::find_subsequence,
    bytes::BytesMut,
    serialport::SerialPort,
    std::sync::Arc,
    tokio::sync::Mutex,
};

/// Polling interval of the underlying port; reads re-check the deadline this often.
#[cfg(feature = "instrument_serial")]
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[cfg(feature = "instrument_serial")]
struct SerialLink {
    port: Box<dyn SerialPort>,
    /// Bytes received after the last terminator, kept for the next read.
    leftover: BytesMut,
}

/// Serial transport
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    data_bits: u8,
    parity: Parity,

    #[cfg(feature = "instrument_serial")]
    link: Option<Arc<Mutex<SerialLink>>>,
}

impl SerialTransport {
    /// Create a serial transport. The port is opened by [`DeviceTransport::open`].
    pub fn new(path: String, baud_rate: u32, data_bits: u8, parity: Parity) -> Self {
        Self {
            path,
            baud_rate,
            data_bits,
            parity,
            #[cfg(feature = "instrument_serial")]
            link: None,
        }
    }

    /// Serial device path
    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(feature = "instrument_serial")]
    fn link(&self) -> Result<Arc<Mutex<SerialLink>>, TransportError> {
        self.link.clone().ok_or(TransportError::NotOpen)
    }
}

#[cfg(feature = "instrument_serial")]
fn to_serialport_parity(parity: Parity) -> Result<serialport::Parity, TransportError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(TransportError::Unsupported(format!(
            "parity {} is not supported by the serial driver",
            parity
        ))),
    }
}

#[cfg(feature = "instrument_serial")]
fn to_serialport_data_bits(data_bits: u8) -> Result<serialport::DataBits, TransportError> {
    match data_bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(TransportError::Unsupported(format!(
            "{} data bits",
            other
        ))),
    }
}

#[cfg(feature = "instrument_serial")]
fn past_deadline(deadline: std::time::Instant) -> bool {
    std::time::Instant::now() >= deadline
}

#[cfg(feature = "instrument_serial")]
fn join_error(err: tokio::task::JoinError) -> TransportError {
    TransportError::Io(std::io::Error::other(format!("serial I/O task failed: {}", err)))
}

#[cfg(feature = "instrument_serial")]
fn io_error(err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::Disconnected(err.to_string()),
        _ => TransportError::Io(err.into()),
    }
}

#[async_trait]
impl DeviceTransport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.link.is_some() {
                return Ok(());
            }

            let builder = serialport::new(&self.path, self.baud_rate)
                .data_bits(to_serialport_data_bits(self.data_bits)?)
                .parity(to_serialport_parity(self.parity)?)
                .timeout(PORT_POLL_INTERVAL);

            let port = tokio::task::spawn_blocking(move || builder.open())
                .await
                .map_err(join_error)?
                .map_err(|e| TransportError::Disconnected(e.to_string()))?;

            self.link = Some(Arc::new(Mutex::new(SerialLink {
                port,
                leftover: BytesMut::new(),
            })));

            debug!(
                path = %self.path,
                baud_rate = self.baud_rate,
                "Serial port opened"
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            debug!(path = %self.path, "Serial support not compiled in");
            let _ = (self.baud_rate, self.data_bits, self.parity);
            Err(TransportError::Unsupported(
                "serial support not enabled. Rebuild with --features instrument_serial".to_string(),
            ))
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let link = self.link()?;
            let data = data.to_vec();

            tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
                use std::io::Write;

                let mut link = link.blocking_lock();

                // Stale bytes belong to an earlier command that timed out.
                link.leftover.clear();
                link.port
                    .clear(serialport::ClearBuffer::Input)
                    .map_err(io_error)?;

                link.port.write_all(&data)?;
                link.port.flush()?;
                Ok(())
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = data;
            Err(TransportError::NotOpen)
        }
    }

    async fn read_until(
        &mut self,
        termination: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            // Fixed before the blocking task starts, so time waiting for the
            // blocking pool or the port lock counts against this read.
            let deadline = std::time::Instant::now() + timeout;
            let link = self.link()?;
            let termination = termination.map(<[u8]>::to_vec);

            tokio::task::spawn_blocking(move || -> Result<Bytes, TransportError> {
                use std::io::{ErrorKind, Read};

                let mut link = link.blocking_lock();
                let mut chunk = [0u8; 256];

                loop {
                    if let Some(term) = termination.as_deref() {
                        if let Some(pos) = find_subsequence(&link.leftover, term) {
                            let response = link.leftover.split_to(pos).freeze();
                            let _ = link.leftover.split_to(term.len());
                            return Ok(response);
                        }
                    } else if !link.leftover.is_empty() {
                        return Ok(link.leftover.split().freeze());
                    }

                    if past_deadline(deadline) {
                        return Err(TransportError::Timeout);
                    }

                    match link.port.read(&mut chunk) {
                        Ok(0) => {
                            return Err(TransportError::Disconnected(
                                "unexpected EOF from serial port".to_string(),
                            ))
                        }
                        Ok(n) => link.leftover.extend_from_slice(&chunk[..n]),
                        // Port timeout is shorter than our overall timeout
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) => return Err(TransportError::Io(e)),
                    }
                }
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (termination, timeout);
            Err(TransportError::NotOpen)
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.link.take().is_some() {
                debug!(path = %self.path, "Serial port closed");
            }
        }
        Ok(())
    }
}
