//! Gateway front-end
//!
//! Accepts client connections, frames their input into lines and drives one
//! [`Session`] per connection. Every connection runs in its own task, so a
//! session waiting on a slow device never holds up anyone else.
//!
//! Wire behaviour:
//! - on connect: banner line, then the `"$ "` prompt
//! - per line: the session's reply plus `\n` (only when non-empty), then the prompt
//! - malformed lines (too long, not UTF-8) are logged and discarded
//! - a panic while handling a line becomes `error: internal fault` for that
//!   client only

use futures::FutureExt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::AppResult;
use crate::registry::DeviceRegistry;
use crate::session::Session;

/// Reply sent to a client when processing its line panicked.
pub const INTERNAL_FAULT: &str = "error: internal fault";

/// Malformed client input; the line is dropped and the session continues
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The line is not valid UTF-8.
    #[error("input line is not valid UTF-8")]
    InvalidUtf8,

    /// The line exceeds the configured limit.
    #[error("input line longer than {0} bytes")]
    LineTooLong(usize),
}

/// One unit of client input
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its line ending
    Line(String),
    /// A line that could not be accepted
    Malformed(FramingError),
    /// The client closed its side
    Eof,
}

/// Splits a byte stream into bounded `\n`-terminated lines
pub struct LineReader<R> {
    reader: BufReader<R>,
    max_line_length: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Create a reader accepting lines up to `max_line_length` bytes
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_line_length,
            buf: Vec::new(),
        }
    }

    /// Read the next frame
    ///
    /// A trailing `\r` is removed. A final line without `\n` before EOF is
    /// still returned as a line.
    pub async fn next_frame(&mut self) -> io::Result<Frame> {
        self.buf.clear();

        // Room for the line plus "\r\n".
        let limit = self.max_line_length as u64 + 2;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(Frame::Eof);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if n as u64 >= limit {
            self.discard_rest_of_line().await?;
            return Ok(Frame::Malformed(FramingError::LineTooLong(
                self.max_line_length,
            )));
        }

        if self.buf.len() > self.max_line_length {
            return Ok(Frame::Malformed(FramingError::LineTooLong(
                self.max_line_length,
            )));
        }

        match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(line) => Ok(Frame::Line(line)),
            Err(_) => Ok(Frame::Malformed(FramingError::InvalidUtf8)),
        }
    }

    async fn discard_rest_of_line(&mut self) -> io::Result<()> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }
}

/// Connection acceptor and per-connection protocol driver
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<DeviceRegistry>,
    config: Arc<ServerConfig>,
}

impl Gateway {
    /// Create a gateway serving the given devices
    pub fn new(registry: Arc<DeviceRegistry>, config: ServerConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        info!(address = %listener.local_addr()?, "Gateway listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` completes
    ///
    /// On shutdown the listener is dropped and open connections are aborted.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let gateway = self.clone();
                        connections.spawn(async move {
                            if let Err(e) = gateway.handle_connection(socket, peer.to_string()).await {
                                warn!(%peer, error = %e, "Client connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        let open = connections.len();
        connections.shutdown().await;
        if open > 0 {
            info!(connections = open, "Closed open client connections");
        }
        Ok(())
    }

    /// Run the protocol on one connection until the client disconnects
    pub async fn handle_connection<S>(&self, stream: S, peer: String) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut session = Session::new(self.registry.clone());
        let session_id = session.id();
        info!(session = %session_id, %peer, "Client connected");

        let (read, write) = tokio::io::split(stream);
        let mut lines = LineReader::new(read, self.config.max_line_length);
        let mut writer = BufWriter::new(write);

        writer.write_all(self.config.banner.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.write_all(session.prompt().as_bytes()).await?;
        writer.flush().await?;

        loop {
            let reply = match lines.next_frame().await? {
                Frame::Eof => break,
                Frame::Malformed(e) => {
                    warn!(session = %session_id, error = %e, "Discarding malformed input line");
                    String::new()
                }
                Frame::Line(line) => process_line(&mut session, &line).await,
            };

            if !reply.is_empty() {
                writer.write_all(reply.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.write_all(session.prompt().as_bytes()).await?;
            writer.flush().await?;
        }

        info!(session = %session_id, %peer, "Client disconnected");
        Ok(())
    }
}

async fn process_line(session: &mut Session, line: &str) -> String {
    let session_id = session.id();
    contain_fault(session_id, line, session.handle_line(line)).await
}

/// Run the processing of one line, turning a panic into [`INTERNAL_FAULT`]
async fn contain_fault<F>(session_id: Uuid, line: &str, processing: F) -> String
where
    F: Future<Output = String>,
{
    match AssertUnwindSafe(processing).catch_unwind().await {
        Ok(reply) => reply,
        Err(_) => {
            error!(session = %session_id, line, "Panic while processing line");
            INTERNAL_FAULT.to_string()
        }
    }
}
