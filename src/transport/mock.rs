//! Mock device transport
//!
//! Simulated instrument link for tests:
//! - Loopback mode echoes every command back
//! - Scripted replies, consumed one per command
//! - Simulated latency and failure injection
//! - Execution log with timestamps for ordering/overlap verification
//!
//! The log grows with every command; long-running devices use
//! [`LoopbackTransport`](super::LoopbackTransport) instead.
//!
//! Clones share state, so a test can keep a handle while the command queue
//! owns the boxed transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{find_subsequence, DeviceTransport, TransportError};

/// Scripted behaviour for one command
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Deliver these bytes. With a termination configured they must contain it.
    Respond(Bytes),
    /// Produce nothing; `read_until` reports a timeout once its deadline passes.
    Silent,
    /// Never return from `read_until`.
    Hang,
    /// Fail the read with a recoverable I/O error carrying this message.
    Fail(String),
    /// Fail the read as if the link dropped.
    Disconnect,
}

/// One command as seen by the transport
#[derive(Debug, Clone)]
pub struct Execution {
    /// Bytes written, decoded lossily
    pub command: String,
    /// When the command was written
    pub started: Instant,
    /// When the response read returned, if it did
    pub finished: Option<Instant>,
    /// Timeout the response read was given
    pub read_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockState {
    echo: bool,
    replies: VecDeque<MockReply>,
    pending: Option<Pending>,
    is_open: bool,
    open_count: usize,
    close_count: usize,
    fail_open: Option<String>,
    executions: Vec<Execution>,
}

#[derive(Debug)]
enum Pending {
    Echo(Bytes),
    Scripted(MockReply),
}

/// Scriptable in-memory transport
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    latency: Duration,
    write_latency: Duration,
}

impl MockTransport {
    /// Create a transport that only answers with scripted replies.
    ///
    /// Commands without a scripted reply behave like [`MockReply::Silent`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that echoes commands without a scripted reply
    pub fn loopback() -> Self {
        let transport = Self::default();
        transport.state().echo = true;
        transport
    }

    /// Set simulated response latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set simulated time spent writing each command
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Queue a reply for a future command
    pub fn push_reply(&self, reply: MockReply) {
        self.state().replies.push_back(reply);
    }

    /// Queue a successful response
    pub fn push_response(&self, response: impl Into<Bytes>) {
        self.push_reply(MockReply::Respond(response.into()));
    }

    /// Make the next `open` fail with the given message
    pub fn fail_open(&self, message: &str) {
        self.state().fail_open = Some(message.to_string());
    }

    /// Commands written so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .executions
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    /// Execution log with timestamps
    pub fn executions(&self) -> Vec<Execution> {
        self.state().executions.clone()
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_execution(&self) {
        if let Some(last) = self.state().executions.last_mut() {
            last.finished = Some(Instant::now());
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(message) = state.fail_open.take() {
            return Err(TransportError::Disconnected(message));
        }
        state.is_open = true;
        state.open_count += 1;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        let mut state = self.state();
        if !state.is_open {
            return Err(TransportError::NotOpen);
        }

        state.executions.push(Execution {
            command: String::from_utf8_lossy(data).into_owned(),
            started: Instant::now(),
            finished: None,
            read_timeout: None,
        });

        state.pending = match state.replies.pop_front() {
            Some(reply) => Some(Pending::Scripted(reply)),
            None if state.echo => Some(Pending::Echo(Bytes::copy_from_slice(data))),
            None => Some(Pending::Scripted(MockReply::Silent)),
        };
        Ok(())
    }

    async fn read_until(
        &mut self,
        termination: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let pending = {
            let mut state = self.state();
            if let Some(last) = state.executions.last_mut() {
                last.read_timeout = Some(timeout);
            }
            state.pending.take()
        };
        let deadline = tokio::time::Instant::now() + timeout;

        if !self.latency.is_zero() {
            tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + self.latency))
                .await;
            if tokio::time::Instant::now() >= deadline {
                self.finish_execution();
                return Err(TransportError::Timeout);
            }
        }

        let result = match pending {
            None => Err(TransportError::Timeout),
            Some(Pending::Echo(data)) => {
                let end = termination
                    .and_then(|t| find_subsequence(&data, t))
                    .unwrap_or(data.len());
                Ok(data.slice(..end))
            }
            Some(Pending::Scripted(MockReply::Respond(data))) => match termination {
                None => Ok(data),
                Some(t) => match find_subsequence(&data, t) {
                    Some(end) => Ok(data.slice(..end)),
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        Err(TransportError::Timeout)
                    }
                },
            },
            Some(Pending::Scripted(MockReply::Silent)) => {
                tokio::time::sleep_until(deadline).await;
                Err(TransportError::Timeout)
            }
            Some(Pending::Scripted(MockReply::Hang)) => std::future::pending().await,
            Some(Pending::Scripted(MockReply::Fail(message))) => {
                Err(TransportError::Io(std::io::Error::other(message)))
            }
            Some(Pending::Scripted(MockReply::Disconnect)) => {
                self.state().is_open = false;
                Err(TransportError::Disconnected("connection lost".to_string()))
            }
        };

        self.finish_execution();
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.is_open = false;
        state.close_count += 1;
        Ok(())
    }
}
