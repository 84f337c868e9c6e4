//! Per-device command queue
//!
//! Every device owns exactly one queue. A queue is a single worker task fed by
//! an unbounded multi-producer channel; the worker owns the device transport
//! and runs one command at a time, in arrival order. Results come back through
//! a oneshot channel per command, so a waiting session holds no lock shared
//! with anyone else.
//!
//! # Design
//!
//! - Sequence numbers are assigned in the same critical section that enqueues,
//!   so sequence order is execution order
//! - The response timeout starts when the command is handed to the transport;
//!   time spent waiting behind other commands does not count
//! - Timeouts and recoverable I/O errors fail one command and the queue moves on
//! - A fatal transport error marks the device unusable; later commands fail
//!   immediately with the same message
//! - A result nobody waits for any more is dropped and logged
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tse_commander::queue::{CommandQueue, QueuePolicy};
//! use tse_commander::transport::MockTransport;
//!
//! # async fn example() {
//! let policy = QueuePolicy::new(Duration::from_millis(500));
//! let queue = CommandQueue::spawn("echo", Box::new(MockTransport::loopback()), policy);
//!
//! let response = queue.submit("*IDN?").await;
//! assert_eq!(&response.unwrap()[..], b"*IDN?");
//! # }
//! ```

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::transport::{DeviceTransport, TransportError};

/// Extra time granted to a worker on shutdown beyond its in-flight command.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Failed outcome of a single command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No complete response within the device's response timeout.
    #[error("timeout")]
    Timeout,

    /// The transport failed; carries the underlying cause.
    #[error("{0}")]
    Transport(String),

    /// The queue stopped before the command produced a result.
    #[error("device queue closed")]
    QueueClosed,
}

/// Outcome of a single command: the response bytes or the failure
pub type CommandResult = Result<Bytes, CommandError>;

/// Timeout and framing policy applied to every command of one device
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Maximum time from handing a command to the transport until its response
    pub response_timeout: Duration,
    /// End-of-response marker, excluded from the result
    pub response_termination: Option<Bytes>,
    /// Appended to each command before it is written
    pub request_termination: Option<Bytes>,
}

impl QueuePolicy {
    /// Policy with the given timeout and no termination sequences
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            response_timeout,
            response_termination: None,
            request_termination: None,
        }
    }

    /// Set the response termination sequence
    pub fn with_response_termination(mut self, termination: impl Into<Bytes>) -> Self {
        self.response_termination = Some(termination.into());
        self
    }

    /// Set the request termination sequence
    pub fn with_request_termination(mut self, termination: impl Into<Bytes>) -> Self {
        self.request_termination = Some(termination.into());
        self
    }
}

/// Command waiting in a device queue
#[derive(Debug)]
struct CommandRequest {
    sequence: u64,
    command: String,
    reply: oneshot::Sender<CommandResult>,
}

/// Handle to the eventual result of a submitted command
///
/// Awaiting it yields the result exactly once. Dropping it abandons the
/// result; the command itself still runs to completion or timeout.
#[derive(Debug)]
pub struct PendingResult {
    sequence: u64,
    rx: oneshot::Receiver<CommandResult>,
}

impl PendingResult {
    /// Position of the command in its device's execution order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Future for PendingResult {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CommandError::QueueClosed)))
    }
}

struct Submitter {
    next_sequence: u64,
    tx: mpsc::UnboundedSender<CommandRequest>,
}

/// Serializes command execution against one device transport
pub struct CommandQueue {
    device_id: String,
    response_timeout: Duration,
    submitter: Mutex<Submitter>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Spawn the worker task for a device
    ///
    /// The worker opens the transport before taking the first command. If
    /// opening fails the device is unusable and every command fails with the
    /// open error. Must be called from within a Tokio runtime.
    pub fn spawn(
        device_id: impl Into<String>,
        transport: Box<dyn DeviceTransport>,
        policy: QueuePolicy,
    ) -> Self {
        let device_id = device_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let response_timeout = policy.response_timeout;

        let worker = QueueWorker {
            device_id: device_id.clone(),
            transport,
            policy,
            unusable: None,
        };
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));

        Self {
            device_id,
            response_timeout,
            submitter: Mutex::new(Submitter {
                next_sequence: 0,
                tx,
            }),
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a command and return a handle to its result
    ///
    /// Never blocks: the command waits in the queue behind earlier ones.
    pub fn submit(&self, command: impl Into<String>) -> PendingResult {
        let (reply, rx) = oneshot::channel();
        let mut submitter = lock(&self.submitter);

        let sequence = submitter.next_sequence;
        submitter.next_sequence += 1;

        let request = CommandRequest {
            sequence,
            command: command.into(),
            reply,
        };
        // On a stopped queue the request is dropped with its reply sender,
        // which resolves the pending result to `QueueClosed`.
        if submitter.tx.send(request).is_err() {
            debug!(device = %self.device_id, sequence, "Command submitted to stopped queue");
        }

        PendingResult { sequence, rx }
    }

    /// Stop the worker after its in-flight command and close the transport
    ///
    /// Commands still waiting in the queue resolve to [`CommandError::QueueClosed`].
    /// Returns `false` if the worker did not stop cleanly in time.
    pub async fn shutdown(&self) -> bool {
        let _ = self.shutdown_tx.send(true);

        let Some(handle) = lock(&self.worker).take() else {
            return true;
        };

        match tokio::time::timeout(self.response_timeout + SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(device = %self.device_id, error = %e, "Queue worker panicked");
                false
            }
            Err(_) => {
                warn!(device = %self.device_id, "Queue worker did not stop in time");
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker task state; owns the transport exclusively
struct QueueWorker {
    device_id: String,
    transport: Box<dyn DeviceTransport>,
    policy: QueuePolicy,
    /// Set after a fatal transport error
    unusable: Option<String>,
}

impl QueueWorker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CommandRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        match self.transport.open().await {
            Ok(()) => info!(device = %self.device_id, "Device opened"),
            Err(e) => {
                error!(device = %self.device_id, error = %e, "Failed to open device");
                self.unusable = Some(e.to_string());
            }
        }

        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            trace!(
                device = %self.device_id,
                sequence = request.sequence,
                command = %request.command,
                "Executing command"
            );

            let started = Instant::now();
            let result = self.execute(&request.command).await;

            debug!(
                device = %self.device_id,
                sequence = request.sequence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Command completed"
            );

            if request.reply.send(result).is_err() {
                warn!(
                    device = %self.device_id,
                    sequence = request.sequence,
                    "Result discarded, no observer"
                );
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!(device = %self.device_id, error = %e, "Error closing device");
        }
        debug!(device = %self.device_id, "Command queue stopped");
    }

    async fn execute(&mut self, command: &str) -> CommandResult {
        if let Some(reason) = &self.unusable {
            return Err(CommandError::Transport(reason.clone()));
        }

        let transport = &mut self.transport;
        let policy = &self.policy;

        let mut payload = command.as_bytes().to_vec();
        if let Some(termination) = &policy.request_termination {
            payload.extend_from_slice(termination);
        }

        let timeout = policy.response_timeout;
        let termination = policy.response_termination.as_deref();

        // One deadline from handoff covers both the write and the read.
        let deadline = tokio::time::Instant::now() + timeout;
        let exchange = async {
            transport.write(&payload).await?;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            transport.read_until(termination, remaining).await
        };

        // The transport is expected to honour the timeout itself; this bounds
        // the command even when it does not.
        let outcome = tokio::time::timeout_at(deadline, exchange)
            .await
            .unwrap_or(Err(TransportError::Timeout));

        match outcome {
            Ok(response) => Ok(response),
            Err(TransportError::Timeout) => {
                warn!(device = %self.device_id, ?timeout, "Command timed out");
                Err(CommandError::Timeout)
            }
            Err(e) => {
                let message = e.to_string();
                if e.is_fatal() {
                    error!(device = %self.device_id, error = %message, "Device unusable");
                    self.unusable = Some(message.clone());
                } else {
                    warn!(device = %self.device_id, error = %message, "Command failed");
                }
                Err(CommandError::Transport(message))
            }
        }
    }
}
