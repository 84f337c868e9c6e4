//! Core library for the tse-commander gateway.
//!
//! The gateway exposes a set of configured instruments (serial ports, TCP
//! instruments, loopback test devices) over a line-oriented TCP protocol.
//! Clients list and describe devices, attach to one and send it raw
//! commands. Each device has exactly one command queue, so commands from
//! any number of sessions reach it one at a time, in arrival order, with a
//! per-command response timeout.
//!
//! Layering, bottom-up:
//! - [`transport`]: byte-level access to one instrument
//! - [`queue`]: per-device FIFO worker owning the transport
//! - [`device`] and [`registry`]: configured devices shared by all sessions
//! - [`session`]: per-connection protocol state machine
//! - [`server`]: TCP accept loop and line framing

pub mod config;
pub mod device;
pub mod error;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use device::Device;
pub use error::{AppResult, GatewayError};
pub use registry::DeviceRegistry;
pub use server::Gateway;
pub use session::Session;
