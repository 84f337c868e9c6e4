//! Per-connection protocol state machine
//!
//! A session starts at the top level, where the client can list, describe
//! and attach to devices. Once attached, every line that is not a control
//! command is forwarded to the device's command queue and the session waits
//! for that one result before it reads the next line. Waiting only blocks
//! this session: the wait is on a oneshot channel, not on any shared lock.
//!
//! ```text
//!             connect <id>
//!   TopLevel ──────────────▶ AttachedToDevice(id)
//!      ▲                            │
//!      └──────────── \q ────────────┘
//! ```

use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::registry::DeviceRegistry;

/// Prompt suffix; the full prompt is `"$ "` or `"<id>$ "`.
pub const PROMPT: &str = "$ ";

const TOP_LEVEL_HELP: &str = "    list           List available devices to manage.\n\
                              \x20   describe <ID>  Print device configuration details.\n\
                              \x20   connect <ID>   Connect and interact with a device.";

const DEVICE_HELP: &str = "    \\hex       Print the hexadecimal value of next responses.\n\
                           \x20   \\ascii     Print the ASCII value of next responses.\n\
                           \x20   \\q         Disconnect device.\n\
                           \n\
                           \x20   Any other command is sent to the connected device.";

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// User-visible protocol errors; none of them end the session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `describe`/`connect` named an id that is not registered.
    #[error("unknown device")]
    UnknownDevice,

    /// Top-level input matched no command.
    #[error("{0}: command not found")]
    UnknownCommand(String),

    /// A command was given without its required argument.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// How device responses are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    /// Raw response text
    #[default]
    Ascii,
    /// Uppercase hex, two digits per byte, no separators
    Hex,
}

/// Where the session currently is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Initial menu
    #[default]
    TopLevel,
    /// Lines are forwarded to this device
    AttachedToDevice(String),
}

/// Protocol state of one client connection
pub struct Session {
    id: Uuid,
    registry: Arc<DeviceRegistry>,
    state: SessionState,
    display_mode: DisplayMode,
}

impl Session {
    /// Create a session at the top level in ASCII mode
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            state: SessionState::default(),
            display_mode: DisplayMode::default(),
        }
    }

    /// Connection identity, used in log fields
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Id of the attached device, if any
    pub fn attached_device(&self) -> Option<&str> {
        match &self.state {
            SessionState::AttachedToDevice(id) => Some(id),
            SessionState::TopLevel => None,
        }
    }

    /// Current response rendering
    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    /// Prompt to show after the next reply
    pub fn prompt(&self) -> String {
        match self.attached_device() {
            Some(id) => format!("{}{}", id, PROMPT),
            None => PROMPT.to_string(),
        }
    }

    /// Interpret one input line and return the reply text
    ///
    /// The line must not include its line ending. An empty reply means
    /// nothing is printed before the prompt.
    pub async fn handle_line(&mut self, line: &str) -> String {
        trace!(session = %self.id, line, "Handling line");
        let reply = match self.state.clone() {
            SessionState::TopLevel => self.handle_top_level(line),
            SessionState::AttachedToDevice(id) => Ok(self.handle_device_line(&id, line).await),
        };
        reply.unwrap_or_else(|e| e.to_string())
    }

    fn handle_top_level(&mut self, line: &str) -> Result<String, SessionError> {
        let input = line.trim();
        let mut words = input.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(String::new());
        };
        let argument = words.next();

        match command {
            "?" | "help" => Ok(TOP_LEVEL_HELP.to_string()),
            "list" => Ok(self.list_devices()),
            "describe" => {
                let id = argument.ok_or(SessionError::Usage("describe <ID>"))?;
                let device = self.registry.lookup(id).ok_or(SessionError::UnknownDevice)?;
                Ok(device.describe())
            }
            "connect" => {
                let id = argument.ok_or(SessionError::Usage("connect <ID>"))?;
                let device = self.registry.lookup(id).ok_or(SessionError::UnknownDevice)?;
                debug!(session = %self.id, device = %device.id(), "Attached to device");
                self.state = SessionState::AttachedToDevice(device.id().to_string());
                Ok(String::new())
            }
            _ => Err(SessionError::UnknownCommand(input.to_string())),
        }
    }

    async fn handle_device_line(&mut self, id: &str, line: &str) -> String {
        match line.trim() {
            "" => String::new(),
            "\\q" => {
                debug!(session = %self.id, device = %id, "Detached from device");
                self.state = SessionState::TopLevel;
                String::new()
            }
            "\\hex" => {
                self.display_mode = DisplayMode::Hex;
                String::new()
            }
            "\\ascii" => {
                self.display_mode = DisplayMode::Ascii;
                String::new()
            }
            "?" | "help" => DEVICE_HELP.to_string(),
            _ => {
                let Some(device) = self.registry.lookup(id) else {
                    self.state = SessionState::TopLevel;
                    return SessionError::UnknownDevice.to_string();
                };
                let pending = device.submit(line);
                trace!(session = %self.id, device = %id, sequence = pending.sequence(), "Awaiting result");

                match pending.await {
                    Ok(response) => match self.display_mode {
                        DisplayMode::Hex => to_hex(&response),
                        DisplayMode::Ascii => String::from_utf8_lossy(&response).into_owned(),
                    },
                    Err(e) => e.to_string(),
                }
            }
        }
    }

    fn list_devices(&self) -> String {
        let mut table = format!("{:<20} {}", "ID", "DESCRIPTION");
        for device in self.registry.list() {
            // Writing into a String cannot fail.
            let _ = write!(table, "\n{:<20} {}", device.id(), device.description());
        }
        table
    }
}

/// Render bytes as uppercase hex, two digits per byte, no separators
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceDefinition, TransportConfig};
    use crate::device::Device;
    use crate::transport::{MockReply, MockTransport};

    fn definition(id: &str, description: &str, timeout_ms: u64) -> DeviceDefinition {
        DeviceDefinition {
            id: id.to_string(),
            description: description.to_string(),
            response_timeout_ms: timeout_ms,
            response_termination: Some("\n".to_string()),
            request_termination: None,
            transport: TransportConfig::Loopback { latency_ms: 0 },
        }
    }

    fn session_with(transports: Vec<(&str, MockTransport)>) -> Session {
        let devices = transports
            .into_iter()
            .map(|(id, t)| {
                let def = definition(id, &format!("{} unit", id), 100);
                Device::with_transport(&def, Box::new(t))
            })
            .collect();
        Session::new(Arc::new(DeviceRegistry::new(devices).unwrap()))
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x0A, 0xFF]), "0AFF");
        assert_eq!(to_hex(b""), "");
        assert_eq!(to_hex(b"OK"), "4F4B");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let session = session_with(vec![]);
        assert_eq!(session.state(), &SessionState::TopLevel);
        assert_eq!(session.display_mode(), DisplayMode::Ascii);
        assert_eq!(session.prompt(), "$ ");
    }

    #[tokio::test]
    async fn test_help_and_empty_line() {
        let mut session = session_with(vec![]);
        assert_eq!(session.handle_line("?").await, TOP_LEVEL_HELP);
        assert_eq!(session.handle_line("help").await, TOP_LEVEL_HELP);
        assert!(TOP_LEVEL_HELP.contains("    describe <ID>  Print device configuration details."));
        assert_eq!(session.handle_line("").await, "");
        assert_eq!(session.handle_line("   ").await, "");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut session = session_with(vec![]);
        assert_eq!(session.handle_line("reboot now").await, "reboot now: command not found");
        assert_eq!(session.handle_line("  lister ").await, "lister: command not found");
        assert_eq!(session.state(), &SessionState::TopLevel);
    }

    #[tokio::test]
    async fn test_list_in_registration_order() {
        let mut session = session_with(vec![
            ("zeta", MockTransport::loopback()),
            ("alpha", MockTransport::loopback()),
        ]);
        let expected = format!(
            "{:<20} {}\n{:<20} {}\n{:<20} {}",
            "ID", "DESCRIPTION", "zeta", "zeta unit", "alpha", "alpha unit"
        );
        assert_eq!(session.handle_line("list").await, expected);
    }

    #[tokio::test]
    async fn test_describe() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        let text = session.handle_line("describe psu").await;
        assert!(text.starts_with("locator: loopback"));
        assert!(text.contains("response timeout (ms): 100"));
        assert!(text.contains("response termination: \\n"));
        assert_eq!(session.handle_line("describe").await, "usage: describe <ID>");
    }

    #[tokio::test]
    async fn test_unknown_device_leaves_state_unchanged() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        assert_eq!(session.handle_line("describe nope").await, "unknown device");
        assert_eq!(session.handle_line("connect nope").await, "unknown device");
        assert_eq!(session.state(), &SessionState::TopLevel);

        session.handle_line("connect psu").await;
        // Inside device mode, `connect nope` is just a device command
        assert_eq!(session.handle_line("connect nope").await, "connect nope");
        assert_eq!(session.attached_device(), Some("psu"));
    }

    #[tokio::test]
    async fn test_connect_and_quit_round_trip() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        assert_eq!(session.handle_line("connect psu").await, "");
        assert_eq!(session.attached_device(), Some("psu"));
        assert_eq!(session.prompt(), "psu$ ");

        assert_eq!(session.handle_line("\\q").await, "");
        assert_eq!(session.state(), &SessionState::TopLevel);
        assert_eq!(session.attached_device(), None);
        assert_eq!(session.prompt(), "$ ");
    }

    #[tokio::test]
    async fn test_device_help() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        session.handle_line("connect psu").await;
        assert_eq!(session.handle_line("help").await, DEVICE_HELP);
        assert!(DEVICE_HELP.ends_with("Any other command is sent to the connected device."));
    }

    #[tokio::test]
    async fn test_forward_command_ascii() {
        let transport = MockTransport::new();
        transport.push_response("ACME,PSU-1\n");
        let mut session = session_with(vec![("psu", transport.clone())]);

        session.handle_line("connect psu").await;
        assert_eq!(session.handle_line("*IDN?").await, "ACME,PSU-1");
        assert_eq!(transport.commands(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    async fn test_forward_command_hex() {
        let transport = MockTransport::new();
        transport.push_response(vec![0x0A, 0xFF]);
        let mut def = definition("raw", "raw bytes", 100);
        def.response_termination = None;
        let device = Device::with_transport(&def, Box::new(transport));
        let mut session = Session::new(Arc::new(DeviceRegistry::new(vec![device]).unwrap()));

        session.handle_line("connect raw").await;
        session.handle_line("\\hex").await;
        assert_eq!(session.display_mode(), DisplayMode::Hex);
        assert_eq!(session.handle_line("READ").await, "0AFF");
    }

    #[tokio::test]
    async fn test_display_mode_toggles_are_idempotent() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        session.handle_line("connect psu").await;

        session.handle_line("\\hex").await;
        session.handle_line("\\hex").await;
        assert_eq!(session.display_mode(), DisplayMode::Hex);
        assert_eq!(session.handle_line("AB").await, "4142");

        session.handle_line("\\ascii").await;
        session.handle_line("\\ascii").await;
        assert_eq!(session.display_mode(), DisplayMode::Ascii);
        assert_eq!(session.handle_line("AB").await, "AB");
    }

    #[tokio::test]
    async fn test_display_mode_survives_detach() {
        let mut session = session_with(vec![("psu", MockTransport::loopback())]);
        session.handle_line("connect psu").await;
        session.handle_line("\\hex").await;
        session.handle_line("\\q").await;
        session.handle_line("connect psu").await;
        assert_eq!(session.display_mode(), DisplayMode::Hex);
    }

    #[tokio::test]
    async fn test_timeout_reported_verbatim() {
        let transport = MockTransport::loopback();
        transport.push_reply(MockReply::Silent);
        let mut session = session_with(vec![("psu", transport)]);

        session.handle_line("connect psu").await;
        assert_eq!(session.handle_line("MEAS?").await, "timeout");
        assert_eq!(session.handle_line("PING").await, "PING");
        assert_eq!(session.attached_device(), Some("psu"));
    }

    #[tokio::test]
    async fn test_transport_failure_reported_verbatim() {
        let transport = MockTransport::loopback();
        transport.push_reply(MockReply::Fail("port closed".into()));
        let mut session = session_with(vec![("psu", transport)]);

        session.handle_line("connect psu").await;
        assert_eq!(session.handle_line("MEAS?").await, "port closed");
    }
}
