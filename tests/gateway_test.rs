//! End-to-end tests for the gateway over real TCP connections
//!
//! These tests verify that:
//! - sessions talking to different devices never block each other
//! - commands from several sessions reach one device in FIFO order, one at a time
//! - timeouts and transport failures are reported per command
//! - a client disconnecting mid-command does not disturb other sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tse_commander::config::{DeviceDefinition, ServerConfig, TransportConfig};
use tse_commander::transport::{MockReply, MockTransport};
use tse_commander::{AppResult, Device, DeviceRegistry, Gateway, GatewayConfig};

const BANNER: &str = "Welcome! Run '?' for more info.";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct TestGateway {
    addr: SocketAddr,
    registry: Arc<DeviceRegistry>,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<AppResult<()>>,
}

impl TestGateway {
    async fn start(devices: Vec<(&str, u64, Option<&str>, MockTransport)>) -> Self {
        let devices = devices
            .into_iter()
            .map(|(id, timeout_ms, termination, transport)| {
                let def = DeviceDefinition {
                    id: id.to_string(),
                    description: format!("{} test device", id),
                    response_timeout_ms: timeout_ms,
                    response_termination: termination.map(str::to_string),
                    request_termination: None,
                    transport: TransportConfig::Loopback { latency_ms: 0 },
                };
                Device::with_transport(&def, Box::new(transport))
            })
            .collect();
        let registry = Arc::new(DeviceRegistry::new(devices).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = Gateway::new(registry.clone(), ServerConfig::default());
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            gateway
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            addr,
            registry,
            stop: Some(stop),
            server,
        }
    }

    async fn client(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let result = tokio::time::timeout(IO_TIMEOUT, self.server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
        self.registry.shutdown().await.unwrap();
    }
}

struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    prompt: String,
    pending: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader,
            writer,
            prompt: "$ ".to_string(),
            pending: Vec::new(),
        };
        let greeting = client.read_to_prompt().await;
        assert_eq!(greeting, BANNER);
        client
    }

    /// Read until the buffered output ends with the current prompt
    async fn read_to_prompt(&mut self) -> String {
        let prompt = self.prompt.clone();
        tokio::time::timeout(IO_TIMEOUT, async {
            let mut chunk = [0u8; 1024];
            while !self.pending.ends_with(prompt.as_bytes()) {
                let n = self.reader.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed while waiting for prompt");
                self.pending.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for prompt");

        let mut text = String::from_utf8(std::mem::take(&mut self.pending)).unwrap();
        text.truncate(text.len() - prompt.len());
        if text.ends_with('\n') {
            text.pop();
        }
        text
    }

    async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Send a line and return the reply shown before the next prompt
    async fn request(&mut self, line: &str) -> String {
        self.send_line(line).await;
        self.read_to_prompt().await
    }

    async fn attach(&mut self, id: &str) {
        self.send_line(&format!("connect {}", id)).await;
        self.prompt = format!("{}$ ", id);
        assert_eq!(self.read_to_prompt().await, "");
    }
}

#[tokio::test]
async fn test_list_describe_and_attach() {
    let gateway = TestGateway::start(vec![
        ("zeta", 500, None, MockTransport::loopback()),
        ("alpha", 500, Some("\n"), MockTransport::loopback()),
    ])
    .await;
    let mut client = gateway.client().await;

    assert_eq!(
        client.request("list").await,
        format!(
            "{:<20} {}\n{:<20} {}\n{:<20} {}",
            "ID",
            "DESCRIPTION",
            "zeta",
            "zeta test device",
            "alpha",
            "alpha test device"
        )
    );
    assert!(client
        .request("describe alpha")
        .await
        .contains("response termination: \\n"));
    assert_eq!(client.request("describe beta").await, "unknown device");
    assert_eq!(client.request("connect beta").await, "unknown device");
    assert_eq!(client.request("bogus").await, "bogus: command not found");

    client.attach("alpha").await;
    assert_eq!(client.request("*IDN?").await, "*IDN?");
    client.send_line("\\q").await;
    client.prompt = "$ ".to_string();
    assert_eq!(client.read_to_prompt().await, "");

    gateway.stop().await;
}

#[tokio::test]
async fn test_slow_device_does_not_block_other_sessions() {
    let slow = MockTransport::loopback().with_latency(Duration::from_millis(800));
    let gateway = TestGateway::start(vec![
        ("slow", 2000, None, slow.clone()),
        ("fast", 2000, None, MockTransport::loopback()),
    ])
    .await;

    let mut waiting = gateway.client().await;
    waiting.attach("slow").await;
    let slow_request = tokio::spawn(async move {
        let reply = waiting.request("MEAS?").await;
        (waiting, reply)
    });

    // Let the slow command reach the device
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(slow.commands(), vec!["MEAS?".to_string()]);

    let mut other = gateway.client().await;
    let start = Instant::now();
    assert!(other.request("list").await.contains("slow test device"));
    other.attach("fast").await;
    assert_eq!(other.request("PING").await, "PING");
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "fast session was blocked for {:?}",
        start.elapsed()
    );

    let (_waiting, reply) = slow_request.await.unwrap();
    assert_eq!(reply, "MEAS?");

    gateway.stop().await;
}

#[tokio::test]
async fn test_commands_from_many_sessions_are_serialized() {
    let transport = MockTransport::loopback().with_latency(Duration::from_millis(20));
    let gateway = TestGateway::start(vec![("dev", 2000, None, transport.clone())]).await;

    let mut tasks = Vec::new();
    for client_id in 0..4 {
        let mut client = gateway.client().await;
        tasks.push(tokio::spawn(async move {
            client.attach("dev").await;
            for n in 0..3 {
                let command = format!("C{}-{}", client_id, n);
                assert_eq!(client.request(&command).await, command);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let executions = transport.executions();
    assert_eq!(executions.len(), 12);
    for pair in executions.windows(2) {
        let finished = pair[0].finished.expect("command did not finish");
        assert!(
            finished <= pair[1].started,
            "{} overlapped with {}",
            pair[0].command,
            pair[1].command
        );
    }

    // Each session's own commands keep their order
    for client_id in 0..4 {
        let prefix = format!("C{}-", client_id);
        let own: Vec<String> = transport
            .commands()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect();
        let expected: Vec<String> = (0..3).map(|n| format!("{}{}", prefix, n)).collect();
        assert_eq!(own, expected);
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_timeout_then_next_command_succeeds() {
    let transport = MockTransport::new();
    transport.push_reply(MockReply::Silent);
    transport.push_response("OK\n");
    let gateway = TestGateway::start(vec![("dev", 100, Some("\n"), transport.clone())]).await;

    let mut client = gateway.client().await;
    client.attach("dev").await;

    let start = Instant::now();
    assert_eq!(client.request("FIRST").await, "timeout");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "timed out late: {:?}", elapsed);

    assert_eq!(client.request("SECOND").await, "OK");
    assert_eq!(transport.commands(), vec!["FIRST", "SECOND"]);

    gateway.stop().await;
}

#[tokio::test]
async fn test_hex_mode_is_per_session() {
    let transport = MockTransport::new();
    transport.push_response(vec![0x0A, 0xFF]);
    transport.push_response("ok");
    let gateway = TestGateway::start(vec![("dev", 500, None, transport)]).await;

    let mut hex = gateway.client().await;
    hex.attach("dev").await;
    assert_eq!(hex.request("\\hex").await, "");
    assert_eq!(hex.request("READ").await, "0AFF");

    let mut ascii = gateway.client().await;
    ascii.attach("dev").await;
    assert_eq!(ascii.request("READ").await, "ok");

    gateway.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_mid_command() {
    let transport = MockTransport::loopback().with_latency(Duration::from_millis(300));
    let gateway = TestGateway::start(vec![("dev", 2000, None, transport.clone())]).await;

    let mut leaving = gateway.client().await;
    leaving.attach("dev").await;
    leaving.send_line("ABANDONED").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(leaving);

    let mut staying = gateway.client().await;
    staying.attach("dev").await;
    assert_eq!(staying.request("KEPT").await, "KEPT");
    assert_eq!(transport.commands(), vec!["ABANDONED", "KEPT"]);

    gateway.stop().await;
}

#[tokio::test]
async fn test_device_failure_is_reported_and_sticky() {
    let transport = MockTransport::new();
    transport.push_reply(MockReply::Fail("parity error".to_string()));
    transport.push_response("fine");
    transport.push_reply(MockReply::Disconnect);
    let gateway = TestGateway::start(vec![("dev", 500, None, transport.clone())]).await;

    let mut client = gateway.client().await;
    client.attach("dev").await;

    // Recoverable failure
    assert_eq!(client.request("A").await, "parity error");
    assert_eq!(client.request("B").await, "fine");

    // Fatal failure: every later command fails fast with the same message
    let lost = client.request("C").await;
    assert_eq!(lost, "device disconnected: connection lost");
    let start = Instant::now();
    assert_eq!(client.request("D").await, lost);
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(transport.commands(), vec!["A", "B", "C"]);

    gateway.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let transport = MockTransport::loopback();
    let gateway = TestGateway::start(vec![("dev", 500, None, transport.clone())]).await;
    let mut client = gateway.client().await;
    client.attach("dev").await;

    gateway.stop().await;
    assert_eq!(transport.close_count(), 1);

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(IO_TIMEOUT, client.reader.read(&mut buf))
        .await
        .expect("connection left open")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[test]
fn test_sample_configuration_is_valid() {
    let config = GatewayConfig::load_from(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/config/gateway.toml"
    ))
    .unwrap();
    assert_eq!(config.server.port, 8023);
    let ids: Vec<&str> = config.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["psu", "dmm", "echo"]);
}
