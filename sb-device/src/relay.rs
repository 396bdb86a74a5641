use std::{
    collections::HashSet,
    io::{self, Read, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_BAUD: u32 = 9_600;

// The read timeout doubles as the shutdown poll interval for the blocking
// reader, so it must stay short.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK_BYTES: usize = 512;
const PORT_EVENT_BUFFER: usize = 256;
const PORT_COMMAND_BUFFER: usize = 64;

#[derive(Debug)]
pub struct RelayRegistry {
    held: Mutex<HashSet<String>>,
}

pub type SharedRelayRegistry = Arc<RelayRegistry>;

pub fn new_relay_registry() -> SharedRelayRegistry {
    Arc::new(RelayRegistry {
        held: Mutex::new(HashSet::new()),
    })
}

impl RelayRegistry {
    // Exclusive ownership: one claim per port name, held for the whole
    // session. Concurrent claimants get PortBusy, never a shared handle.
    pub fn claim(self: &Arc<Self>, port: &str) -> Result<PortClaim, RelayError> {
        let mut guard = self.held.lock().expect("relay registry lock poisoned");
        if !guard.insert(port.to_string()) {
            return Err(RelayError::PortBusy(port.to_string()));
        }
        Ok(PortClaim {
            registry: Arc::clone(self),
            port: port.to_string(),
        })
    }

    pub fn is_held(&self, port: &str) -> bool {
        let guard = self.held.lock().expect("relay registry lock poisoned");
        guard.contains(port)
    }

    pub fn held_count(&self) -> usize {
        let guard = self.held.lock().expect("relay registry lock poisoned");
        guard.len()
    }
}

#[derive(Debug)]
pub struct PortClaim {
    registry: SharedRelayRegistry,
    port: String,
}

impl PortClaim {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut guard = self
            .registry
            .held
            .lock()
            .expect("relay registry lock poisoned");
        guard.remove(&self.port);
    }
}

#[derive(Debug)]
pub enum RelayError {
    PortBusy(String),
    PortNotFound(String),
    Open { port: String, message: String },
    InvalidBaud(u32),
    SessionClosed,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::PortBusy(port) => {
                write!(f, "port {port} is already held by another session")
            }
            RelayError::PortNotFound(port) => write!(f, "port {port} does not exist"),
            RelayError::Open { port, message } => {
                write!(f, "failed to open port {port}: {message}")
            }
            RelayError::InvalidBaud(baud) => write!(f, "invalid baud rate: {baud}"),
            RelayError::SessionClosed => write!(f, "relay session is closed"),
        }
    }
}

impl std::error::Error for RelayError {}

// Wire envelope for the serial WebSocket. Client text frames carry tagged
// commands, client binary frames pass through to the port verbatim; server
// text frames carry tagged session events, server binary frames are raw
// device bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Send { data: String },
    SetBaud { baud: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Opened {
        session_id: String,
        port: String,
        baud: u32,
    },
    Baud {
        baud: u32,
    },
    Error {
        message: String,
    },
    Closed {
        dropped_chunks: u64,
    },
}

#[derive(Debug)]
pub enum RelayEvent {
    Data(Vec<u8>),
    Fault(String),
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub port: String,
    pub baud: u32,
}

enum PortCommand {
    Write(Vec<u8>),
    SetBaud(u32),
}

#[derive(Debug)]
pub struct RelaySession {
    session_id: Uuid,
    port_name: String,
    baud: u32,
    commands: mpsc::Sender<PortCommand>,
    events: mpsc::Receiver<RelayEvent>,
    shutdown: Arc<AtomicBool>,
    dropped_chunks: Arc<AtomicU64>,
}

impl RelaySession {
    pub async fn open(
        registry: &SharedRelayRegistry,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        if config.baud == 0 {
            return Err(RelayError::InvalidBaud(config.baud));
        }

        let claim = registry.claim(&config.port)?;
        let port_name = config.port.clone();
        let baud = config.baud;

        let opened = tokio::task::spawn_blocking(move || {
            let mut builder =
                serialport::new(config.port, config.baud).timeout(READ_POLL_INTERVAL);
            #[cfg(unix)]
            {
                // Some USB serial adapters need the frame settings spelled out.
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            builder.open()
        })
        .await;

        let port = match opened {
            Ok(Ok(port)) => port,
            Ok(Err(err)) => {
                drop(claim);
                return Err(map_open_error(&port_name, err));
            }
            Err(err) => {
                drop(claim);
                return Err(RelayError::Open {
                    port: port_name,
                    message: format!("open task failed: {err}"),
                });
            }
        };

        let writer_port = match port.try_clone() {
            Ok(handle) => handle,
            Err(err) => {
                drop(claim);
                return Err(RelayError::Open {
                    port: port_name,
                    message: format!("failed to clone port handle: {err}"),
                });
            }
        };

        let session_id = Uuid::new_v4();
        let shutdown = Arc::new(AtomicBool::new(false));
        let dropped_chunks = Arc::new(AtomicU64::new(0));
        let (event_tx, event_rx) = mpsc::channel(PORT_EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(PORT_COMMAND_BUFFER);

        // Both pumps keep a clone of the claim, so the port name is released
        // only after the last pump has wound down; a disconnect cannot leak
        // the port.
        let claim = Arc::new(claim);

        {
            let events = event_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            let dropped = Arc::clone(&dropped_chunks);
            let claim = Arc::clone(&claim);
            tokio::task::spawn_blocking(move || {
                run_reader(port, events, shutdown, dropped);
                drop(claim);
            });
        }
        {
            let shutdown = Arc::clone(&shutdown);
            tokio::task::spawn_blocking(move || {
                run_writer(writer_port, command_rx, event_tx, shutdown);
                drop(claim);
            });
        }

        info!(
            session_id = %session_id,
            port = %port_name,
            baud,
            "serial relay session opened"
        );

        Ok(Self {
            session_id,
            port_name,
            baud,
            commands: command_tx,
            events: event_rx,
            shutdown,
            dropped_chunks,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    // Bounded and awaited: client-originated writes back-pressure the
    // caller instead of being dropped.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), RelayError> {
        self.commands
            .send(PortCommand::Write(bytes))
            .await
            .map_err(|_| RelayError::SessionClosed)
    }

    pub async fn set_baud(&self, baud: u32) -> Result<(), RelayError> {
        if baud == 0 {
            return Err(RelayError::InvalidBaud(baud));
        }
        self.commands
            .send(PortCommand::SetBaud(baud))
            .await
            .map_err(|_| RelayError::SessionClosed)
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        info!(
            session_id = %self.session_id,
            port = %self.port_name,
            dropped_chunks = self.dropped_chunks(),
            "serial relay session closed"
        );
    }
}

fn map_open_error(port: &str, err: serialport::Error) -> RelayError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => RelayError::PortNotFound(port.to_string()),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            RelayError::PortNotFound(port.to_string())
        }
        _ => RelayError::Open {
            port: port.to_string(),
            message: err.to_string(),
        },
    }
}

// port -> client. A stalled consumer never back-pressures the device: when
// the event buffer is full the fresh chunk is dropped and counted.
fn run_reader(
    mut port: Box<dyn serialport::SerialPort>,
    events: mpsc::Sender<RelayEvent>,
    shutdown: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(read) => match events.try_send(RelayEvent::Data(buf[..read].to_vec())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                warn!("serial read failed: {err}");
                let _ = events.blocking_send(RelayEvent::Fault(format!(
                    "serial read failed: {err}"
                )));
                break;
            }
        }
    }
}

// client -> port. Exits when the session drops its command sender.
fn run_writer(
    mut port: Box<dyn serialport::SerialPort>,
    mut commands: mpsc::Receiver<PortCommand>,
    events: mpsc::Sender<RelayEvent>,
    shutdown: Arc<AtomicBool>,
) {
    while let Some(command) = commands.blocking_recv() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let outcome = match command {
            PortCommand::Write(bytes) => port
                .write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|err| format!("serial write failed: {err}")),
            PortCommand::SetBaud(baud) => port
                .set_baud_rate(baud)
                .map_err(|err| format!("baud change failed: {err}")),
        };
        if let Err(message) = outcome {
            warn!("{message}");
            let _ = events.blocking_send(RelayEvent::Fault(message));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_held_port_is_busy() {
        let registry = new_relay_registry();
        let claim = registry.claim("/dev/ttyUSB0").expect("first claim");
        let err = registry
            .claim("/dev/ttyUSB0")
            .expect_err("second claim must conflict");
        assert!(matches!(err, RelayError::PortBusy(_)));
        drop(claim);
        assert!(!registry.is_held("/dev/ttyUSB0"));
    }

    #[test]
    fn released_port_can_be_claimed_again() {
        let registry = new_relay_registry();
        drop(registry.claim("/dev/ttyACM3").expect("first claim"));
        registry.claim("/dev/ttyACM3").expect("reclaim after release");
    }

    #[test]
    fn claims_on_distinct_ports_are_independent() {
        let registry = new_relay_registry();
        let _first = registry.claim("/dev/ttyUSB0").expect("first port");
        let _second = registry.claim("/dev/ttyUSB1").expect("second port");
        assert!(registry.is_held("/dev/ttyUSB0"));
        assert!(registry.is_held("/dev/ttyUSB1"));
    }

    #[tokio::test]
    async fn failed_open_releases_claim_immediately() {
        let registry = new_relay_registry();
        let config = RelayConfig {
            port: "/dev/sketchbench-no-such-port".to_string(),
            baud: DEFAULT_BAUD,
        };
        let err = RelaySession::open(&registry, config.clone())
            .await
            .expect_err("open on a missing device must fail");
        assert!(matches!(
            err,
            RelayError::PortNotFound(_) | RelayError::Open { .. }
        ));
        // The failed attempt must not leave the port marked held.
        assert!(!registry.is_held(&config.port));
        registry
            .claim(&config.port)
            .expect("claim after failed open");
    }

    #[tokio::test]
    async fn zero_baud_is_rejected_before_claiming() {
        let registry = new_relay_registry();
        let err = RelaySession::open(
            &registry,
            RelayConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud: 0,
            },
        )
        .await
        .expect_err("zero baud is invalid");
        assert!(matches!(err, RelayError::InvalidBaud(0)));
        assert!(!registry.is_held("/dev/ttyUSB0"));
    }

    #[test]
    fn client_envelope_wire_format() {
        let send: ClientEnvelope =
            serde_json::from_str(r#"{"type":"send","data":"ping"}"#).expect("send decodes");
        assert!(matches!(send, ClientEnvelope::Send { ref data } if data == "ping"));

        let baud: ClientEnvelope =
            serde_json::from_str(r#"{"type":"set_baud","baud":115200}"#).expect("baud decodes");
        assert!(matches!(baud, ClientEnvelope::SetBaud { baud: 115_200 }));
    }

    #[test]
    fn server_envelope_wire_format() {
        let opened = ServerEnvelope::Opened {
            session_id: "s-1".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            baud: 9_600,
        };
        let encoded = serde_json::to_string(&opened).expect("opened encodes");
        assert_eq!(
            encoded,
            r#"{"type":"opened","session_id":"s-1","port":"/dev/ttyUSB0","baud":9600}"#
        );

        let closed = serde_json::to_string(&ServerEnvelope::Closed { dropped_chunks: 3 })
            .expect("closed encodes");
        assert_eq!(closed, r#"{"type":"closed","dropped_chunks":3}"#);
    }
}
