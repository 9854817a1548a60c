use crate::error::AppError;
use crate::tools::sink::{Emitter, EventKind, Sink, StopReason};
use crate::utils::line_ending_handler::{
    normalize_line_endings, DisplayMode, LineDecoder, LineEnding,
};
use crate::utils::session_registry::{ActiveSession, SessionKey, SessionRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const NETWORK_PREFIX: &str = "socket://";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a link. `close` should make the peer read half return
/// promptly where the transport allows it.
pub trait LinkWriter: Write + Send {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// An open connection split into independently owned halves.
pub struct SerialLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn LinkWriter>,
}

pub trait PortConnector: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<SerialLink>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: &'static str,
    pub description: Option<String>,
}

pub trait PortEnumerator: Send + Sync {
    fn available_ports(&self) -> io::Result<Vec<PortInfo>>;
}

/// OS serial ports through `serialport`, network ports through TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

struct PortHalf(Box<dyn serialport::SerialPort>);

impl Read for PortHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl LinkWriter for PortHalf {}

impl LinkWriter for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        // Shuts down both clones, so the reader sees EOF right away.
        self.shutdown(Shutdown::Both)
    }
}

impl PortConnector for SystemPorts {
    fn open(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<SerialLink> {
        if let Some(address) = port.strip_prefix(NETWORK_PREFIX) {
            let socket_addr = address.to_socket_addrs()?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("Unresolvable address: {}", address))
            })?;
            let stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)?;
            stream.set_read_timeout(Some(read_timeout))?;
            let writer = stream.try_clone()?;
            return Ok(SerialLink {
                reader: Box::new(stream),
                writer: Box::new(writer),
            });
        }

        let handle = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::from)?;
        let writer = handle.try_clone().map_err(io::Error::from)?;
        Ok(SerialLink {
            reader: Box::new(PortHalf(handle)),
            writer: Box::new(PortHalf(writer)),
        })
    }
}

impl PortEnumerator for SystemPorts {
    fn available_ports(&self) -> io::Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let (kind, description) = match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => (
                        "usb",
                        Some(match (usb.manufacturer, usb.product) {
                            (Some(m), Some(p)) => format!("{} {}", m, p),
                            (Some(m), None) => m,
                            (None, Some(p)) => p,
                            (None, None) => format!("{:04x}:{:04x}", usb.vid, usb.pid),
                        }),
                    ),
                    serialport::SerialPortType::PciPort => ("pci", None),
                    serialport::SerialPortType::BluetoothPort => ("bluetooth", None),
                    serialport::SerialPortType::Unknown => ("unknown", None),
                };
                PortInfo {
                    name: port.port_name,
                    kind,
                    description,
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub baud_rate: u32,
    pub line_ending: LineEnding,
    pub display_mode: DisplayMode,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            line_ending: LineEnding::Lf,
            display_mode: DisplayMode::Text,
        }
    }
}

/// One monitored port. The reader thread and the lifecycle methods share
/// it; the running flag decides which of them performs cleanup.
pub struct SerialSession {
    id: String,
    key: SessionKey,
    settings: MonitorSettings,
    running: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
    writer: Mutex<Option<Box<dyn LinkWriter>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<SessionRegistry>,
    start_time: Instant,
    start_time_system: SystemTime,
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SerialSession {
    fn new(key: SessionKey, settings: MonitorSettings, registry: Arc<SessionRegistry>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            settings,
            running: AtomicBool::new(true),
            stop_reason: Mutex::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            registry,
            start_time: Instant::now(),
            start_time_system: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn started(&self) -> (Instant, SystemTime) {
        (self.start_time, self.start_time_system)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Writes `text` followed by the session's line ending.
    pub fn send(&self, text: &str) -> Result<(), AppError> {
        let mut payload = normalize_line_endings(text, self.settings.line_ending);
        payload.push_str(self.settings.line_ending.as_str());
        self.send_raw(payload.as_bytes())
    }

    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), AppError> {
        if !self.is_running() {
            return Err(AppError::NotRunning(self.key.to_string()));
        }
        let result = {
            let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let writer = guard
                .as_mut()
                .ok_or_else(|| AppError::NotRunning(self.key.to_string()))?;
            writer.write_all(bytes).and_then(|_| writer.flush())
        };
        match result {
            Ok(()) => {
                debug!(port = %self.key, bytes = bytes.len(), "Sent data");
                Ok(())
            }
            Err(e) => {
                warn!(port = %self.key, error = %e, "Write failed; stopping monitor");
                self.stop_with(StopReason::IoError(e.to_string()));
                Err(AppError::Io(e))
            }
        }
    }

    pub fn stop(&self) {
        self.stop_with(StopReason::Requested);
    }

    /// Returns whether this call performed the stop. Only the first caller
    /// closes the writer and releases the registry entry.
    pub fn stop_with(&self, reason: StopReason) -> bool {
        {
            let mut slot = self.stop_reason.lock().unwrap_or_else(|e| e.into_inner());
            if !self.running.swap(false, Ordering::SeqCst) {
                return false;
            }
            *slot = Some(reason.clone());
        }

        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close() {
                debug!(port = %self.key, error = %e, "Closing link returned an error");
            }
        }
        self.registry.release(&self.key, &self.id);
        info!(port = %self.key, sid = %self.id, reason = ?reason, "Serial monitor stopped");
        true
    }

    /// Blocks until the reader thread exited. Not for use on the reader
    /// thread itself.
    pub fn join(&self) {
        let handle = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(port = %self.key, "Serial reader thread panicked");
            }
        }
    }

    fn attach_writer(&self, writer: Box<dyn LinkWriter>) {
        let mut slot = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_running() {
            *slot = Some(writer);
        }
    }
}

fn is_idle_error(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn read_loop(session: Arc<SerialSession>, mut reader: Box<dyn Read + Send>, emitter: Emitter) {
    let mut decoder = LineDecoder::new(session.settings.line_ending, session.settings.display_mode);
    let mut buf = [0u8; 1024];

    let failure = loop {
        if !session.is_running() {
            break None;
        }
        match reader.read(&mut buf) {
            Ok(0) => break Some(StopReason::PortClosed),
            Ok(n) => {
                for line in decoder.push(&buf[..n]) {
                    emitter.emit(EventKind::DataLine(line));
                }
            }
            Err(e) if is_idle_error(e.kind()) => continue,
            Err(e) => break Some(StopReason::IoError(e.to_string())),
        }
    };
    drop(reader);

    if let Some(line) = decoder.flush() {
        emitter.emit(EventKind::DataLine(line));
    }
    if let Some(reason) = failure {
        if session.stop_with(reason.clone()) {
            warn!(port = %session.key, reason = ?reason, "Serial monitor ended by the port");
        }
    }
    let reason = session.stop_reason().unwrap_or(StopReason::Requested);
    emitter.emit(EventKind::Stopped(reason));
}

/// Starts and tracks serial monitors, one per port.
pub struct SerialMonitor {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn PortConnector>,
    read_timeout: Duration,
    /// Last session started per port. A stopped session keeps its read half
    /// open until the reader thread exits, and ports are opened exclusively.
    previous: Mutex<HashMap<SessionKey, Arc<SerialSession>>>,
}

impl fmt::Debug for SerialMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialMonitor")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl SerialMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn PortConnector>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connector,
            read_timeout,
            previous: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, sink), fields(baud = settings.baud_rate))]
    pub fn start(
        &self,
        port: &str,
        settings: MonitorSettings,
        sink: Arc<dyn Sink>,
    ) -> Result<Arc<SerialSession>, AppError> {
        let key = SessionKey::from(port);
        let session = Arc::new(SerialSession::new(key.clone(), settings, self.registry.clone()));
        self.registry
            .register(key.clone(), ActiveSession::Serial(session.clone()))?;

        let previous = self
            .previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if let Some(previous) = previous {
            // Registration succeeded, so the old session is stopped; its
            // reader exits within one read timeout.
            previous.join();
        }

        let link = match self.connector.open(port, settings.baud_rate, self.read_timeout) {
            Ok(link) => link,
            Err(source) => {
                warn!(error = %source, "Failed to open port");
                session.running.store(false, Ordering::SeqCst);
                self.registry.release(&key, session.id());
                return Err(AppError::PortUnavailable {
                    port: port.to_string(),
                    source,
                });
            }
        };
        session.attach_writer(link.writer);

        let emitter = Emitter::new(key.clone(), session.id(), sink);
        emitter.emit(EventKind::Started);

        let thread_session = session.clone();
        let spawn_failed = emitter.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("serial-{}", port))
            .spawn(move || read_loop(thread_session, link.reader, emitter));
        match spawned {
            Ok(handle) => {
                *session.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn serial reader thread");
                let reason = StopReason::IoError(e.to_string());
                session.stop_with(reason.clone());
                // No reader thread exists to report the stop.
                spawn_failed.emit(EventKind::Stopped(reason));
                return Err(AppError::Io(e));
            }
        }
        self.previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, session.clone());

        info!(sid = %session.id(), "Serial monitor started");
        Ok(session)
    }

    pub fn session(&self, port: &str) -> Option<Arc<SerialSession>> {
        match self.registry.lookup(&SessionKey::from(port)) {
            Some(ActiveSession::Serial(session)) => Some(session),
            _ => None,
        }
    }

    pub fn is_running(&self, port: &str) -> bool {
        self.session(port).is_some_and(|s| s.is_running())
    }

    pub fn stop(&self, port: &str) -> Result<(), AppError> {
        self.stop_with(port, StopReason::Requested)
    }

    /// The output view for `port` went away. Safe to call any number of
    /// times; only a live session is stopped.
    pub fn close_view(&self, port: &str) -> bool {
        self.stop_with(port, StopReason::ViewClosed).is_ok()
    }

    fn stop_with(&self, port: &str, reason: StopReason) -> Result<(), AppError> {
        match self.session(port) {
            Some(session) if session.is_running() => {
                session.stop_with(reason);
                Ok(())
            }
            _ => Err(AppError::NotRunning(port.to_string())),
        }
    }

    pub fn send(&self, port: &str, text: &str) -> Result<(), AppError> {
        self.session(port)
            .ok_or_else(|| AppError::NotRunning(port.to_string()))?
            .send(text)
    }
}
