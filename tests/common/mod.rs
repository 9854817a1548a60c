#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use toolchain_session_host::config::Config;
use toolchain_session_host::tools::process_tool::{
    ChildProcess, CommandLauncher, CommandSpec, LaunchedProcess, OutputStream,
};
use toolchain_session_host::tools::serial_tool::{
    LinkWriter, PortConnector, PortEnumerator, PortInfo, SerialLink,
};
use toolchain_session_host::tools::sink::{BufferSink, EventKind, SessionEvent};

/// Config with short timeouts, rooted in a fresh project directory.
pub fn test_config(project: &Path) -> Config {
    Config {
        project_root: project.to_path_buf(),
        toolchain_bin: Some("pio".into()),
        preferences_file: project.join(".state").join("preferences.json"),
        audit_log_file: project.join(".state").join("commands.log"),
        serial_read_timeout: Duration::from_millis(10),
        cancel_grace: Duration::from_millis(100),
        kill_timeout: Duration::from_millis(100),
        output_drain: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Temporary directory holding a minimal project manifest.
pub fn create_project() -> TempDir {
    let dir = TempDir::new().expect("create temp dir");
    std::fs::write(dir.path().join("platformio.ini"), "[env:uno]\nplatform = atmelavr\n")
        .expect("write manifest");
    dir
}

/// Wait with timeout for a condition
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub async fn wait_for_async<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn kinds(events: &[SessionEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind.clone()).collect()
}

pub fn kinds_for(sink: &BufferSink, session_id: &str) -> Vec<EventKind> {
    sink.snapshot()
        .into_iter()
        .filter(|e| e.session_id == session_id)
        .map(|e| e.kind)
        .collect()
}

pub fn data_lines(events: &[EventKind]) -> Vec<String> {
    events
        .iter()
        .filter_map(|k| match k {
            EventKind::DataLine(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory serial devices
// ---------------------------------------------------------------------------

enum Chunk {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
}

/// Test side of one opened port.
#[derive(Clone)]
pub struct MockDevice {
    tx: Arc<Mutex<Option<mpsc::Sender<Chunk>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    broken_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockDevice {
    fn send(&self, chunk: Chunk) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(chunk);
        }
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.send(Chunk::Data(bytes.to_vec()));
    }

    /// The next read fails with `kind`.
    pub fn fail_read(&self, kind: io::ErrorKind) {
        self.send(Chunk::Fail(kind));
    }

    /// The device disappears; reads return end of stream.
    pub fn unplug(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn break_writes(&self) {
        self.broken_writes.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn writer_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockReader {
    rx: mpsc::Receiver<Chunk>,
    timeout: Duration,
    pending: Vec<u8>,
    /// Ports held open by live read halves, shared with the connector.
    held: Arc<Mutex<HashSet<String>>>,
    port: String,
}

impl Drop for MockReader {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.port);
    }
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(Chunk::Data(bytes)) => self.pending = bytes,
                Ok(Chunk::Fail(kind)) => return Err(io::Error::new(kind, "mock read failure")),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MockWriter {
    written: Arc<Mutex<Vec<u8>>>,
    broken: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkWriter for MockWriter {
    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out in-memory links; ports can be marked busy.
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
    unavailable: Mutex<HashSet<String>>,
    opens: Mutex<Vec<(String, u32)>>,
    exclusive: AtomicBool,
    held: Arc<Mutex<HashSet<String>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse to open a port while an earlier read half is still alive,
    /// like an OS serial port opened for exclusive access.
    pub fn exclusive() -> Arc<Self> {
        let connector = Self::default();
        connector.exclusive.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn make_unavailable(&self, port: &str) {
        self.unavailable.lock().unwrap().insert(port.to_string());
    }

    /// Device behind the most recent open of `port`.
    pub fn device(&self, port: &str) -> MockDevice {
        self.devices
            .lock()
            .unwrap()
            .get(port)
            .cloned()
            .unwrap_or_else(|| panic!("{} was never opened", port))
    }

    pub fn opens(&self) -> Vec<(String, u32)> {
        self.opens.lock().unwrap().clone()
    }
}

impl PortConnector for MockConnector {
    fn open(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<SerialLink> {
        if self.unavailable.lock().unwrap().contains(port) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "port busy"));
        }
        {
            let mut held = self.held.lock().unwrap();
            if !held.insert(port.to_string()) && self.exclusive.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "device or resource busy"));
            }
        }
        self.opens.lock().unwrap().push((port.to_string(), baud_rate));

        let (tx, rx) = mpsc::channel();
        let device = MockDevice {
            tx: Arc::new(Mutex::new(Some(tx))),
            written: Arc::default(),
            broken_writes: Arc::default(),
            closed: Arc::default(),
        };
        let writer = MockWriter {
            written: device.written.clone(),
            broken: device.broken_writes.clone(),
            closed: device.closed.clone(),
        };
        self.devices.lock().unwrap().insert(port.to_string(), device);
        Ok(SerialLink {
            reader: Box::new(MockReader {
                rx,
                timeout: read_timeout,
                pending: Vec::new(),
                held: self.held.clone(),
                port: port.to_string(),
            }),
            writer: Box::new(writer),
        })
    }
}

pub struct FixedPorts(pub Vec<PortInfo>);

impl PortEnumerator for FixedPorts {
    fn available_ports(&self) -> io::Result<Vec<PortInfo>> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Scripted processes
// ---------------------------------------------------------------------------

/// What a fake process prints and how it reacts to signals.
#[derive(Debug, Clone)]
pub struct Script {
    pub stdout: Vec<&'static str>,
    pub stderr: Vec<&'static str>,
    pub exit_code: Option<i32>,
    pub run_for: Duration,
    pub ignore_terminate: bool,
    pub ignore_kill: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(0),
            run_for: Duration::ZERO,
            ignore_terminate: false,
            ignore_kill: false,
        }
    }
}

impl Script {
    pub fn exits(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Runs until signalled.
    pub fn long_running() -> Self {
        Self {
            run_for: Duration::from_secs(3600),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Life {
    Alive,
    Dead,
}

struct ScriptedChild {
    script: Script,
    started: tokio::time::Instant,
    life: watch::Sender<Life>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

#[async_trait]
impl ChildProcess for ScriptedChild {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signals.lock().unwrap().push(Signal::Terminate);
        if !self.script.ignore_terminate {
            self.life.send_replace(Life::Dead);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signals.lock().unwrap().push(Signal::Kill);
        if !self.script.ignore_kill {
            self.life.send_replace(Life::Dead);
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let deadline = self.started + self.script.run_for;
        let mut rx = self.life.subscribe();
        if *rx.borrow_and_update() == Life::Dead {
            return Ok(None);
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(self.script.exit_code),
            _ = rx.wait_for(|life| *life == Life::Dead) => Ok(None),
        }
    }
}

fn stream(lines: &[&str]) -> OutputStream {
    let mut bytes = Vec::new();
    for line in lines {
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    Box::pin(std::io::Cursor::new(bytes))
}

/// Launches scripted children and records every command it was asked for.
#[derive(Default)]
pub struct ScriptedLauncher {
    script: Mutex<Script>,
    fail_launch: AtomicBool,
    launched: Mutex<Vec<CommandSpec>>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn fail_launches(&self) {
        self.fail_launch.store(true, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<CommandSpec> {
        self.launched.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

impl CommandLauncher for ScriptedLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<LaunchedProcess> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        self.launched.lock().unwrap().push(spec.clone());
        let script = self.script.lock().unwrap().clone();
        let (life, _) = watch::channel(Life::Alive);
        Ok(LaunchedProcess {
            stdout: Some(stream(&script.stdout)),
            stderr: Some(stream(&script.stderr)),
            child: Box::new(ScriptedChild {
                script,
                started: tokio::time::Instant::now(),
                life,
                signals: self.signals.clone(),
            }),
        })
    }
}
