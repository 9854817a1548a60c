use crate::config::Config;
use crate::error::AppError;
use crate::tools::job_tool::{JobHandle, JobKind, JobRunner, JobTimeouts};
use crate::tools::process_tool::{CommandLauncher, OsLauncher};
use crate::tools::serial_tool::{
    MonitorSettings, PortConnector, PortEnumerator, PortInfo, SerialMonitor, SystemPorts,
};
use crate::tools::sink::{Sink, StopReason};
use crate::tools::toolchain_tool::{list_ports, JobOptions, Toolchain};
use crate::utils::line_ending_handler::{DisplayMode, LineEnding};
use crate::utils::preferences::Preferences;
use crate::utils::session_registry::{ActiveSession, SessionInfo, SessionKey, SessionRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const PREF_PORT: &str = "id_port";
pub const PREF_BAUD_RATE: &str = "baudrate";
pub const PREF_LINE_ENDING: &str = "line_ending";
pub const PREF_DISPLAY_MODE: &str = "display_mode";
pub const PREF_NETWORK_PORTS: &str = "network_ports";
pub const PREF_PROGRAMMER: &str = "programmer";
pub const PREF_AUTH: &str = "auth";

/// Monitor parameters from the editor; anything missing comes from
/// preferences.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorRequest {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub line_ending: Option<String>,
    pub display_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub port: String,
    pub running: bool,
    pub session_id: Option<String>,
    pub settings: Option<MonitorSettings>,
}

/// Everything the manager talks to, so tests can swap in fakes.
pub struct Backends {
    pub connector: Arc<dyn PortConnector>,
    pub ports: Arc<dyn PortEnumerator>,
    pub launcher: Arc<dyn CommandLauncher>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            connector: Arc::new(SystemPorts),
            ports: Arc::new(SystemPorts),
            launcher: Arc::new(OsLauncher),
        }
    }
}

/// Editor-facing entry point: one registry shared by monitors and jobs.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    monitor: SerialMonitor,
    jobs: JobRunner,
    toolchain: Toolchain,
    preferences: Arc<Preferences>,
    ports: Arc<dyn PortEnumerator>,
    sink: Arc<dyn Sink>,
    shutdown_bound: Duration,
}

impl SessionManager {
    pub fn new(config: &Config, sink: Arc<dyn Sink>) -> Self {
        let preferences = Preferences::open(&config.preferences_file).unwrap_or_else(|e| {
            warn!(path = %config.preferences_file.display(), error = %e, "Could not load preferences; using an in-memory store");
            Preferences::ephemeral()
        });
        Self::with_backends(config, Arc::new(preferences), Backends::default(), sink)
    }

    pub fn with_backends(
        config: &Config,
        preferences: Arc<Preferences>,
        backends: Backends,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let timeouts = JobTimeouts::from(config);
        Self {
            monitor: SerialMonitor::new(
                registry.clone(),
                backends.connector,
                config.serial_read_timeout,
            ),
            jobs: JobRunner::new(registry.clone(), backends.launcher, timeouts),
            registry,
            toolchain: Toolchain::from_config(config),
            preferences,
            ports: backends.ports,
            sink,
            shutdown_bound: timeouts.cancel_grace
                + timeouts.kill_timeout
                + timeouts.output_drain
                + Duration::from_secs(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn preferences(&self) -> &Arc<Preferences> {
        &self.preferences
    }

    fn resolve_port(&self, requested: Option<&str>) -> Result<String, AppError> {
        match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(port) => Ok(port.to_string()),
            None => {
                let saved: String = self.preferences.get(PREF_PORT, String::new());
                if saved.is_empty() {
                    Err(AppError::InvalidInput("No port selected".to_string()))
                } else {
                    Ok(saved)
                }
            }
        }
    }

    fn resolve_settings(&self, request: &MonitorRequest) -> Result<MonitorSettings, AppError> {
        let baud_rate = match request.baud_rate {
            Some(baud) => baud,
            None => self.preferences.get(PREF_BAUD_RATE, 9600u32),
        };
        if baud_rate == 0 {
            return Err(AppError::InvalidInput("Baud rate must be positive".to_string()));
        }
        let line_ending = match &request.line_ending {
            Some(raw) => raw.parse::<LineEnding>().map_err(AppError::InvalidInput)?,
            None => self
                .preferences
                .get(PREF_LINE_ENDING, "\n".to_string())
                .parse::<LineEnding>()
                .unwrap_or_default(),
        };
        let display_mode = match &request.display_mode {
            Some(raw) => raw.parse::<DisplayMode>().map_err(AppError::InvalidInput)?,
            None => self
                .preferences
                .get(PREF_DISPLAY_MODE, "Text".to_string())
                .parse::<DisplayMode>()
                .unwrap_or_default(),
        };
        Ok(MonitorSettings {
            baud_rate,
            line_ending,
            display_mode,
        })
    }

    #[instrument(skip(self))]
    pub fn start_monitor(&self, request: MonitorRequest) -> Result<MonitorStatus, AppError> {
        let port = self.resolve_port(request.port.as_deref())?;
        let settings = self.resolve_settings(&request)?;
        let session = self.monitor.start(&port, settings, self.sink.clone())?;
        if let Err(e) = self.preferences.set(PREF_PORT, &port) {
            warn!(error = %e, "Failed to remember monitor port");
        }
        Ok(MonitorStatus {
            port,
            running: true,
            session_id: Some(session.id().to_string()),
            settings: Some(settings),
        })
    }

    #[instrument(skip(self))]
    pub fn stop_monitor(&self, port: Option<&str>) -> Result<MonitorStatus, AppError> {
        let port = self.resolve_port(port)?;
        self.monitor.stop(&port)?;
        Ok(self.monitor_state(Some(&port)))
    }

    /// Stops a running monitor, otherwise starts one.
    pub fn toggle_monitor(&self, request: MonitorRequest) -> Result<MonitorStatus, AppError> {
        let port = self.resolve_port(request.port.as_deref())?;
        if self.monitor.is_running(&port) {
            self.stop_monitor(Some(&port))
        } else {
            self.start_monitor(MonitorRequest {
                port: Some(port),
                ..request
            })
        }
    }

    pub fn close_monitor_view(&self, port: &str) -> bool {
        self.monitor.close_view(port)
    }

    pub fn send_serial(&self, port: Option<&str>, text: &str) -> Result<(), AppError> {
        let port = self.resolve_port(port)?;
        self.monitor.send(&port, text)
    }

    /// Without a port this reports on the remembered one; a manager with no
    /// remembered port reports an empty, stopped status.
    pub fn monitor_state(&self, port: Option<&str>) -> MonitorStatus {
        let port = self.resolve_port(port).unwrap_or_default();
        match self.monitor.session(&port) {
            Some(session) if session.is_running() => MonitorStatus {
                running: true,
                session_id: Some(session.id().to_string()),
                settings: Some(session.settings()),
                port,
            },
            _ => MonitorStatus {
                port,
                running: false,
                session_id: None,
                settings: None,
            },
        }
    }

    /// Saved string preference; unset, empty and non-string values (the
    /// editor stores `false` for "none") all read as `None`.
    fn saved_string(&self, key: &str) -> Option<String> {
        self.preferences
            .get_raw(key)
            .and_then(|v| v.as_str().map(str::trim).map(str::to_string))
            .filter(|v| !v.is_empty())
    }

    /// Starts a toolchain job. Uploads take port, programmer and password
    /// from preferences when not given, and release a monitor holding the
    /// upload port once the upload is sure to launch.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn run_job(&self, kind: JobKind, mut options: JobOptions) -> Result<JobHandle, AppError> {
        if kind == JobKind::Upload {
            fill_from(&mut options.upload_port, || self.saved_string(PREF_PORT));
            fill_from(&mut options.programmer, || self.saved_string(PREF_PROGRAMMER));
            fill_from(&mut options.auth, || self.saved_string(PREF_AUTH));
        }

        let command = self.toolchain.command(kind, &options)?;
        let target = options
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(SessionKey::from)
            .unwrap_or_else(|| kind.default_slot());
        // A rejected upload must leave the monitor alone.
        if self.registry.is_active(&target) {
            return Err(AppError::AlreadyActive(target.to_string()));
        }

        if kind == JobKind::Upload {
            if let Some(port) = options.upload_port.as_deref() {
                self.release_port_for_upload(port).await;
            }
        }
        self.jobs.run(kind, target, command, self.sink.clone())
    }

    async fn release_port_for_upload(&self, port: &str) {
        let Some(session) = self.monitor.session(port) else {
            return;
        };
        if session.stop_with(StopReason::Requested) {
            info!(port = %port, "Stopped serial monitor to free the port for upload");
        }
        // The reader half keeps the device open until its thread exits.
        let joined = tokio::task::spawn_blocking(move || session.join()).await;
        if let Err(e) = joined {
            warn!(port = %port, error = %e, "Waiting for the serial reader failed");
        }
    }

    pub fn cancel_job(&self, target: &str) -> Result<(), AppError> {
        self.jobs.cancel(&SessionKey::from(target))
    }

    pub fn job(&self, target: &str) -> Option<JobHandle> {
        self.jobs.lookup(&SessionKey::from(target))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// Blocks on OS enumeration; async callers should use `spawn_blocking`.
    pub fn list_ports(&self) -> Vec<PortInfo> {
        let network: Vec<String> = self.preferences.get(PREF_NETWORK_PORTS, Vec::new());
        list_ports(self.ports.as_ref(), &network)
    }

    pub fn get_preference(&self, key: &str) -> Option<Value> {
        self.preferences.get_raw(key)
    }

    pub fn set_preference(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.preferences.set(key, value)
    }

    /// Stops every monitor and cancels every job, waiting for each to
    /// finish within the cancellation bound.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let sessions = self.registry.active_sessions();
        info!(count = sessions.len(), "Shutting down sessions");

        let mut jobs = Vec::new();
        let mut monitors = Vec::new();
        for (key, session) in sessions {
            match session {
                ActiveSession::Serial(serial) => {
                    serial.stop();
                    monitors.push(serial);
                }
                ActiveSession::Job(job) => {
                    if let Err(e) = job.cancel() {
                        debug!(job = %key, error = %e, "Job finished before cancellation");
                    }
                    jobs.push(job);
                }
            }
        }

        for job in jobs {
            if tokio::time::timeout(self.shutdown_bound, job.wait()).await.is_err() {
                warn!(job = %job.key(), "Job did not finish within the cancellation bound");
            }
        }
        for serial in monitors {
            let key = serial.key().clone();
            if let Err(e) = tokio::task::spawn_blocking(move || serial.join()).await {
                warn!(port = %key, error = %e, "Waiting for the serial reader failed");
            }
        }
    }
}

fn fill_from(slot: &mut Option<String>, saved: impl FnOnce() -> Option<String>) {
    if slot.as_deref().map_or(true, |v| v.trim().is_empty()) {
        if let Some(value) = saved() {
            *slot = Some(value);
        }
    }
}
