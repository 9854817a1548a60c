use crate::config::Config;
use crate::error::AppError;
use crate::tools::process_tool::{
    terminate_with_escalation, CommandLauncher, CommandSpec, LaunchedProcess, OutputStream,
    Termination,
};
use crate::tools::sink::{Emitter, EventKind, JobExit, Sink};
use crate::utils::session_registry::{ActiveSession, SessionKey, SessionRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Upload,
    Clean,
    ListPorts,
    LibrarySearch,
    LibraryInstall,
    LibraryUninstall,
    LibraryList,
    /// Updates the toolchain itself.
    Upgrade,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Upload => "upload",
            JobKind::Clean => "clean",
            JobKind::ListPorts => "list_ports",
            JobKind::LibrarySearch => "library_search",
            JobKind::LibraryInstall => "library_install",
            JobKind::LibraryUninstall => "library_uninstall",
            JobKind::LibraryList => "library_list",
            JobKind::Upgrade => "upgrade",
        }
    }

    /// Registry slot used when the caller does not name one. Jobs that touch
    /// the project's build artifacts share a slot so they never overlap.
    pub fn default_slot(&self) -> SessionKey {
        match self {
            JobKind::Build | JobKind::Upload | JobKind::Clean => SessionKey::from("project"),
            JobKind::ListPorts => SessionKey::from("list_ports"),
            JobKind::LibrarySearch
            | JobKind::LibraryInstall
            | JobKind::LibraryUninstall
            | JobKind::LibraryList => SessionKey::from("library"),
            JobKind::Upgrade => SessionKey::from("toolchain"),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(JobKind::Build),
            "upload" => Ok(JobKind::Upload),
            "clean" => Ok(JobKind::Clean),
            "list_ports" => Ok(JobKind::ListPorts),
            "library_search" => Ok(JobKind::LibrarySearch),
            "library_install" => Ok(JobKind::LibraryInstall),
            "library_uninstall" => Ok(JobKind::LibraryUninstall),
            "library_list" => Ok(JobKind::LibraryList),
            "upgrade" => Ok(JobKind::Upgrade),
            other => Err(AppError::InvalidInput(format!("Unknown job kind: {}", other))),
        }
    }
}

/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
struct JobShared {
    id: String,
    kind: JobKind,
    key: SessionKey,
    command: String,
    state: watch::Sender<JobState>,
    cancel: watch::Sender<bool>,
    exit: Mutex<Option<JobExit>>,
    pid: Mutex<Option<u32>>,
    start_time: Instant,
    start_time_system: SystemTime,
}

/// Shared view of one job. Cloning is cheap; all clones observe the same job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    inner: Arc<JobShared>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub session_id: String,
    pub key: SessionKey,
    pub kind: JobKind,
    pub exit: JobExit,
}

impl JobReport {
    pub fn into_result(self) -> Result<Option<i32>, AppError> {
        match self.exit.state {
            JobState::Succeeded => Ok(self.exit.code),
            _ => Err(AppError::NonZeroExit {
                code: self.exit.code,
            }),
        }
    }
}

impl JobHandle {
    pub(crate) fn pending(kind: JobKind, key: SessionKey) -> Self {
        Self::with_command(kind, key, String::new())
    }

    fn with_command(kind: JobKind, key: SessionKey, command: String) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(JobShared {
                id: Uuid::new_v4().to_string(),
                kind,
                key,
                command,
                state,
                cancel,
                exit: Mutex::new(None),
                pid: Mutex::new(None),
                start_time: Instant::now(),
                start_time_system: SystemTime::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exit(&self) -> Option<JobExit> {
        *self.inner.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn started(&self) -> (Instant, SystemTime) {
        (self.inner.start_time, self.inner.start_time_system)
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.inner.state.send_replace(state);
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    /// Records the exit before publishing the terminal state so waiters
    /// always see both. Called last, after the `Exited` event went out.
    fn finish(&self, exit: JobExit) {
        *self.inner.exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(exit);
        self.set_state(exit.state);
    }

    /// Requests cancellation. Repeated calls while the job is live are
    /// accepted and have no further effect.
    pub fn cancel(&self) -> Result<(), AppError> {
        if self.state().is_terminal() {
            return Err(AppError::NotRunning(self.key().to_string()));
        }
        let already = self.inner.cancel.send_replace(true);
        if !already {
            info!(job = %self.key(), sid = %self.id(), "Cancellation requested");
        }
        Ok(())
    }

    fn cancel_requested(&self) -> watch::Receiver<bool> {
        self.inner.cancel.subscribe()
    }

    /// Resolves once the job reached a terminal state and its `Exited`
    /// event was emitted.
    pub async fn wait(&self) -> JobReport {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        let exit = self.exit().unwrap_or(JobExit {
            code: None,
            state: self.state(),
        });
        JobReport {
            session_id: self.id().to_string(),
            key: self.key().clone(),
            kind: self.kind(),
            exit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobTimeouts {
    pub cancel_grace: Duration,
    pub kill_timeout: Duration,
    pub output_drain: Duration,
}

impl From<&Config> for JobTimeouts {
    fn from(config: &Config) -> Self {
        Self {
            cancel_grace: config.cancel_grace,
            kill_timeout: config.kill_timeout,
            output_drain: config.output_drain,
        }
    }
}

impl Default for JobTimeouts {
    fn default() -> Self {
        JobTimeouts::from(&Config::default())
    }
}

/// Runs external commands in the background, one per registry key.
pub struct JobRunner {
    registry: Arc<SessionRegistry>,
    launcher: Arc<dyn CommandLauncher>,
    timeouts: JobTimeouts,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        registry: Arc<SessionRegistry>,
        launcher: Arc<dyn CommandLauncher>,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            registry,
            launcher,
            timeouts,
        }
    }

    /// Starts `command` under `target` and returns without waiting for it.
    /// Must be called from within a Tokio runtime.
    #[instrument(skip_all, fields(job = %target, kind = %kind))]
    pub fn run(
        &self,
        kind: JobKind,
        target: SessionKey,
        command: CommandSpec,
        sink: Arc<dyn Sink>,
    ) -> Result<JobHandle, AppError> {
        let command_line = command.display();
        let handle = JobHandle::with_command(kind, target.clone(), command_line.clone());
        self.registry
            .register(target.clone(), ActiveSession::Job(handle.clone()))?;

        let launched = match self.launcher.launch(&command) {
            Ok(launched) => launched,
            Err(source) => {
                error!(error = %source, command = %command_line, "Job launch failed");
                handle.finish(JobExit {
                    code: None,
                    state: JobState::Failed,
                });
                self.registry.release(&target, handle.id());
                return Err(AppError::ProcessLaunchFailed {
                    command: command_line,
                    source,
                });
            }
        };

        handle.set_pid(launched.child.id());
        handle.set_state(JobState::Running);
        let emitter = Emitter::new(target, handle.id(), sink);
        emitter.emit(EventKind::Started);
        info!(pid = ?handle.pid(), sid = %handle.id(), command = %command_line, "Job started");

        tokio::spawn(supervise(
            handle.clone(),
            launched,
            emitter,
            self.registry.clone(),
            self.timeouts,
        ));
        Ok(handle)
    }

    pub fn cancel(&self, target: &SessionKey) -> Result<(), AppError> {
        match self.registry.lookup(target) {
            Some(ActiveSession::Job(job)) => job.cancel(),
            _ => Err(AppError::NotRunning(target.to_string())),
        }
    }

    pub fn lookup(&self, target: &SessionKey) -> Option<JobHandle> {
        match self.registry.lookup(target) {
            Some(ActiveSession::Job(job)) => Some(job),
            _ => None,
        }
    }

    pub fn is_active(&self, target: &SessionKey) -> bool {
        self.lookup(target).is_some_and(|job| !job.state().is_terminal())
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|requested| *requested).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn supervise(
    handle: JobHandle,
    launched: LaunchedProcess,
    emitter: Emitter,
    registry: Arc<SessionRegistry>,
    timeouts: JobTimeouts,
) {
    let LaunchedProcess {
        stdout,
        stderr,
        mut child,
    } = launched;

    let readers: Vec<JoinHandle<()>> = [stdout, stderr]
        .into_iter()
        .flatten()
        .map(|stream| tokio::spawn(forward_output(stream, emitter.clone())))
        .collect();

    let mut cancel_rx = handle.cancel_requested();
    let exited_first = tokio::select! {
        status = child.wait() => Some(status),
        _ = wait_for_cancel(&mut cancel_rx) => None,
    };
    let cancelled = exited_first.is_none();
    let termination = match exited_first {
        Some(status) => Termination::Exited(status),
        None => {
            terminate_with_escalation(child.as_mut(), timeouts.cancel_grace, timeouts.kill_timeout)
                .await
        }
    };
    // Dropping the child after abandonment still fires kill_on_drop.
    drop(child);

    drain_output(readers, timeouts.output_drain).await;

    let exit = classify(&termination, cancelled);
    match &termination {
        Termination::Exited(Ok(_)) => {
            info!(job = %handle.key(), sid = %handle.id(), exit_code = ?exit.code, state = ?exit.state, "Job finished");
        }
        Termination::Exited(Err(e)) => {
            warn!(job = %handle.key(), sid = %handle.id(), error = %e, "Failed to wait for job");
        }
        Termination::Abandoned => {
            error!(job = %handle.key(), sid = %handle.id(), "Job abandoned after kill timeout");
        }
    }

    registry.release(handle.key(), handle.id());
    emitter.emit(EventKind::Exited(exit));
    handle.finish(exit);
}

fn classify(termination: &Termination, cancelled: bool) -> JobExit {
    match termination {
        Termination::Exited(Ok(code)) => {
            let state = if cancelled {
                JobState::Cancelled
            } else if *code == Some(0) {
                JobState::Succeeded
            } else {
                JobState::Failed
            };
            JobExit { code: *code, state }
        }
        Termination::Exited(Err(_)) => JobExit {
            code: None,
            state: if cancelled {
                JobState::Cancelled
            } else {
                JobState::Failed
            },
        },
        Termination::Abandoned => JobExit {
            code: None,
            state: JobState::Cancelled,
        },
    }
}

async fn forward_output(stream: OutputStream, emitter: Emitter) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                emitter.emit(EventKind::DataLine(String::from_utf8_lossy(&buf).into_owned()));
            }
            Err(e) => {
                warn!(error = %e, "Job output stream failed");
                break;
            }
        }
    }
}

/// Grandchildren can keep pipes open after the job exits; stop waiting for
/// them after `drain`.
async fn drain_output(readers: Vec<JoinHandle<()>>, drain: Duration) {
    for mut reader in readers {
        if timeout(drain, &mut reader).await.is_err() {
            debug!("Output reader still busy after drain window; aborting");
            reader.abort();
            let _ = reader.await;
        }
    }
}
