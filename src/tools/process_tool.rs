use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio as StdProcessStdio;
use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

/// Program, arguments and environment of one external invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Control over a spawned process. Owned by exactly one job worker.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM where supported).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process down.
    fn kill(&mut self) -> io::Result<()>;

    /// Resolves with the exit code, `None` if the process died from a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

pub struct LaunchedProcess {
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    pub child: Box<dyn ChildProcess>,
}

pub trait CommandLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> io::Result<LaunchedProcess>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl CommandLauncher for OsLauncher {
    #[instrument(skip(self, spec), fields(command = %spec.display()))]
    fn launch(&self, spec: &CommandSpec) -> io::Result<LaunchedProcess> {
        let mut command = TokioCommand::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.stdin(StdProcessStdio::null());
        command.stdout(StdProcessStdio::piped());
        command.stderr(StdProcessStdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn command");
            e
        })?;
        debug!(pid = ?child.id(), "Command spawned");

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::pin(s) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::pin(s) as OutputStream);

        Ok(LaunchedProcess {
            stdout,
            stderr,
            child: Box::new(OsChild { child }),
        })
    }
}

struct OsChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        match send_terminate_signal(pid) {
            Some(true) => Ok(()),
            Some(false) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("failed to deliver termination signal to {}", pid),
            )),
            None => {
                debug!(pid, "Graceful termination unsupported; killing instead");
                self.child.start_kill()
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

/// Sends SIGTERM through sysinfo. `None` means the platform has no such
/// signal or the process is already gone.
fn send_terminate_signal(pid: u32) -> Option<bool> {
    let pid = Pid::from(pid as usize);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).and_then(|p| p.kill_with(Signal::Term))
}

#[derive(Debug)]
pub enum Termination {
    Exited(io::Result<Option<i32>>),
    /// Still alive after terminate and kill; the handle was given up.
    Abandoned,
}

/// Terminate, wait `grace`, kill, wait `kill_timeout`.
#[instrument(skip(child), fields(pid = ?child.id()))]
pub async fn terminate_with_escalation(
    child: &mut dyn ChildProcess,
    grace: Duration,
    kill_timeout: Duration,
) -> Termination {
    if let Err(e) = child.terminate() {
        warn!(error = %e, "Termination request failed");
    }
    if let Ok(status) = timeout(grace, child.wait()).await {
        debug!("Process exited after termination request");
        return Termination::Exited(status);
    }

    warn!(grace_ms = grace.as_millis() as u64, "Process ignored termination request, killing");
    if let Err(e) = child.kill() {
        warn!(error = %e, "Kill failed");
    }
    match timeout(kill_timeout, child.wait()).await {
        Ok(status) => Termination::Exited(status),
        Err(_) => {
            error!(
                kill_timeout_ms = kill_timeout.as_millis() as u64,
                "Process still running after kill; abandoning it"
            );
            Termination::Abandoned
        }
    }
}
