use crate::config::Config;
use crate::error::AppError;
use crate::tools::job_tool::JobKind;
use crate::tools::process_tool::CommandSpec;
use crate::tools::serial_tool::{PortEnumerator, PortInfo};
use crate::utils::path_utils::resolve_project_dir;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Per-job arguments. Which fields matter depends on the job kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Relative paths resolve against the project root.
    pub project_dir: Option<String>,
    pub environment: Option<String>,
    pub upload_port: Option<String>,
    pub query: Option<String>,
    pub library: Option<String>,
    /// Upload through an ISP programmer (`usbasp`, `avrispmkii`, ...)
    /// instead of the board's bootloader. `none` means the bootloader.
    pub programmer: Option<String>,
    /// Password for network (OTA) uploads.
    pub auth: Option<String>,
    pub verbose: bool,
    /// Registry slot override.
    pub target: Option<String>,
}

/// Builds toolchain CLI invocations.
#[derive(Debug, Clone)]
pub struct Toolchain {
    executable: Option<PathBuf>,
    project_root: PathBuf,
}

impl Toolchain {
    pub fn new(executable: Option<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            executable,
            project_root: project_root.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.toolchain_bin.clone(), config.project_root.clone())
    }

    pub fn executable(&self) -> Option<&PathBuf> {
        self.executable.as_ref()
    }

    pub fn command(&self, kind: JobKind, options: &JobOptions) -> Result<CommandSpec, AppError> {
        let executable = self.executable.clone().ok_or_else(|| {
            AppError::ToolchainNotFound(
                "set TOOLCHAIN_BIN or put pio on PATH".to_string(),
            )
        })?;
        let base = CommandSpec::new(executable)
            // Progress bars redraw with \r and would flood the output panel.
            .env("PLATFORMIO_DISABLE_PROGRESSBAR", "true")
            .env("PLATFORMIO_FORCE_ANSI", "false");

        let spec = match kind {
            JobKind::Build | JobKind::Upload | JobKind::Clean => {
                let dir = resolve_project_dir(
                    options.project_dir.as_deref(),
                    &self.project_root,
                    true,
                )?;
                let mut spec = base
                    .current_dir(&dir)
                    .args(["run", "-d"])
                    .arg(dir.display().to_string());
                match kind {
                    JobKind::Upload => {
                        match programmer(options) {
                            Some(protocol) => {
                                spec = spec
                                    .args(["-t", "program", "-O"])
                                    .arg(format!("upload_protocol={}", protocol));
                            }
                            None => spec = spec.args(["-t", "upload"]),
                        }
                        if let Some(port) = non_empty(&options.upload_port) {
                            spec = spec.args(["--upload-port", port]);
                        }
                        // Through the environment so the password stays out of
                        // the command line shown in logs and responses.
                        if let Some(auth) = non_empty(&options.auth) {
                            spec = spec.env("PLATFORMIO_UPLOAD_FLAGS", format!("--auth={}", auth));
                        }
                    }
                    JobKind::Clean => spec = spec.args(["-t", "clean"]),
                    _ => {}
                }
                if kind != JobKind::Clean {
                    if let Some(env) = non_empty(&options.environment) {
                        spec = spec.args(["-e", env]);
                    }
                }
                if options.verbose {
                    spec = spec.arg("-v");
                }
                spec
            }
            JobKind::ListPorts => base
                .current_dir(&self.project_root)
                .args(["device", "list", "--json-output"]),
            JobKind::LibrarySearch => {
                let query = required(&options.query, "query", kind)?;
                base.current_dir(&self.project_root)
                    .args(["lib", "search"])
                    .arg(query)
            }
            JobKind::LibraryInstall => {
                let library = required(&options.library, "library", kind)?;
                base.current_dir(&self.project_root)
                    .args(["lib", "--global", "install"])
                    .arg(library)
            }
            JobKind::LibraryUninstall => {
                let library = required(&options.library, "library", kind)?;
                base.current_dir(&self.project_root)
                    .args(["lib", "--global", "uninstall"])
                    .arg(library)
            }
            JobKind::LibraryList => base
                .current_dir(&self.project_root)
                .args(["lib", "--global", "list"]),
            JobKind::Upgrade => base.current_dir(&self.project_root).arg("upgrade"),
        };
        debug!(kind = %kind, command = %spec.display(), "Built toolchain command");
        Ok(spec)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn programmer(options: &JobOptions) -> Option<&str> {
    non_empty(&options.programmer).filter(|p| !p.eq_ignore_ascii_case("none"))
}

fn required<'a>(value: &'a Option<String>, name: &str, kind: JobKind) -> Result<&'a str, AppError> {
    non_empty(value)
        .ok_or_else(|| AppError::InvalidInput(format!("{} requires a non-empty '{}'", kind, name)))
}

/// OS ports followed by saved network ports, without duplicates.
pub fn list_ports(enumerator: &dyn PortEnumerator, network_ports: &[String]) -> Vec<PortInfo> {
    let mut ports = enumerator.available_ports().unwrap_or_else(|e| {
        warn!(error = %e, "Serial port enumeration failed");
        Vec::new()
    });
    for address in network_ports {
        let name = if address.starts_with("socket://") {
            address.clone()
        } else {
            format!("socket://{}", address)
        };
        if ports.iter().all(|p| p.name != name) {
            ports.push(PortInfo {
                name,
                kind: "network",
                description: None,
            });
        }
    }
    ports
}
