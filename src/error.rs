use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session already active for key: {0}")]
    AlreadyActive(String),

    #[error("Port unavailable: {port}: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch '{command}': {source}")]
    ProcessLaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No running session for key: {0}")]
    NotRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process exited with non-zero status: {code:?}")]
    NonZeroExit { code: Option<i32> },

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Preferences error: {0}")]
    Preferences(String),

    #[error("Toolchain executable not found: {0}")]
    ToolchainNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid input argument: {0}")]
    InvalidInput(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl AppError {
    /// Stable identifier sent to the editor in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AlreadyActive(_) => "already_active",
            AppError::PortUnavailable { .. } => "port_unavailable",
            AppError::ProcessLaunchFailed { .. } => "process_launch_failed",
            AppError::NotRunning(_) => "not_running",
            AppError::Io(_) => "io_error",
            AppError::NonZeroExit { .. } => "non_zero_exit",
            AppError::Config(_) => "config_error",
            AppError::Preferences(_) => "preferences_error",
            AppError::ToolchainNotFound(_) => "toolchain_not_found",
            AppError::InvalidPath(_) => "invalid_path",
            AppError::InvalidInput(_) | AppError::SerdeJson(_) => "invalid_params",
            AppError::UnknownCommand(_) => "unknown_command",
        }
    }

    /// Acquisition failures the caller can recover from by picking another
    /// port or waiting for the running job.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::AlreadyActive(_)
                | AppError::PortUnavailable { .. }
                | AppError::ProcessLaunchFailed { .. }
                | AppError::NotRunning(_)
        )
    }
}
