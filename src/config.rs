use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub toolchain_bin: Option<PathBuf>,
    pub preferences_file: PathBuf,
    pub log_level: String,
    pub serial_read_timeout: Duration,
    pub cancel_grace: Duration,
    pub kill_timeout: Duration,
    pub output_drain: Duration,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    shellexpand::full(path_str)
        .map(|cow| PathBuf::from(cow.as_ref()))
        .map_err(|e| anyhow::anyhow!("Failed to expand path '{}': {}", path_str, e))
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default_ms.to_string());
    let ms = raw
        .parse::<u64>()
        .with_context(|| format!("Invalid {}: {}", name, raw))?;
    Ok(Duration::from_millis(ms))
}

const MEGABYTE: u64 = 1024 * 1024;
const DEFAULT_AUDIT_LOG_MAX_SIZE_MB: u64 = 10;

/// Unparsable sizes fall back to the default; huge ones saturate.
fn megabytes(raw: &str) -> u64 {
    raw.trim()
        .parse::<u64>()
        .unwrap_or(DEFAULT_AUDIT_LOG_MAX_SIZE_MB)
        .saturating_mul(MEGABYTE)
}

fn default_state_dir() -> Result<PathBuf> {
    expand_tilde("~/.toolchain-session-host")
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = PathBuf::from(".toolchain-session-host");
        Self {
            project_root: PathBuf::from("."),
            toolchain_bin: None,
            preferences_file: state_dir.join("preferences.json"),
            log_level: "info".to_string(),
            serial_read_timeout: Duration::from_millis(100),
            cancel_grace: Duration::from_millis(3000),
            kill_timeout: Duration::from_millis(2000),
            output_drain: Duration::from_millis(500),
            audit_log_file: state_dir.join("commands.log"),
            audit_log_max_size_bytes: DEFAULT_AUDIT_LOG_MAX_SIZE_MB * MEGABYTE,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let project_root = match std::env::var("PROJECT_ROOT") {
            Ok(raw) if !raw.trim().is_empty() => {
                let expanded = expand_tilde(&raw)?;
                dunce::canonicalize(&expanded)
                    .with_context(|| format!("Failed to canonicalize PROJECT_ROOT: {}", raw))?
            }
            _ => std::env::current_dir().context("Failed to read current directory")?,
        };
        if !project_root.is_dir() {
            anyhow::bail!("PROJECT_ROOT is not a valid directory: {:?}", project_root);
        }

        let toolchain_bin = match std::env::var("TOOLCHAIN_BIN") {
            Ok(raw) if !raw.trim().is_empty() => Some(expand_tilde(&raw)?),
            _ => {
                let found = which::which("pio").or_else(|_| which::which("platformio")).ok();
                if found.is_none() {
                    warn!("Neither pio nor platformio found in PATH. Toolchain jobs will fail until TOOLCHAIN_BIN is set.");
                }
                found
            }
        };

        let state_dir = default_state_dir()?;

        let preferences_file = match std::env::var("PREFERENCES_FILE") {
            Ok(raw) if !raw.trim().is_empty() => expand_tilde(&raw)?,
            _ => state_dir.join("preferences.json"),
        };

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let serial_read_timeout = env_millis("SERIAL_READ_TIMEOUT_MS", 100)?;
        if serial_read_timeout.is_zero() {
            anyhow::bail!("SERIAL_READ_TIMEOUT_MS must be greater than zero");
        }
        let cancel_grace = env_millis("CANCEL_GRACE_MS", 3000)?;
        let kill_timeout = env_millis("KILL_TIMEOUT_MS", 2000)?;
        let output_drain = env_millis("OUTPUT_DRAIN_MS", 500)?;

        let audit_log_file = match std::env::var("AUDIT_LOG_FILE") {
            Ok(raw) if !raw.trim().is_empty() => expand_tilde(&raw)?,
            _ => state_dir.join("commands.log"),
        };
        let audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .map(|raw| megabytes(&raw))
            .unwrap_or(DEFAULT_AUDIT_LOG_MAX_SIZE_MB * MEGABYTE);

        Ok(Config {
            project_root,
            toolchain_bin,
            preferences_file,
            log_level,
            serial_read_timeout,
            cancel_grace,
            kill_timeout,
            output_drain,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }
}
