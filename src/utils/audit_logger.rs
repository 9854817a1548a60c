use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_TEXT: usize = 256;
const REDACTED_KEYS: &[&str] = &["auth", "password", "token"];

/// Appends one line per dispatched host command, rotating the file once it
/// grows past the configured size.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_command(&self, command: &str, params: &Value) {
        if let Err(e) = self.try_log_command(command, params).await {
            error!(command = %command, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_command(&self, command: &str, params: &Value) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let params_string = serde_json::to_string(&sanitize(params))?;
        let log_entry = format!("{} | {:<20} | Params: {}\n", timestamp, command, params_string);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

/// Hides credentials and shortens serial payloads before they hit the log.
fn sanitize(params: &Value) -> Value {
    let mut sanitized = params.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for key in REDACTED_KEYS {
            if let Some(value) = obj.get_mut(*key) {
                *value = Value::String("<redacted>".to_string());
            }
        }
        // set_preference carries the secret under "value".
        let secret_preference = obj
            .get("key")
            .and_then(Value::as_str)
            .is_some_and(|key| REDACTED_KEYS.contains(&key));
        if secret_preference {
            if let Some(value) = obj.get_mut("value") {
                *value = Value::String("<redacted>".to_string());
            }
        }
        if let Some(Value::String(text)) = obj.get_mut("text") {
            if text.chars().count() > MAX_LOGGED_TEXT {
                let kept: String = text.chars().take(MAX_LOGGED_TEXT).collect();
                *text = format!("{}... <truncated>", kept);
            }
        }
    }
    sanitized
}
