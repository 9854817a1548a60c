use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Flat JSON object of user choices (last port, baud rate, ...).
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl Preferences {
    /// A missing file is an empty store; a malformed one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Map::new(),
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(AppError::Preferences(format!(
                        "{} must hold a JSON object, found {}",
                        path.display(),
                        type_name(&other)
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No preferences file yet");
                Map::new()
            }
            Err(e) => return Err(AppError::Io(e)),
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// In-memory store that never touches disk. Used by tests and when the
    /// preferences file cannot be opened.
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            values: RwLock::new(Map::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `default` when the key is absent or holds the wrong type.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        match values.get(key) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!(key, error = %e, "Ignoring preference with unexpected type");
                default
            }),
            None => default,
        }
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), AppError> {
        let value = serde_json::to_value(value)?;
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        values.insert(key.to_string(), value);
        // Persist while holding the lock so concurrent writers cannot
        // interleave and lose an update on disk.
        self.persist(&values)
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), AppError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Preferences saved");
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
