use crate::error::AppError;
use crate::tools::job_tool::JobHandle;
use crate::tools::serial_tool::SerialSession;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};
use tracing::{debug, warn};

/// Registry key: a serial port identifier or a job slot name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lookup reference to a live session. The registry never closes ports or
/// reaps processes itself; the session behind the handle does.
#[derive(Debug, Clone)]
pub enum ActiveSession {
    Serial(Arc<SerialSession>),
    Job(JobHandle),
}

impl ActiveSession {
    pub fn session_id(&self) -> &str {
        match self {
            ActiveSession::Serial(session) => session.id(),
            ActiveSession::Job(job) => job.id(),
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            ActiveSession::Serial(session) => session.is_running(),
            ActiveSession::Job(job) => !job.state().is_terminal(),
        }
    }

    fn started(&self) -> (Instant, SystemTime) {
        match self {
            ActiveSession::Serial(session) => session.started(),
            ActiveSession::Job(job) => job.started(),
        }
    }

    fn describe(&self) -> (&'static str, String) {
        match self {
            ActiveSession::Serial(session) => ("serial", format!("{} baud", session.baud_rate())),
            ActiveSession::Job(job) => ("job", job.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub session_id: String,
    pub kind: &'static str,
    pub detail: String,
    pub running: bool,
    pub started_at: String,
    pub runtime_ms: u128,
}

/// Process-wide table of live sessions and jobs, at most one per key.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The map is never left half-updated, so a poisoned lock is still usable.
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, ActiveSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, key: SessionKey, session: ActiveSession) -> Result<(), AppError> {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&key) {
            if existing.is_live() {
                debug!(key = %key, existing = %existing.session_id(), "Registration rejected");
                return Err(AppError::AlreadyActive(key.to_string()));
            }
            warn!(key = %key, stale = %existing.session_id(), "Replacing stale registry entry");
        }
        debug!(key = %key, session_id = %session.session_id(), "Session registered");
        sessions.insert(key, session);
        Ok(())
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<ActiveSession> {
        self.sessions().get(key).cloned()
    }

    /// Unconditional, idempotent removal.
    pub fn unregister(&self, key: &SessionKey) -> Option<ActiveSession> {
        self.sessions().remove(key)
    }

    /// Removes `key` only while it still belongs to `session_id`. Returns
    /// whether this call did the removal.
    pub fn release(&self, key: &SessionKey, session_id: &str) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(key) {
            Some(existing) if existing.session_id() == session_id => {
                sessions.remove(key);
                debug!(key = %key, session_id = %session_id, "Session released");
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions().get(key).is_some_and(ActiveSession::is_live)
    }

    pub fn active_sessions(&self) -> Vec<(SessionKey, ActiveSession)> {
        self.sessions()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = self
            .active_sessions()
            .into_iter()
            .map(|(key, session)| {
                let (started_instant, started_system) = session.started();
                let (kind, detail) = session.describe();
                SessionInfo {
                    session_id: session.session_id().to_string(),
                    running: session.is_live(),
                    started_at: chrono::DateTime::<Utc>::from(started_system).to_rfc3339(),
                    runtime_ms: now.duration_since(started_instant).as_millis(),
                    key,
                    kind,
                    detail,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
