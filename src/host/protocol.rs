use crate::error::AppError;
use crate::tools::job_tool::{JobHandle, JobKind};
use crate::tools::sink::{EventKind, SessionEvent};
use crate::tools::toolchain_tool::JobOptions;
use crate::utils::diagnostics::{parse_diagnostic, Diagnostic};
use crate::utils::session_registry::SessionKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// One line on stdout.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response(Response),
    Event(EventMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// `None` when the request line could not be parsed far enough to
    /// recover its id.
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, err: &AppError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub key: SessionKey,
    pub session_id: String,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl From<SessionEvent> for EventMessage {
    fn from(event: SessionEvent) -> Self {
        let diagnostic = match &event.kind {
            EventKind::DataLine(line) => parse_diagnostic(line),
            _ => None,
        };
        Self {
            key: event.key,
            session_id: event.session_id,
            event: event.kind,
            diagnostic,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PortParams {
    pub port: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CloseViewParams {
    pub port: String,
}

#[derive(Debug, Deserialize)]
pub struct SendSerialParams {
    #[serde(default)]
    pub port: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct RunJobParams {
    pub kind: JobKind,
    #[serde(flatten)]
    pub options: JobOptions,
}

/// Either an explicit registry key or the kind whose default slot to use.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelJobParams {
    pub target: Option<String>,
    pub kind: Option<JobKind>,
}

impl CancelJobParams {
    pub fn key(&self) -> Result<SessionKey, AppError> {
        match (&self.target, self.kind) {
            (Some(target), _) if !target.trim().is_empty() => Ok(SessionKey::from(target.trim())),
            (_, Some(kind)) => Ok(kind.default_slot()),
            _ => Err(AppError::InvalidInput(
                "cancel_job needs a 'target' or a 'kind'".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetPreferenceParams {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPreferenceParams {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStarted {
    pub session_id: String,
    pub key: SessionKey,
    pub kind: JobKind,
    pub command: String,
    pub pid: Option<u32>,
}

impl From<&JobHandle> for JobStarted {
    fn from(job: &JobHandle) -> Self {
        Self {
            session_id: job.id().to_string(),
            key: job.key().clone(),
            kind: job.kind(),
            command: job.command().to_string(),
            pid: job.pid(),
        }
    }
}
