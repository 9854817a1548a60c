use crate::tools::job_tool::JobState;
use crate::utils::session_registry::SessionKey;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    ViewClosed,
    PortClosed,
    IoError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobExit {
    /// `None` when the process died from a signal or was abandoned.
    pub code: Option<i32>,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    DataLine(String),
    Stopped(StopReason),
    Exited(JobExit),
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Stopped(_) | EventKind::Exited(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub key: SessionKey,
    pub session_id: String,
    pub kind: EventKind,
}

/// Consumer of session output. Implementations must not block: they are
/// called from serial reader threads and job worker tasks.
pub trait Sink: Send + Sync {
    fn notify(&self, event: SessionEvent);
}

/// Stamps events with the key and id of one session.
#[derive(Clone)]
pub struct Emitter {
    key: SessionKey,
    session_id: String,
    sink: Arc<dyn Sink>,
}

impl Emitter {
    pub fn new(key: SessionKey, session_id: impl Into<String>, sink: Arc<dyn Sink>) -> Self {
        Self {
            key,
            session_id: session_id.into(),
            sink,
        }
    }

    pub fn emit(&self, kind: EventKind) {
        self.sink.notify(SessionEvent {
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            kind,
        });
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Forwards events over a channel to whoever owns the output panel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(key = %e.0.key, "Event receiver dropped; discarding event");
        }
    }
}

/// Keeps every event in memory. Handy for callers that poll instead of
/// subscribing.
#[derive(Debug, Default)]
pub struct BufferSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<SessionEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }

    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sink for BufferSink {
    fn notify(&self, event: SessionEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn event(kind: EventKind) -> SessionEvent {
        SessionEvent {
            key: SessionKey::from("COM3"),
            session_id: "s1".to_string(),
            kind,
        }
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        drop(rx);
        sink.notify(event(EventKind::Started));
    }

    #[test]
    fn buffer_sink_drains_in_order() {
        let sink = BufferSink::new();
        sink.notify(event(EventKind::Started));
        sink.notify(event(EventKind::DataLine("x".into())));
        let kinds: Vec<_> = sink.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Started, EventKind::DataLine("x".into())]);
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn serializes_with_tagged_kind() {
        let json = serde_json::to_value(event(EventKind::Stopped(StopReason::ViewClosed))).unwrap();
        assert_eq!(json["kind"]["kind"], "stopped");
        assert_eq!(json["kind"]["data"]["reason"], "view_closed");
    }
}
