use crate::config::Config;
use crate::error::AppError;
use crate::host::protocol::*;
use crate::tools::session_manager::{MonitorRequest, SessionManager};
use crate::tools::sink::{ChannelSink, SessionEvent};
use crate::utils::audit_logger::AuditLogger;
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, instrument, warn};

/// Whether the host loop keeps reading requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub struct CommandHandler {
    manager: Arc<SessionManager>,
    audit: AuditLogger,
}

impl CommandHandler {
    pub fn new(manager: Arc<SessionManager>, audit: AuditLogger) -> Self {
        Self { manager, audit }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Runs a synchronous manager call off the async threads; serial opens
    /// and writes may block for a while.
    async fn blocking<T, F>(&self, call: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&SessionManager) -> Result<T, AppError> + Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || call(&manager))
            .await
            .map_err(|e| AppError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Parses one request line and produces its response.
    pub async fn handle_line(&self, line: &str) -> (Response, Flow) {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                // Recover the id when the line is valid JSON with a bad shape.
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64));
                return (Response::failure(id, &AppError::SerdeJson(e)), Flow::Continue);
            }
        };

        let params = match request.params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        self.audit.log_command(&request.command, &params).await;

        let flow = if request.command == "shutdown" {
            Flow::Shutdown
        } else {
            Flow::Continue
        };
        let response = match self.dispatch(&request.command, params).await {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                if e.is_recoverable() {
                    info!(command = %request.command, error = %e, "Command rejected");
                } else {
                    error!(command = %request.command, error = %e, "Command failed");
                }
                Response::failure(Some(request.id), &e)
            }
        };
        (response, flow)
    }

    #[instrument(skip(self, params))]
    pub async fn dispatch(&self, command: &str, params: Value) -> Result<Value, AppError> {
        debug!(params = %params, "Dispatching command");

        macro_rules! parse {
            ($param_type:ty) => {
                serde_json::from_value::<$param_type>(params)?
            };
        }

        let result = match command {
            "start_monitor" => {
                let request = parse!(MonitorRequest);
                serde_json::to_value(self.blocking(move |m| m.start_monitor(request)).await?)?
            }
            "stop_monitor" => {
                let p = parse!(PortParams);
                serde_json::to_value(self.manager.stop_monitor(p.port.as_deref())?)?
            }
            "toggle_monitor" => {
                let request = parse!(MonitorRequest);
                serde_json::to_value(self.blocking(move |m| m.toggle_monitor(request)).await?)?
            }
            "close_monitor_view" => {
                let p = parse!(CloseViewParams);
                let closed = self.manager.close_monitor_view(&p.port);
                json!({ "port": p.port, "closed": closed })
            }
            "send_serial" => {
                let p = parse!(SendSerialParams);
                let sent = p.text.len();
                self.blocking(move |m| m.send_serial(p.port.as_deref(), &p.text))
                    .await?;
                json!({ "sent": sent })
            }
            "monitor_state" => {
                let p = parse!(PortParams);
                serde_json::to_value(self.manager.monitor_state(p.port.as_deref()))?
            }
            "run_job" => {
                let p = parse!(RunJobParams);
                let job = self.manager.run_job(p.kind, p.options).await?;
                serde_json::to_value(JobStarted::from(&job))?
            }
            "cancel_job" => {
                let key = parse!(CancelJobParams).key()?;
                self.manager.cancel_job(key.as_str())?;
                json!({ "key": key, "cancelling": true })
            }
            "list_sessions" => serde_json::to_value(self.manager.list_sessions())?,
            "list_ports" => serde_json::to_value(self.blocking(|m| Ok(m.list_ports())).await?)?,
            "get_preference" => {
                let p = parse!(GetPreferenceParams);
                let value = self.manager.get_preference(&p.key).unwrap_or(Value::Null);
                json!({ "key": p.key, "value": value })
            }
            "set_preference" => {
                let p = parse!(SetPreferenceParams);
                self.manager.set_preference(&p.key, p.value.clone())?;
                json!({ "key": p.key, "value": p.value })
            }
            "shutdown" => {
                self.manager.shutdown().await;
                json!({ "shutdown": true })
            }
            other => return Err(AppError::UnknownCommand(other.to_string())),
        };
        Ok(result)
    }
}

async fn write_message<W>(output: &mut W, message: &Outbound) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    output.write_all(&bytes).await?;
    output.flush().await
}

async fn forward_event<W>(output: &mut W, event: SessionEvent) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(output, &Outbound::Event(event.into())).await
}

/// Reads requests from `input` and writes responses and session events to
/// `output` until EOF or `shutdown`. Every live session is stopped before
/// returning.
pub async fn run<R, W>(
    handler: CommandHandler,
    mut events: UnboundedReceiver<SessionEvent>,
    input: R,
    mut output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut stopped_by_request = false;

    let loop_result: anyhow::Result<()> = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (response, flow) = handler.handle_line(&line).await;
                if let Err(e) = write_message(&mut output, &Outbound::Response(response)).await {
                    break Err(e.into());
                }
                if flow == Flow::Shutdown {
                    stopped_by_request = true;
                    break Ok(());
                }
            }
            Some(event) = events.recv() => {
                if let Err(e) = forward_event(&mut output, event).await {
                    break Err(e.into());
                }
            }
        }
    };

    if !stopped_by_request {
        handler.manager().shutdown().await;
    }
    // Terminal events produced during shutdown still reach the editor.
    while let Ok(event) = events.try_recv() {
        if let Err(e) = forward_event(&mut output, event).await {
            debug!(error = %e, "Could not deliver final event");
            break;
        }
    }
    loop_result
}

/// Wires the real backends to stdin/stdout.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = Arc::new(SessionManager::new(&config, Arc::new(ChannelSink::new(tx))));
    let handler = CommandHandler::new(manager, AuditLogger::new(&config));
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    run(handler, rx, input, tokio::io::stdout()).await
}
