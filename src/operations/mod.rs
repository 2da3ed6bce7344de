//! Compose operations: started here, executed by an agent, streamed back as NDJSON.
//!
//! Each operation has a single writer task. Frames are persisted in arrival order with a
//! per-operation sequence number, then published to the hub and to any followers. Every
//! operation ends with exactly one `complete` or `error` message; when the agent does not
//! send one (timeout, dropped stream) a synthetic `error` is written instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::agent::types::{OperationFrame, RegistryAuth, StartOperation};
use crate::audit::{Actor, AuditEvent, AuditLogger};
use crate::compose::validate_service_name;
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::hub::{Event, Hub, Resource};
use crate::images::{credentials_for_stack, to_registry_auth};
use crate::store::{NewOperationLog, NewOperationMessage, OperationOutcome, Store};
use crate::types::{AuditEventType, MessageKind, OperationLog, OperationLogMessage, Server};

/// Compose subcommands an operation may run.
pub const COMMANDS: &[&str] = &["up", "down", "pull", "restart", "start", "stop", "create", "rm"];

/// Commands that may pull images and so need registry credentials.
const PULLING_COMMANDS: &[&str] = &["up", "pull", "restart"];

const MAX_FRAME_LEN: usize = 1024 * 1024;
const FOLLOW_CAPACITY: usize = 256;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_STREAM_CLOSED: &str = "stream_closed";
pub const REASON_AGENT_ERROR: &str = "agent_error";
pub const REASON_COMMAND_FAILED: &str = "command_failed";
pub const REASON_INTERNAL: &str = "internal_error";

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl StartRequest {
    pub fn validate(&self) -> Result<()> {
        if !COMMANDS.contains(&self.command.as_str()) {
            return Err(Error::BadRequest(format!(
                "unsupported command '{}'",
                self.command
            )));
        }
        for option in &self.options {
            let valid = option.starts_with('-')
                && option.len() > 1
                && option
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.' | ':' | ','));
            if !valid {
                return Err(Error::BadRequest(format!("invalid option '{option}'")));
            }
        }
        for service in &self.services {
            validate_service_name(service).map_err(|_| {
                Error::BadRequest(format!("invalid service name '{service}'"))
            })?;
        }
        Ok(())
    }
}

/// A started operation. Awaiting `handle` yields the finished log.
pub struct Started {
    pub log: OperationLog,
    pub handle: JoinHandle<Option<OperationLog>>,
}

pub struct Operations {
    store: Arc<dyn Store>,
    agents: Arc<AgentRegistry>,
    hub: Arc<Hub>,
    audit: Arc<AuditLogger>,
    crypto: Crypto,
    timeout: Duration,
    running: DashMap<String, broadcast::Sender<OperationLogMessage>>,
}

struct Ending {
    success: bool,
    exit_code: Option<i32>,
    failure_reason: Option<String>,
}

impl Ending {
    fn from_terminal(message: &OperationLogMessage) -> Self {
        match message.kind {
            MessageKind::Complete => {
                let success = message
                    .success
                    .unwrap_or_else(|| message.exit_code.unwrap_or(0) == 0);
                Self {
                    success,
                    exit_code: message.exit_code,
                    failure_reason: (!success).then(|| REASON_COMMAND_FAILED.to_string()),
                }
            }
            _ => Self {
                success: false,
                exit_code: message.exit_code,
                failure_reason: Some(REASON_AGENT_ERROR.to_string()),
            },
        }
    }

    fn synthetic(reason: &str) -> Self {
        Self {
            success: false,
            exit_code: None,
            failure_reason: Some(reason.to_string()),
        }
    }
}

/// Persists and fans out the messages of one operation.
struct Recorder {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    tx: broadcast::Sender<OperationLogMessage>,
    log: OperationLog,
    sequence: i64,
    last_timestamp: DateTime<Utc>,
    last: Option<OperationLogMessage>,
}

impl Recorder {
    fn record(
        &mut self,
        kind: MessageKind,
        data: String,
        exit_code: Option<i32>,
        success: Option<bool>,
    ) -> Result<OperationLogMessage> {
        self.sequence += 1;
        let timestamp = Utc::now().max(self.last_timestamp);
        self.last_timestamp = timestamp;

        let saved = self.store.append_operation_message(
            self.log.id,
            &NewOperationMessage {
                sequence: self.sequence,
                timestamp,
                kind,
                data,
                exit_code,
                success,
            },
        )?;

        self.hub.publish(&Event {
            resource: Resource::Operations,
            event: "operation_progress".to_string(),
            server_id: self.log.server_id,
            stack_name: Some(self.log.stack_name.clone()),
            operation_id: Some(self.log.operation_id.clone()),
            data: serde_json::to_value(&saved)?,
        });
        // No followers is fine.
        let _ = self.tx.send(saved.clone());
        self.last = Some(saved.clone());
        Ok(saved)
    }

    fn record_frame(&mut self, frame: OperationFrame) -> Result<OperationLogMessage> {
        self.record(frame.kind, frame.data, frame.exit_code, frame.success)
    }

    fn has_terminal(&self) -> bool {
        self.last.as_ref().is_some_and(|m| m.kind.is_terminal())
    }
}

impl Operations {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        agents: Arc<AgentRegistry>,
        hub: Arc<Hub>,
        audit: Arc<AuditLogger>,
        crypto: Crypto,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            agents,
            hub,
            audit,
            crypto,
            timeout,
            running: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_running(&self, operation_id: &str) -> bool {
        self.running.contains_key(operation_id)
    }

    /// Creates the operation log and spawns its execution. The caller has already
    /// authorized `stacks.manage` on the stack.
    pub fn start(
        self: &Arc<Self>,
        server: &Server,
        stack: &str,
        request: &StartRequest,
        user_id: i64,
        actor: &Actor,
    ) -> Result<Started> {
        request.validate()?;

        let log = self.store.create_operation_log(&NewOperationLog {
            user_id,
            server_id: server.id,
            stack_name: stack.to_string(),
            operation_id: uuid::Uuid::now_v7().to_string(),
            command: request.command.clone(),
            options: request.options.clone(),
            services: request.services.clone(),
            start_time: Utc::now(),
        })?;

        let (tx, _) = broadcast::channel(FOLLOW_CAPACITY);
        self.running.insert(log.operation_id.clone(), tx.clone());

        self.audit.record(
            AuditEvent::new(AuditEventType::OperationStarted, actor)
                .target("stack", None, stack)
                .server(server.id)
                .stack(stack)
                .metadata(json!({
                    "operation_id": log.operation_id,
                    "command": log.command,
                    "services": log.services,
                })),
        );
        info!(
            server_id = server.id,
            stack,
            operation_id = %log.operation_id,
            command = %log.command,
            "Operation started"
        );

        let recorder = Recorder {
            store: self.store.clone(),
            hub: self.hub.clone(),
            tx,
            log: log.clone(),
            sequence: 0,
            last_timestamp: log.start_time,
            last: None,
        };
        let this = Arc::clone(self);
        let server = server.clone();
        let actor = actor.clone();
        let handle = tokio::spawn(async move { this.execute(server, recorder, actor).await });

        Ok(Started { log, handle })
    }

    async fn execute(&self, server: Server, mut recorder: Recorder, actor: Actor) -> Option<OperationLog> {
        let operation_id = recorder.log.operation_id.clone();

        let ending = match tokio::time::timeout(self.timeout, self.stream(&server, &mut recorder)).await {
            Ok(Ok(())) => {
                let terminal = recorder
                    .last
                    .as_ref()
                    .filter(|m| m.kind.is_terminal())
                    .map(Ending::from_terminal);
                match terminal {
                    Some(ending) => ending,
                    None => self.synthetic_error(
                        &mut recorder,
                        REASON_STREAM_CLOSED,
                        "agent closed the stream without a result",
                    ),
                }
            }
            Ok(Err(e @ (Error::Agent(_) | Error::AgentStatus { .. } | Error::UpstreamTimeout))) => {
                warn!(operation_id = %operation_id, "Operation could not reach agent: {e}");
                self.synthetic_error(&mut recorder, REASON_AGENT_ERROR, &e.to_string())
            }
            Ok(Err(e)) => {
                warn!(operation_id = %operation_id, "Operation failed: {e}");
                self.synthetic_error(&mut recorder, REASON_INTERNAL, "internal error")
            }
            Err(_) => {
                warn!(operation_id = %operation_id, timeout = ?self.timeout, "Operation timed out");
                self.synthetic_error(&mut recorder, REASON_TIMEOUT, "operation timed out")
            }
        };

        let finished = self.finish(&recorder, ending, &actor);
        self.running.remove(&operation_id);
        finished
    }

    /// Sends the request and records frames until a terminal one arrives or the stream ends.
    async fn stream(&self, server: &Server, recorder: &mut Recorder) -> Result<()> {
        let log = recorder.log.clone();
        let registry_credentials = if PULLING_COMMANDS.contains(&log.command.as_str()) {
            self.registry_credentials(server.id, &log.stack_name)?
        } else {
            Vec::new()
        };

        let client = self.agents.client(server)?;
        let response = client
            .start_operation(
                &log.stack_name,
                &StartOperation {
                    operation_id: &log.operation_id,
                    command: &log.command,
                    options: &log.options,
                    services: &log.services,
                    registry_credentials,
                },
            )
            .await?;

        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let mut lines = std::pin::pin!(FramedRead::new(
            body,
            LinesCodec::new_with_max_length(MAX_FRAME_LEN)
        ));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(operation_id = %log.operation_id, "Operation stream broke: {e}");
                    return Ok(());
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let saved = match serde_json::from_str::<OperationFrame>(line) {
                Ok(frame) => recorder.record_frame(frame)?,
                Err(_) => recorder.record(MessageKind::Stdout, line.to_string(), None, None)?,
            };
            if saved.kind.is_terminal() {
                break;
            }
        }
        Ok(())
    }

    fn registry_credentials(&self, server_id: i64, stack: &str) -> Result<Vec<RegistryAuth>> {
        let credentials = self.store.list_registry_credentials(server_id)?;
        to_registry_auth(&self.crypto, credentials_for_stack(&credentials, stack))
    }

    fn synthetic_error(&self, recorder: &mut Recorder, reason: &str, message: &str) -> Ending {
        if !recorder.has_terminal() {
            if let Err(e) = recorder.record(MessageKind::Error, message.to_string(), None, Some(false)) {
                warn!(operation_id = %recorder.log.operation_id, "Failed to record operation error: {e}");
            }
        }
        Ending::synthetic(reason)
    }

    fn finish(&self, recorder: &Recorder, ending: Ending, actor: &Actor) -> Option<OperationLog> {
        let log = &recorder.log;
        let outcome = OperationOutcome {
            end_time: Utc::now().max(recorder.last_timestamp),
            success: ending.success,
            exit_code: ending.exit_code,
            failure_reason: ending.failure_reason.clone(),
        };
        if let Err(e) = self.store.finish_operation_log(log.id, &outcome) {
            warn!(operation_id = %log.operation_id, "Failed to close operation log: {e}");
        }

        let event_type = if ending.success {
            AuditEventType::OperationCompleted
        } else {
            AuditEventType::OperationFailed
        };
        let mut event = AuditEvent::new(event_type, actor)
            .target("stack", None, log.stack_name.as_str())
            .server(log.server_id)
            .stack(log.stack_name.as_str())
            .metadata(json!({
                "operation_id": log.operation_id,
                "command": log.command,
                "exit_code": ending.exit_code,
            }));
        if let Some(reason) = &ending.failure_reason {
            event = event.failed(reason.as_str());
        }
        self.audit.record(event);

        info!(
            server_id = log.server_id,
            stack = %log.stack_name,
            operation_id = %log.operation_id,
            success = ending.success,
            "Operation finished"
        );

        let finished = match self.store.get_operation_log(log.id) {
            Ok(Some(finished)) => finished,
            Ok(None) => return None,
            Err(e) => {
                warn!(operation_id = %log.operation_id, "Failed to reload operation log: {e}");
                return None;
            }
        };
        if self.audit.mirrors_operations() {
            match self.store.list_operation_messages(log.id) {
                Ok(messages) => self.audit.operation_finished(&finished, &messages),
                Err(e) => warn!(operation_id = %log.operation_id, "Failed to read messages for the operation file log: {e}"),
            }
        }
        Some(finished)
    }

    /// Replays what is stored for `log`, then tails it live while it runs.
    pub fn follow(&self, log: &OperationLog) -> Result<Follow> {
        // Subscribe before reading history so nothing falls in between.
        let live = self.running.get(&log.operation_id).map(|tx| tx.subscribe());
        let history = self.store.list_operation_messages(log.id)?;
        Ok(Follow {
            store: self.store.clone(),
            log_id: log.id,
            pending: history.into(),
            live,
            last_sequence: 0,
            done: false,
        })
    }
}

/// In-order view of one operation's messages, ending after the terminal one.
pub struct Follow {
    store: Arc<dyn Store>,
    log_id: i64,
    pending: VecDeque<OperationLogMessage>,
    live: Option<broadcast::Receiver<OperationLogMessage>>,
    last_sequence: i64,
    done: bool,
}

impl Follow {
    fn refill(&mut self) -> Result<()> {
        let last = self.last_sequence;
        self.pending.extend(
            self.store
                .list_operation_messages(self.log_id)?
                .into_iter()
                .filter(|m| m.sequence > last),
        );
        Ok(())
    }

    fn take(&mut self) -> Option<OperationLogMessage> {
        while let Some(message) = self.pending.pop_front() {
            if message.sequence <= self.last_sequence {
                continue;
            }
            self.last_sequence = message.sequence;
            self.done = message.kind.is_terminal();
            return Some(message);
        }
        None
    }

    pub async fn next(&mut self) -> Result<Option<OperationLogMessage>> {
        if self.done {
            return Ok(None);
        }
        if let Some(message) = self.take() {
            return Ok(Some(message));
        }

        loop {
            let Some(live) = self.live.as_mut() else {
                return Ok(None);
            };
            match live.recv().await {
                Ok(message) => {
                    self.pending.push_back(message);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => self.refill()?,
                Err(broadcast::error::RecvError::Closed) => {
                    self.live = None;
                    self.refill()?;
                }
            }
            if let Some(message) = self.take() {
                return Ok(Some(message));
            }
        }
    }
}
