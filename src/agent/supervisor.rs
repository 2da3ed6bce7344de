use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

use super::types::AgentEvent;
use crate::error::{Error, Result};
use crate::hub::{Event, Hub, Resource};
use crate::types::Server;

const CONNECT_RETRY: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(54);
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Keeps one status socket open per active server and forwards its frames to the hub.
pub struct AgentSupervisor {
    hub: Arc<Hub>,
    connected: Arc<DashMap<i64, bool>>,
    tasks: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
}

impl AgentSupervisor {
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            connected: Arc::new(DashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_connected(&self, server_id: i64) -> bool {
        self.connected.get(&server_id).is_some_and(|c| *c)
    }

    /// Starts supervision for every active server.
    pub fn start_all(&self, servers: &[Server]) {
        for server in servers {
            self.sync(server);
        }
    }

    /// (Re)starts the server's socket if it is active, stops it otherwise.
    pub fn sync(&self, server: &Server) {
        self.stop(server.id);
        if !server.is_active || self.shutdown.is_cancelled() {
            return;
        }

        let token = self.shutdown.child_token();
        self.tasks.lock().insert(server.id, token.clone());
        tokio::spawn(supervise(
            server.clone(),
            self.hub.clone(),
            self.connected.clone(),
            token,
        ));
    }

    pub fn stop(&self, server_id: i64) {
        if let Some(token) = self.tasks.lock().remove(&server_id) {
            token.cancel();
        }
        self.connected.remove(&server_id);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.lock().clear();
        self.connected.clear();
    }
}

async fn supervise(
    server: Server,
    hub: Arc<Hub>,
    connected: Arc<DashMap<i64, bool>>,
    cancel: CancellationToken,
) {
    let server_id = server.id;
    connected.insert(server_id, false);

    while !cancel.is_cancelled() {
        let delay = match run_session(&server, &hub, &connected, &cancel).await {
            Ok(()) => RECONNECT_DELAY,
            Err(SessionEnd::ConnectFailed(e)) => {
                tracing::debug!(server_id, "Agent status socket connect failed: {e}");
                CONNECT_RETRY
            }
            Err(SessionEnd::Dropped(e)) => {
                tracing::warn!(server_id, "Agent status socket dropped: {e}");
                RECONNECT_DELAY
            }
        };
        if !cancel.is_cancelled() {
            connected.insert(server_id, false);
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }
    }

    tracing::debug!(server_id, "Agent supervision stopped");
}

enum SessionEnd {
    ConnectFailed(Error),
    Dropped(Error),
}

fn status_url(server: &Server) -> String {
    format!("ws://{}:{}/ws/agent/status", server.host, server.port)
}

async fn run_session(
    server: &Server,
    hub: &Hub,
    connected: &DashMap<i64, bool>,
    cancel: &CancellationToken,
) -> std::result::Result<(), SessionEnd> {
    let mut request = status_url(server)
        .into_client_request()
        .map_err(|e| SessionEnd::ConnectFailed(Error::Agent(e.to_string())))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", server.access_token))
        .map_err(|_| SessionEnd::ConnectFailed(Error::Agent("invalid access token".into())))?;
    request.headers_mut().insert("Authorization", bearer);

    let (socket, _) = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        result = tokio_tungstenite::connect_async(request) => {
            result.map_err(|e| SessionEnd::ConnectFailed(Error::Agent(e.to_string())))?
        }
    };

    connected.insert(server.id, true);
    tracing::info!(server_id = server.id, "Agent status socket connected");

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut deadline = Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = ping.tick() => {
                sink.send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| SessionEnd::Dropped(Error::Agent(e.to_string())))?;
            }
            () = sleep_until(deadline) => {
                return Err(SessionEnd::Dropped(Error::Agent("read deadline exceeded".into())));
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    return Err(SessionEnd::Dropped(Error::Agent("connection closed".into())));
                };
                let frame = frame.map_err(|e| SessionEnd::Dropped(Error::Agent(e.to_string())))?;
                deadline = Instant::now() + READ_DEADLINE;

                match frame {
                    Message::Text(text) => forward(server.id, &text, hub),
                    Message::Close(_) => {
                        return Err(SessionEnd::Dropped(Error::Agent("closed by agent".into())));
                    }
                    _ => {}
                }
            }
        }
    }
}

fn forward(server_id: i64, text: &str, hub: &Hub) {
    match serde_json::from_str::<AgentEvent>(text) {
        Ok(event) => {
            if let Some(event) = to_hub_event(server_id, event) {
                hub.publish(&event);
            }
        }
        Err(e) => tracing::debug!(server_id, "Ignoring malformed agent frame: {e}"),
    }
}

/// Stamps the server onto an agent frame and routes it to a hub resource.
pub fn to_hub_event(server_id: i64, event: AgentEvent) -> Option<Event> {
    let resource = match event.kind.as_str() {
        "container_status" | "stack_status" => Resource::StackStatus,
        "operation_progress" => Resource::Operations,
        "logs" | "container_logs" => Resource::Logs,
        other => {
            tracing::debug!(server_id, kind = other, "Ignoring unknown agent event");
            return None;
        }
    };

    Some(Event {
        resource,
        stack_name: event.stack_name().map(str::to_string),
        operation_id: event.operation_id().map(str::to_string),
        event: event.kind,
        server_id,
        data: event.data,
    })
}

/// Maps a server to the terminal endpoint the relay dials.
pub fn terminal_url(server: &Server) -> String {
    format!("ws://{}:{}/ws/terminal", server.host, server.port)
}

/// Opens an authenticated socket to an agent endpoint.
pub async fn dial(
    url: &str,
    access_token: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Agent(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|_| Error::Agent("invalid access token".into()))?;
    request.headers_mut().insert("Authorization", bearer);

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Agent(e.to_string()))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::rbac::{Rbac, Subject};
    use crate::store::{ADMIN_ROLE_NAME, SqliteStore, Store};

    #[test]
    fn test_event_routing() {
        let event = AgentEvent {
            kind: "operation_progress".into(),
            data: json!({"stack_name": "web", "operation_id": "op-1"}),
        };
        let routed = to_hub_event(4, event).unwrap();
        assert_eq!(routed.resource, Resource::Operations);
        assert_eq!(routed.server_id, 4);
        assert_eq!(routed.operation_id.as_deref(), Some("op-1"));

        let unknown = AgentEvent {
            kind: "heartbeat".into(),
            data: json!({}),
        };
        assert!(to_hub_event(4, unknown).is_none());
    }

    #[tokio::test]
    async fn test_forwards_frames_and_tracks_connection() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let admin = store.create_user("root", "", "hash").unwrap().id;
        let role = store.get_role_by_name(ADMIN_ROLE_NAME).unwrap().unwrap();
        store.assign_role(admin, role.id).unwrap();

        let hub = Arc::new(Hub::new(Arc::new(Rbac::new(store))));
        let (conn, mut rx) = hub.connect(Subject::user(admin));
        hub.subscribe(
            &conn,
            crate::hub::SubscriptionKey {
                resource: Resource::StackStatus,
                server_id: 9,
                scope: crate::hub::Scope::Server,
            },
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                json!({"type": "stack_status", "data": {"stack_name": "web", "status": "up"}})
                    .to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let supervisor = AgentSupervisor::new(hub.clone());
        let server = Server {
            id: 9,
            name: "local".into(),
            description: String::new(),
            host: addr.ip().to_string(),
            port: addr.port(),
            skip_ssl_verification: false,
            access_token: "agent-token".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        supervisor.sync(&server);

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["server_id"], 9);
        assert_eq!(frame["stack_name"], "web");
        assert!(supervisor.is_connected(9));

        supervisor.stop(9);
        assert!(!supervisor.is_connected(9));
    }
}
