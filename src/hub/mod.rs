//! Fan-out of agent and operation events to client WebSockets.
//!
//! Subscriber lists are copy-on-publish: publishing clones an `Arc` of the list under
//! a read lock and delivers without holding it. Each connection has a bounded queue;
//! a full queue closes that connection instead of stalling the publisher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rbac::{Rbac, Subject, Target};
use crate::types::Permission;

pub const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    StackStatus,
    Operations,
    Logs,
}

impl Resource {
    /// Permission a subscriber must hold on an event's stack.
    fn permission(self) -> Permission {
        match self {
            Resource::StackStatus | Resource::Logs => Permission::StacksRead,
            Resource::Operations => Permission::StacksManage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Server,
    Stack(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub resource: Resource,
    pub server_id: i64,
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub resource: Resource,
    /// Agent frame type, e.g. `container_status`.
    pub event: String,
    pub server_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub data: Value,
}

impl Event {
    fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys = vec![SubscriptionKey {
            resource: self.resource,
            server_id: self.server_id,
            scope: Scope::Server,
        }];
        if let Some(stack) = &self.stack_name {
            keys.push(SubscriptionKey {
                resource: self.resource,
                server_id: self.server_id,
                scope: Scope::Stack(stack.clone()),
            });
        }
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub action: Action,
    pub resource: Resource,
    pub server_id: i64,
    #[serde(default)]
    pub stack_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    Forbidden,
    Closed,
}

/// One client socket.
pub struct Connection {
    pub id: u64,
    subject: Subject,
    tx: mpsc::Sender<String>,
    keys: Mutex<HashSet<SubscriptionKey>>,
    closed: CancellationToken,
}

impl Connection {
    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.subject.user_id
    }

    /// Cancelled when the hub drops this connection or shuts down.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

type SubscriberList = Arc<Vec<Arc<Connection>>>;

pub struct Hub {
    rbac: Arc<Rbac>,
    subscribers: RwLock<HashMap<SubscriptionKey, SubscriberList>>,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Hub {
    #[must_use]
    pub fn new(rbac: Arc<Rbac>) -> Self {
        Self {
            rbac,
            subscribers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a client socket. Frames for it arrive on the returned receiver.
    pub fn connect(&self, subject: Subject) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let conn = Arc::new(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            subject,
            tx,
            keys: Mutex::new(HashSet::new()),
            closed: self.shutdown.child_token(),
        });
        self.connections.write().insert(conn.id, conn.clone());
        (conn, rx)
    }

    pub fn disconnect(&self, conn: &Connection) {
        conn.closed.cancel();
        self.connections.write().remove(&conn.id);

        let keys: Vec<SubscriptionKey> = conn.keys.lock().drain().collect();
        let mut subscribers = self.subscribers.write();
        for key in keys {
            remove_subscriber(&mut subscribers, &key, conn.id);
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Checks the subscribe contract for a client request.
    pub fn authorize(&self, subject: &Subject, msg: &ClientMessage) -> Result<bool> {
        if !self.rbac.can_access_server(subject, msg.server_id)? {
            return Ok(false);
        }

        let permission = msg.resource.permission();
        let target = match (&msg.resource, &msg.stack_name) {
            (Resource::Operations, _) | (_, None) => Target::Server(msg.server_id),
            (_, Some(stack)) => Target::Stack(msg.server_id, stack),
        };
        Ok(self.rbac.check(subject, target, permission)?.is_granted())
    }

    /// Applies a subscribe/unsubscribe message for a connection.
    pub fn handle(&self, conn: &Arc<Connection>, msg: &ClientMessage) -> std::result::Result<(), SubscribeError> {
        let key = SubscriptionKey {
            resource: msg.resource,
            server_id: msg.server_id,
            scope: msg
                .stack_name
                .clone()
                .map_or(Scope::Server, Scope::Stack),
        };

        match msg.action {
            Action::Subscribe => {
                let allowed = self.authorize(&conn.subject, msg).map_err(|e| {
                    tracing::error!("Subscription check failed: {e}");
                    SubscribeError::Forbidden
                })?;
                if !allowed {
                    return Err(SubscribeError::Forbidden);
                }
                self.subscribe(conn, key)
            }
            Action::Unsubscribe => {
                self.unsubscribe(conn, &key);
                Ok(())
            }
        }
    }

    /// Adds a key for a connection. Authorization is the caller's concern.
    pub fn subscribe(&self, conn: &Arc<Connection>, key: SubscriptionKey) -> std::result::Result<(), SubscribeError> {
        if conn.closed.is_cancelled() {
            return Err(SubscribeError::Closed);
        }
        if !conn.keys.lock().insert(key.clone()) {
            return Ok(());
        }

        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(key).or_default();
        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push(conn.clone());
        *list = Arc::new(next);
        Ok(())
    }

    pub fn unsubscribe(&self, conn: &Connection, key: &SubscriptionKey) {
        if conn.keys.lock().remove(key) {
            remove_subscriber(&mut self.subscribers.write(), key, conn.id);
        }
    }

    /// Delivers an event to every authorized subscriber. Returns the delivery count.
    pub fn publish(&self, event: &Event) -> usize {
        let lists: Vec<SubscriberList> = {
            let subscribers = self.subscribers.read();
            event
                .keys()
                .iter()
                .filter_map(|k| subscribers.get(k).cloned())
                .collect()
        };
        if lists.is_empty() {
            return 0;
        }

        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode hub event: {e}");
                return 0;
            }
        };

        let mut seen = HashSet::new();
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for conn in lists.iter().flat_map(|l| l.iter()) {
            if !seen.insert(conn.id) || !self.allowed(conn, event) {
                continue;
            }
            match conn.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(conn.clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => overflowed.push(conn.clone()),
            }
        }

        for conn in overflowed {
            tracing::warn!(connection = conn.id, user_id = conn.user_id(), "Dropping slow subscriber");
            self.disconnect(&conn);
        }
        delivered
    }

    /// Re-checks the subscriber against the event's own stack.
    fn allowed(&self, conn: &Connection, event: &Event) -> bool {
        let target = match &event.stack_name {
            Some(stack) => Target::Stack(event.server_id, stack),
            None => Target::Server(event.server_id),
        };
        match self.rbac.check(&conn.subject, target, event.resource.permission()) {
            Ok(access) => access.is_granted(),
            Err(e) => {
                tracing::error!("Fan-out authorization failed: {e}");
                false
            }
        }
    }

    /// Closes every client socket.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.subscribers.write().clear();
        self.connections.write().clear();
    }
}

fn remove_subscriber(
    subscribers: &mut HashMap<SubscriptionKey, SubscriberList>,
    key: &SubscriptionKey,
    id: u64,
) {
    let Some(list) = subscribers.get_mut(key) else {
        return;
    };
    let next: Vec<Arc<Connection>> = list.iter().filter(|c| c.id != id).cloned().collect();
    if next.is_empty() {
        subscribers.remove(key);
    } else {
        *list = Arc::new(next);
    }
}

/// A reply frame for the client, e.g. a subscription acknowledgement.
#[must_use]
pub fn control_frame(kind: &str, msg: &ClientMessage, error: Option<&str>) -> String {
    json!({
        "type": kind,
        "resource": msg.resource,
        "server_id": msg.server_id,
        "stack_name": msg.stack_name,
        "error": error,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewServer, SqliteStore, Store};

    struct Fixture {
        hub: Hub,
        user: i64,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(store);

        let user = store.create_user("viewer", "", "hash").unwrap().id;
        let role = store.create_role("web-readers", "", false).unwrap().id;
        store.assign_role(user, role).unwrap();
        let server = store
            .create_server(&NewServer {
                name: "edge".into(),
                description: String::new(),
                host: "10.0.0.2".into(),
                port: 8443,
                skip_ssl_verification: false,
                access_token: "t".into(),
                is_active: true,
            })
            .unwrap();
        let read = store.get_permission_by_name("stacks.read").unwrap().unwrap();
        store
            .add_stack_permission(server.id, role, read.id, "web-*")
            .unwrap();

        Fixture {
            hub: Hub::new(Arc::new(Rbac::new(store))),
            user,
        }
    }

    fn status_event(stack: &str) -> Event {
        Event {
            resource: Resource::StackStatus,
            event: "stack_status".into(),
            server_id: 1,
            stack_name: Some(stack.into()),
            operation_id: None,
            data: json!({"stack_name": stack, "status": "running"}),
        }
    }

    fn subscribe_msg(stack: Option<&str>) -> ClientMessage {
        ClientMessage {
            action: Action::Subscribe,
            resource: Resource::StackStatus,
            server_id: 1,
            stack_name: stack.map(str::to_string),
        }
    }

    #[test]
    fn test_server_subscription_rechecks_event_stack() {
        let f = fixture();
        let (conn, mut rx) = f.hub.connect(Subject::user(f.user));
        f.hub.handle(&conn, &subscribe_msg(None)).unwrap();

        assert_eq!(f.hub.publish(&status_event("web-api")), 1);
        assert_eq!(f.hub.publish(&status_event("db-main")), 0);

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "stack_status");
        assert_eq!(frame["stack_name"], "web-api");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_denied_for_unmatched_stack() {
        let f = fixture();
        let (conn, _rx) = f.hub.connect(Subject::user(f.user));
        assert_eq!(
            f.hub.handle(&conn, &subscribe_msg(Some("db-main"))),
            Err(SubscribeError::Forbidden)
        );

        let ops = ClientMessage {
            resource: Resource::Operations,
            ..subscribe_msg(None)
        };
        assert_eq!(f.hub.handle(&conn, &ops), Err(SubscribeError::Forbidden));
    }

    #[test]
    fn test_operation_events_route_by_server_and_stack() {
        let event = Event {
            resource: Resource::Operations,
            event: "operation_progress".into(),
            server_id: 1,
            stack_name: Some("web-api".into()),
            operation_id: Some("op-1".into()),
            data: json!({}),
        };
        let scopes: Vec<Scope> = event.keys().into_iter().map(|k| k.scope).collect();
        assert_eq!(scopes, vec![Scope::Server, Scope::Stack("web-api".into())]);
    }

    #[test]
    fn test_overlapping_keys_deliver_once() {
        let f = fixture();
        let (conn, mut rx) = f.hub.connect(Subject::user(f.user));
        f.hub.handle(&conn, &subscribe_msg(None)).unwrap();
        f.hub.handle(&conn, &subscribe_msg(Some("web-api"))).unwrap();

        assert_eq!(f.hub.publish(&status_event("web-api")), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_slow_consumer_is_dropped() {
        let f = fixture();
        let (conn, _rx) = f.hub.connect(Subject::user(f.user));
        f.hub.handle(&conn, &subscribe_msg(None)).unwrap();

        for _ in 0..QUEUE_CAPACITY {
            assert_eq!(f.hub.publish(&status_event("web-api")), 1);
        }
        assert_eq!(f.hub.publish(&status_event("web-api")), 0);
        assert!(conn.closed().is_cancelled());
        assert_eq!(f.hub.connection_count(), 0);
        assert_eq!(f.hub.publish(&status_event("web-api")), 0);
    }

    #[test]
    fn test_unsubscribe_and_close() {
        let f = fixture();
        let (conn, _rx) = f.hub.connect(Subject::user(f.user));
        f.hub.handle(&conn, &subscribe_msg(None)).unwrap();
        f.hub
            .handle(
                &conn,
                &ClientMessage {
                    action: Action::Unsubscribe,
                    ..subscribe_msg(None)
                },
            )
            .unwrap();
        assert_eq!(f.hub.publish(&status_event("web-api")), 0);

        f.hub.close();
        assert!(conn.closed().is_cancelled());
    }
}
