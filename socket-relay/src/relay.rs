//! The host-facing relay: lifecycle, `send`, and inbound control handling.
//!
//! All state belongs to a [`Relay`] value. `initialize` builds a fresh set of
//! registries and starts the acceptor and dispatcher tasks; `shutdown` fails
//! every pending reply, cancels every task and waits for them to finish.
//! Several relays can run side by side in one process.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    connection::{Connection, ConnectionId, InboundHandler, serve_connection},
    dispatcher::run_dispatcher,
    error::{RelayError, SendError},
    message::{Message, TYPE_REPLY, TYPE_SET_NAME},
    registry::ConnectionRegistry,
    reply::ReplyTable,
};

/// An application message received from a client, published to
/// [`Relay::subscribe`] receivers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: ConnectionId,
    pub name: Option<String>,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: Option<String>,
    pub peer: Option<SocketAddr>,
}

pub struct Relay {
    config: RelayConfig,
    // Serializes initialize/shutdown; held across their awaits only.
    lifecycle: Mutex<Option<Running>>,
    // Read by `send` without touching the lifecycle lock.
    active: RwLock<Option<Arc<Active>>>,
    events: broadcast::Sender<InboundMessage>,
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

struct Active {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl Active {
    fn enqueue(&self, message: Message) -> Result<(), SendError> {
        self.queue
            .send(message)
            .map_err(|_| SendError::Failed("outbound queue is closed".into()))
    }
}

/// State shared between the relay, its acceptor, dispatcher and connections.
struct Shared {
    connections: Arc<ConnectionRegistry>,
    replies: ReplyTable,
    events: broadcast::Sender<InboundMessage>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            lifecycle: Mutex::new(None),
            active: RwLock::new(None),
            events,
        }
    }

    /// Binds `port` and starts accepting clients. Calling it again while
    /// running does nothing and returns the address already in use.
    pub async fn initialize(&self, port: u16) -> Result<SocketAddr, RelayError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            debug!(local_addr = %running.local_addr, "relay already running");
            return Ok(running.local_addr);
        }

        let addr = SocketAddr::new(self.config.bind_address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let shared = Arc::new(Shared {
            connections: Arc::new(ConnectionRegistry::new()),
            replies: ReplyTable::new(),
            events: self.events.clone(),
        });
        let (queue, queue_rx) = mpsc::unbounded_channel();

        tasks.spawn(run_dispatcher(
            queue_rx,
            Arc::clone(&shared.connections),
            cancel.clone(),
        ));
        tasks.spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            tasks.clone(),
            cancel.clone(),
            self.config.max_frame_len,
        ));

        *self.active.write() = Some(Arc::new(Active {
            shared,
            queue,
            cancel: cancel.clone(),
            local_addr,
        }));
        *lifecycle = Some(Running {
            local_addr,
            cancel,
            tasks,
        });

        info!(%local_addr, "relay listening");
        Ok(local_addr)
    }

    /// Stops the relay. Pending replies fail with `socket_shutdown`, every
    /// connection is closed and queued messages are dropped. A no-op when
    /// the relay is not running.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            debug!("shutdown requested while relay is stopped");
            return;
        };

        let active = self.active.write().take();
        if let Some(active) = active {
            let failed = active.shared.replies.fail_all(SendError::Shutdown);
            let closed = active.shared.connections.drain();
            for connection in &closed {
                connection.close();
            }
            info!(
                pending_replies = failed,
                connections = closed.len(),
                "relay shutting down"
            );
        }

        running.cancel.cancel();
        running.tasks.close();
        running.tasks.wait().await;
        info!(local_addr = %running.local_addr, "relay stopped");
    }

    pub fn is_running(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.read().as_ref().map(|active| active.local_addr)
    }

    /// Publishes `message` to one connected client.
    ///
    /// With `wants_reply` the call waits for the client's `reply` (or a
    /// timeout) and returns it. Without it the message is queued and `None`
    /// comes back immediately. Failures are returned as a
    /// `{"status", "message"}` object rather than an error.
    pub async fn send(&self, message: &Value, wants_reply: bool) -> Option<Message> {
        match self.try_send(message, wants_reply).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(status = err.status(), error = %err, "send failed");
                Some(err.into_response())
            }
        }
    }

    /// Typed form of [`Relay::send`].
    pub async fn try_send(
        &self,
        message: &Value,
        wants_reply: bool,
    ) -> Result<Option<Message>, SendError> {
        let mut payload = match message {
            Value::Null => return Err(SendError::InvalidMessage("message is null".into())),
            other => Message::from_value(other.clone()).ok_or_else(|| {
                SendError::InvalidMessage("message must be a JSON object".into())
            })?,
        };

        let active = self.active.read().clone().ok_or(SendError::NotRunning)?;

        if !wants_reply {
            active.enqueue(payload)?;
            return Ok(None);
        }

        let reply_id = match payload.reply_id_value() {
            None => Uuid::new_v4().to_string(),
            Some(Value::String(id)) => id.clone(),
            Some(_) => {
                return Err(SendError::InvalidMessage(
                    "replyId must be a string".into(),
                ));
            }
        };
        payload.set_reply_id(reply_id.clone());

        let waiter = active
            .shared
            .replies
            .register(reply_id.as_str())
            .ok_or_else(|| SendError::Failed(format!("reply {reply_id} is already pending")))?;
        active.enqueue(payload)?;
        debug!(reply_id = %reply_id, "waiting for reply");

        select! {
            biased;
            reply = waiter.wait(self.config.reply_timeout) => reply.map(Some),
            // Shutdown fails pending waiters first; one registered after that
            // sweep still reports the shutdown.
            _ = active.cancel.cancelled() => Err(SendError::Shutdown),
        }
    }

    /// Receives application messages (anything other than `set_name` and
    /// `reply`) from every client.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.events.subscribe()
    }

    /// Live connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let Some(active) = self.active.read().clone() else {
            return Vec::new();
        };
        active
            .shared
            .connections
            .snapshot()
            .iter()
            .map(|connection| ConnectionInfo {
                id: connection.id(),
                name: connection.name(),
                peer: connection.peer(),
            })
            .collect()
    }

    pub fn pending_replies(&self) -> usize {
        self.active
            .read()
            .as_ref()
            .map_or(0, |active| active.shared.replies.len())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl InboundHandler for Shared {
    fn on_inbound(&self, connection_id: ConnectionId, message: Message) {
        let kind = message.kind().map(str::to_ascii_lowercase);
        match kind.as_deref() {
            Some(TYPE_SET_NAME) => {
                let Some(connection) = self.connections.get(connection_id) else {
                    return;
                };
                let name = message.name();
                info!(connection_id, name = ?name, "connection named");
                connection.set_name(name);
            }
            Some(TYPE_REPLY) => {
                let Some(reply_id) = message.reply_id().map(str::to_owned) else {
                    debug!(connection_id, "dropping reply without replyId");
                    return;
                };
                if !self.replies.resolve(&reply_id, message) {
                    debug!(connection_id, reply_id = %reply_id, "dropping reply nobody is waiting for");
                }
            }
            _ => {
                let name = self
                    .connections
                    .get(connection_id)
                    .and_then(|connection| connection.name());
                // No subscribers is not an error.
                let _ = self.events.send(InboundMessage {
                    connection_id,
                    name,
                    message,
                });
            }
        }
    }

    fn on_closed(&self, connection_id: ConnectionId) {
        self.connections.remove(connection_id);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    max_frame_len: Option<usize>,
) {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    spawn_connection(stream, peer, &shared, &tasks, &cancel, max_frame_len);
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            },
        }
    }
    debug!("acceptor stopped");
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<Shared>,
    tasks: &TaskTracker,
    cancel: &CancellationToken,
    max_frame_len: Option<usize>,
) {
    let id = shared.connections.next_id();
    let (connection, outbound) = Connection::new(id, Some(peer), cancel.child_token());
    let connection = Arc::new(connection);
    shared.connections.insert(Arc::clone(&connection));
    info!(connection_id = id, %peer, "client connected");

    tasks.spawn(serve_connection(
        connection,
        stream,
        outbound,
        Arc::clone(shared),
        max_frame_len,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(8);
        Shared {
            connections: Arc::new(ConnectionRegistry::new()),
            replies: ReplyTable::new(),
            events,
        }
    }

    fn add(shared: &Shared) -> Arc<Connection> {
        let (connection, _outbound) = Connection::new(
            shared.connections.next_id(),
            None,
            CancellationToken::new(),
        );
        let connection = Arc::new(connection);
        shared.connections.insert(Arc::clone(&connection));
        connection
    }

    fn message(value: Value) -> Message {
        Message::from_value(value).expect("object")
    }

    #[test]
    fn set_name_updates_the_connection() {
        let shared = shared();
        let connection = add(&shared);

        shared.on_inbound(
            connection.id(),
            message(json!({"type": "set_name", "name": "Alice"})),
        );
        assert_eq!(connection.name().as_deref(), Some("Alice"));

        shared.on_inbound(
            connection.id(),
            message(json!({"type": "SET_NAME", "name": "Bob"})),
        );
        assert_eq!(connection.name().as_deref(), Some("Bob"));

        shared.on_inbound(
            connection.id(),
            message(json!({"type": "set_name", "name": 7})),
        );
        assert_eq!(connection.name().as_deref(), Some("7"));

        shared.on_inbound(connection.id(), message(json!({"type": "set_name"})));
        assert_eq!(connection.name(), None);
    }

    #[tokio::test]
    async fn reply_resolves_the_matching_waiter_once() {
        let shared = shared();
        let connection = add(&shared);
        let waiter = shared.replies.register("r-1").expect("fresh id");

        let reply = message(json!({"type": "reply", "replyId": "r-1", "ok": true}));
        shared.on_inbound(connection.id(), reply.clone());
        shared.on_inbound(connection.id(), reply.clone());

        assert_eq!(waiter.wait(Duration::from_secs(1)).await, Ok(reply));
        assert!(shared.replies.is_empty());
    }

    #[test]
    fn reply_without_id_is_dropped() {
        let shared = shared();
        let connection = add(&shared);
        let _waiter = shared.replies.register("r-1").expect("fresh id");

        shared.on_inbound(connection.id(), message(json!({"type": "reply"})));
        assert!(shared.replies.contains("r-1"));
    }

    #[test]
    fn application_messages_are_published() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        let connection = add(&shared);
        connection.set_name(Some("alice".into()));

        let chat = message(json!({"type": "chat", "text": "hi"}));
        shared.on_inbound(connection.id(), chat.clone());

        let event = events.try_recv().expect("event");
        assert_eq!(event.connection_id, connection.id());
        assert_eq!(event.name.as_deref(), Some("alice"));
        assert_eq!(event.message, chat);
    }

    #[test]
    fn closed_connections_leave_the_registry() {
        let shared = shared();
        let connection = add(&shared);
        shared.on_closed(connection.id());
        assert!(shared.connections.is_empty());
    }

    #[tokio::test]
    async fn send_rejects_bad_input_before_checking_lifecycle() {
        let relay = Relay::default();

        let response = relay.send(&Value::Null, false).await.expect("error");
        assert_eq!(response.status(), Some("invalid_message"));

        let response = relay.send(&json!("text"), true).await.expect("error");
        assert_eq!(response.status(), Some("invalid_message"));

        let response = relay.send(&json!({"type": "ping"}), false).await.expect("error");
        assert_eq!(response.status(), Some("socket_not_running"));
    }

    #[tokio::test]
    async fn waiter_cancelled_after_the_shutdown_sweep_reports_shutdown() {
        let relay = Arc::new(Relay::new(RelayConfig {
            bind_address: std::net::Ipv4Addr::LOCALHOST.into(),
            reply_timeout: Duration::from_secs(30),
            ..RelayConfig::default()
        }));
        relay.initialize(0).await.expect("bind");

        let sender = Arc::clone(&relay);
        let pending =
            tokio::spawn(async move { sender.send(&json!({"type": "job"}), true).await });
        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.pending_replies() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("waiter registered");

        // Cancel without failing the waiter, as when it registers after the sweep.
        let active = relay.active.read().clone().expect("running");
        active.cancel.cancel();

        let response = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("send returns")
            .expect("send task")
            .expect("error response");
        assert_eq!(response.status(), Some("socket_shutdown"));
        assert_eq!(relay.pending_replies(), 0);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_without_initialize_is_a_no_op() {
        let relay = Relay::default();
        relay.shutdown().await;
        relay.shutdown().await;
        assert!(!relay.is_running());
        assert!(relay.connections().is_empty());
        assert_eq!(relay.pending_replies(), 0);
    }
}
