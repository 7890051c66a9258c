//! Routes queued messages to a single live connection.

use std::sync::Arc;

use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    connection::ConnectionId,
    message::Message,
    registry::ConnectionRegistry,
};

/// Picks the single connection that should receive `message` and queues it
/// there.
///
/// A message with a `target` goes to the oldest connection whose name
/// matches it, ignoring case. A message without one goes to the oldest
/// live connection; untargeted sends are unicast, not broadcast. Returns
/// the chosen connection, or `None` if the message was dropped.
pub fn route(connections: &ConnectionRegistry, message: Message) -> Option<ConnectionId> {
    let destination = match message.target() {
        Some(target) => connections.find_by_name(&target),
        None => connections.first(),
    };

    match destination {
        Some(connection) => {
            let id = connection.id();
            connection.enqueue(message);
            Some(id)
        }
        None => {
            debug!(
                routing_target = ?message.target(),
                live = connections.len(),
                "dropping message with no matching connection"
            );
            None
        }
    }
}

/// Drains the relay-wide outbound queue in FIFO order until cancelled.
/// Anything still queued at that point is dropped with the receiver.
pub async fn run_dispatcher(
    mut queue: mpsc::UnboundedReceiver<Message>,
    connections: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => {
                    if let Some(connection_id) = route(&connections, message) {
                        trace!(connection_id, "message dispatched");
                    }
                }
                None => break,
            },
        }
    }
    debug!(discarded = queue.len(), "dispatcher stopped");
}
