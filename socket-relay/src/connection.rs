//! One accepted client socket.
//!
//! Each connection runs as a single task that drives its read path and its
//! write path concurrently. Whichever finishes first (EOF, I/O error, or
//! cancellation) ends the task and closes the connection.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    frame::{FrameReader, write_message},
    message::{Message, names_match},
};

pub type ConnectionId = u64;

/// Receives what a connection's read path produces.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_inbound(&self, connection_id: ConnectionId, message: Message);

    /// Called once, after the connection has been marked closed.
    fn on_closed(&self, connection_id: ConnectionId);
}

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    name: RwLock<Option<String>>,
    outbound: mpsc::UnboundedSender<Message>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    /// Creates the connection record and the receiving end of its outbound
    /// queue, which the write path consumes.
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            peer,
            name: RwLock::new(None),
            outbound,
            connected: AtomicBool::new(true),
            cancel,
        };
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    pub fn name_matches(&self, target: &str) -> bool {
        self.name
            .read()
            .as_deref()
            .is_some_and(|name| names_match(name, target))
    }

    /// Queues a message for the write path. Never blocks; once the
    /// connection is closed the message is silently discarded.
    pub fn enqueue(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!(connection_id = self.id, "dropping message for closed connection");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and stops its task. Returns `false` if it
    /// was already closed.
    pub fn close(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.cancel.cancel();
        was_connected
    }
}

#[derive(Debug)]
enum CloseReason {
    Cancelled,
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

impl CloseReason {
    fn error(&self) -> Option<&io::Error> {
        match self {
            CloseReason::ReadFailed(err) | CloseReason::WriteFailed(err) => Some(err),
            CloseReason::Cancelled | CloseReason::PeerClosed => None,
        }
    }
}

/// Runs the connection until either path ends, then closes it and notifies
/// the handler. The socket is closed when both halves drop here.
pub async fn serve_connection<H>(
    connection: Arc<Connection>,
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<Message>,
    handler: Arc<H>,
    max_frame_len: Option<usize>,
) where
    H: InboundHandler,
{
    let (reader, writer) = stream.into_split();
    let reader = FrameReader::with_max_frame_len(reader, max_frame_len);
    let cancel = connection.cancel.clone();

    let reason = select! {
        _ = cancel.cancelled() => CloseReason::Cancelled,
        reason = read_path(connection.id, reader, handler.as_ref()) => reason,
        reason = write_path(writer, outbound) => reason,
    };

    connection.close();
    handler.on_closed(connection.id);
    info!(
        connection_id = connection.id,
        peer = ?connection.peer,
        ?reason,
        error = ?reason.error(),
        "connection closed"
    );
}

async fn read_path<H>(
    connection_id: ConnectionId,
    mut reader: FrameReader<OwnedReadHalf>,
    handler: &H,
) -> CloseReason
where
    H: InboundHandler,
{
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => handler.on_inbound(connection_id, message),
            Ok(None) => return CloseReason::PeerClosed,
            Err(err) => return CloseReason::ReadFailed(err),
        }
    }
}

async fn write_path(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> CloseReason {
    // The connection holds the sender, so the queue only ends on cancellation.
    while let Some(message) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            return CloseReason::WriteFailed(err);
        }
    }
    CloseReason::Cancelled
}
