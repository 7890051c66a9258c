//! Correlation of reply-requested sends with the client replies that answer
//! them.
//!
//! Each pending `replyId` owns a `oneshot` sender. Resolving removes the entry
//! before completing it, so an id can be resolved at most once. The waiting
//! side holds a [`ReplyWaiter`] that deletes its own entry when dropped, which
//! covers timeouts and callers that stop waiting.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{error::SendError, message::Message};

type ReplyResult = Result<Message, SendError>;

struct Pending {
    // Distinguishes this registration from a later one reusing the same id.
    ticket: u64,
    sender: oneshot::Sender<ReplyResult>,
}

#[derive(Default)]
pub struct ReplyTable {
    waiters: Mutex<HashMap<String, Pending>>,
    next_ticket: AtomicU64,
}

impl ReplyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `reply_id`, or returns `None` if one is
    /// already pending under that id.
    pub fn register(&self, reply_id: impl Into<String>) -> Option<ReplyWaiter<'_>> {
        let reply_id = reply_id.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&reply_id) {
            return None;
        }
        waiters.insert(reply_id.clone(), Pending { ticket, sender });

        Some(ReplyWaiter {
            table: self,
            reply_id,
            ticket,
            receiver,
        })
    }

    /// Delivers `message` to the waiter for `reply_id`. Returns `false` when
    /// nobody is waiting (never registered, already resolved, or given up).
    pub fn resolve(&self, reply_id: &str, message: Message) -> bool {
        self.complete(reply_id, Ok(message))
    }

    /// Drops the waiter for `reply_id` without resolving it.
    pub fn discard(&self, reply_id: &str) -> bool {
        self.waiters.lock().remove(reply_id).is_some()
    }

    /// Fails every pending waiter with `error`, leaving the table empty.
    /// Returns how many waiters were failed.
    pub fn fail_all(&self, error: SendError) -> usize {
        let drained: Vec<Pending> = self.waiters.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.sender.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, reply_id: &str) -> bool {
        self.waiters.lock().contains_key(reply_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    fn complete(&self, reply_id: &str, result: ReplyResult) -> bool {
        let pending = self.waiters.lock().remove(reply_id);
        match pending {
            Some(pending) => pending.sender.send(result).is_ok(),
            None => false,
        }
    }

    fn release(&self, reply_id: &str, ticket: u64) {
        let mut waiters = self.waiters.lock();
        if waiters
            .get(reply_id)
            .is_some_and(|pending| pending.ticket == ticket)
        {
            waiters.remove(reply_id);
        }
    }
}

/// The waiting half of a registered reply.
pub struct ReplyWaiter<'a> {
    table: &'a ReplyTable,
    reply_id: String,
    ticket: u64,
    receiver: oneshot::Receiver<ReplyResult>,
}

impl ReplyWaiter<'_> {
    pub fn reply_id(&self) -> &str {
        &self.reply_id
    }

    /// Waits up to `timeout` for the reply. The entry is gone from the table
    /// once this returns, whatever the outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, SendError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::NoReply),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

impl Drop for ReplyWaiter<'_> {
    fn drop(&mut self) {
        self.table.release(&self.reply_id, self.ticket);
    }
}
