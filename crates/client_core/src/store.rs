//! Normalized message store and the per-message status state machine.
//!
//! [`MessageStore::apply`] is the only mutation entry point. At runtime the store
//! lives behind [`StoreHandle`], whose update loop is the single writer; screens
//! and other components only read snapshots or subscribe to [`StoreEvent`]s.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::domain::{
    Message, MessageExtras, MessageId, MessageStatus, Sender, Thread, ThreadId, ThreadKind, UserId,
};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub enum StoreCommand {
    CreateLocal {
        thread_id: ThreadId,
        kind: ThreadKind,
        text: String,
        sender: Sender,
        extras: MessageExtras,
    },
    ConfirmSent {
        local_id: MessageId,
        server_id: Option<MessageId>,
    },
    MarkDelivered {
        id: MessageId,
    },
    MarkSeen {
        id: MessageId,
        seen_by: Vec<UserId>,
    },
    MarkFailed {
        id: MessageId,
    },
    /// User-initiated resend of a failed message.
    Resend {
        id: MessageId,
    },
    Ingest {
        thread_id: ThreadId,
        kind: Option<ThreadKind>,
        message: Message,
    },
    PrependHistory {
        thread_id: ThreadId,
        kind: ThreadKind,
        /// Oldest first.
        messages: Vec<Message>,
    },
    ClearThread {
        thread_id: ThreadId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    MessageAdded {
        thread_id: ThreadId,
        message: Message,
    },
    MessageUpdated {
        thread_id: ThreadId,
        message: Message,
    },
    MessageRekeyed {
        thread_id: ThreadId,
        old_id: MessageId,
        new_id: MessageId,
    },
    HistoryPrepended {
        thread_id: ThreadId,
        message_ids: Vec<MessageId>,
    },
    ThreadCleared {
        thread_id: ThreadId,
    },
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<MessageId, Message>,
    threads: HashMap<ThreadId, Thread>,
    owners: HashMap<MessageId, ThreadId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads.get(thread_id)
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Messages of a thread in display order.
    pub fn thread_messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.threads
            .get(thread_id)
            .map(|thread| {
                thread
                    .messages
                    .iter()
                    .filter_map(|id| self.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies one command. An empty event list means the command was a no-op,
    /// e.g. an out-of-order status event that would have regressed a message.
    pub fn apply(&mut self, command: StoreCommand) -> Result<Vec<StoreEvent>, StoreError> {
        match command {
            StoreCommand::CreateLocal {
                thread_id,
                kind,
                text,
                sender,
                extras,
            } => Ok(self.create_local(thread_id, kind, text, sender, extras)),
            StoreCommand::ConfirmSent {
                local_id,
                server_id,
            } => self.confirm_sent(local_id, server_id),
            StoreCommand::MarkDelivered { id } => {
                Ok(self.advance(&id, MessageStatus::Delivered, Vec::new()))
            }
            StoreCommand::MarkSeen { id, seen_by } => {
                Ok(self.advance(&id, MessageStatus::Seen, seen_by))
            }
            StoreCommand::MarkFailed { id } => {
                Ok(self.advance(&id, MessageStatus::Failed, Vec::new()))
            }
            StoreCommand::Resend { id } => self.resend(id),
            StoreCommand::Ingest {
                thread_id,
                kind,
                message,
            } => Ok(self.ingest(thread_id, kind, message)),
            StoreCommand::PrependHistory {
                thread_id,
                kind,
                messages,
            } => Ok(self.prepend_history(thread_id, kind, messages)),
            StoreCommand::ClearThread { thread_id } => Ok(self.clear_thread(thread_id)),
        }
    }

    fn ensure_thread(&mut self, thread_id: &ThreadId, kind: ThreadKind) -> &mut Thread {
        self.threads
            .entry(thread_id.clone())
            .or_insert_with(|| Thread::new(thread_id.clone(), kind))
    }

    fn create_local(
        &mut self,
        thread_id: ThreadId,
        kind: ThreadKind,
        text: String,
        sender: Sender,
        extras: MessageExtras,
    ) -> Vec<StoreEvent> {
        let message = Message {
            id: MessageId::new_local(),
            text,
            created_at: Utc::now(),
            sender_id: sender.id,
            sender_name: sender.name,
            avatar: sender.avatar,
            status: MessageStatus::Sending,
            seen_by: None,
            reply_to: extras.reply_to,
            media_uri: extras.media_uri,
            mime_type: extras.mime_type,
            duration_ms: extras.duration_ms,
        };
        self.ensure_thread(&thread_id, kind)
            .messages
            .push(message.id.clone());
        self.owners.insert(message.id.clone(), thread_id.clone());
        self.messages.insert(message.id.clone(), message.clone());
        vec![StoreEvent::MessageAdded { thread_id, message }]
    }

    fn confirm_sent(
        &mut self,
        local_id: MessageId,
        server_id: Option<MessageId>,
    ) -> Result<Vec<StoreEvent>, StoreError> {
        let Some(local) = self.messages.get(&local_id) else {
            debug!(%local_id, "store: ack for unknown message ignored");
            return Ok(Vec::new());
        };
        if local.status != MessageStatus::Sending {
            debug!(%local_id, status = ?local.status, "store: late ack ignored");
            return Ok(Vec::new());
        }
        let Some(thread_id) = self.owners.get(&local_id).cloned() else {
            return Ok(Vec::new());
        };
        let (sender_id, text) = (local.sender_id.clone(), local.text.clone());

        let target_id = match server_id {
            Some(id) if id != local_id => id,
            _ => local_id.clone(),
        };
        let mut events = Vec::new();
        let mut echoed_status = None;

        if target_id != local_id {
            if let Some(existing) = self.messages.get(&target_id) {
                // The realtime echo of our own send may beat the ack.
                let is_own_echo = self.owners.get(&target_id) == Some(&thread_id)
                    && existing.sender_id == sender_id
                    && existing.text == text;
                if !is_own_echo {
                    warn!(%local_id, server_id = %target_id, "store: server id collides with existing message");
                    return Err(StoreError::IdCollision {
                        local_id,
                        server_id: target_id,
                    });
                }
                echoed_status = self.messages.remove(&target_id).map(|echo| echo.status);
                self.owners.remove(&target_id);
                if let Some(thread) = self.threads.get_mut(&thread_id) {
                    thread.messages.retain(|id| *id != target_id);
                }
            }

            let Some(mut message) = self.messages.remove(&local_id) else {
                return Ok(Vec::new());
            };
            message.id = target_id.clone();
            self.messages.insert(target_id.clone(), message);
            self.owners.remove(&local_id);
            self.owners.insert(target_id.clone(), thread_id.clone());
            if let Some(thread) = self.threads.get_mut(&thread_id) {
                if let Some(slot) = thread.messages.iter_mut().find(|id| **id == local_id) {
                    *slot = target_id.clone();
                }
            }
            events.push(StoreEvent::MessageRekeyed {
                thread_id: thread_id.clone(),
                old_id: local_id,
                new_id: target_id.clone(),
            });
        }

        if let Some(message) = self.messages.get_mut(&target_id) {
            message.status = MessageStatus::Sent;
            if let Some(status) = echoed_status {
                if message.status.can_advance_to(status) {
                    message.status = status;
                }
            }
            events.push(StoreEvent::MessageUpdated {
                thread_id,
                message: message.clone(),
            });
        }
        Ok(events)
    }

    fn advance(
        &mut self,
        id: &MessageId,
        next: MessageStatus,
        seen_by: Vec<UserId>,
    ) -> Vec<StoreEvent> {
        let Some(message) = self.messages.get_mut(id) else {
            debug!(%id, ?next, "store: status event for unknown message ignored");
            return Vec::new();
        };

        let mut changed = false;
        if message.status.can_advance_to(next) {
            message.status = next;
            changed = true;
        } else if message.status != next {
            debug!(%id, current = ?message.status, ?next, "store: regressing transition ignored");
            return Vec::new();
        }

        if !seen_by.is_empty() {
            let readers = message.seen_by.get_or_insert_with(Vec::new);
            for reader in seen_by {
                if !readers.contains(&reader) {
                    readers.push(reader);
                    changed = true;
                }
            }
        }

        if !changed {
            return Vec::new();
        }
        let Some(thread_id) = self.owners.get(id).cloned() else {
            return Vec::new();
        };
        vec![StoreEvent::MessageUpdated {
            thread_id,
            message: message.clone(),
        }]
    }

    fn resend(&mut self, id: MessageId) -> Result<Vec<StoreEvent>, StoreError> {
        let message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::UnknownMessage(id.clone()))?;
        if message.status != MessageStatus::Failed {
            return Err(StoreError::NotResendable(id));
        }
        message.status = MessageStatus::Sending;
        let message = message.clone();
        let thread_id = self
            .owners
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownMessage(id))?;
        Ok(vec![StoreEvent::MessageUpdated { thread_id, message }])
    }

    fn ingest(
        &mut self,
        thread_id: ThreadId,
        kind: Option<ThreadKind>,
        message: Message,
    ) -> Vec<StoreEvent> {
        if self.messages.contains_key(&message.id) {
            return self.advance(&message.id, message.status, Vec::new());
        }
        let kind = kind
            .or_else(|| self.threads.get(&thread_id).map(|thread| thread.kind))
            .unwrap_or(ThreadKind::Direct);
        self.ensure_thread(&thread_id, kind)
            .messages
            .push(message.id.clone());
        self.owners.insert(message.id.clone(), thread_id.clone());
        self.messages.insert(message.id.clone(), message.clone());
        vec![StoreEvent::MessageAdded { thread_id, message }]
    }

    fn prepend_history(
        &mut self,
        thread_id: ThreadId,
        kind: ThreadKind,
        messages: Vec<Message>,
    ) -> Vec<StoreEvent> {
        let mut fresh = Vec::with_capacity(messages.len());
        for message in messages {
            if self.messages.contains_key(&message.id) {
                continue;
            }
            self.owners.insert(message.id.clone(), thread_id.clone());
            fresh.push(message.id.clone());
            self.messages.insert(message.id.clone(), message);
        }
        let thread = self.ensure_thread(&thread_id, kind);
        if fresh.is_empty() {
            return Vec::new();
        }
        thread.messages.splice(0..0, fresh.iter().cloned());
        vec![StoreEvent::HistoryPrepended {
            thread_id,
            message_ids: fresh,
        }]
    }

    fn clear_thread(&mut self, thread_id: ThreadId) -> Vec<StoreEvent> {
        let Some(thread) = self.threads.get_mut(&thread_id) else {
            return Vec::new();
        };
        for id in thread.messages.drain(..) {
            self.messages.remove(&id);
            self.owners.remove(&id);
        }
        vec![StoreEvent::ThreadCleared { thread_id }]
    }
}

struct Envelope {
    command: StoreCommand,
    reply: Option<oneshot::Sender<Result<Vec<StoreEvent>, StoreError>>>,
}

pub type PendingApply = oneshot::Receiver<Result<Vec<StoreEvent>, StoreError>>;

/// Shared access to a store whose only writer is a background update loop.
#[derive(Clone)]
pub struct StoreHandle {
    commands: mpsc::UnboundedSender<Envelope>,
    state: Arc<RwLock<MessageStore>>,
    events: broadcast::Sender<StoreEvent>,
}

impl StoreHandle {
    /// Spawns the update loop. Must be called inside a Tokio runtime.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let state = Arc::new(RwLock::new(MessageStore::new()));
        tokio::spawn(run_update_loop(rx, Arc::clone(&state), events.clone()));
        Self {
            commands,
            state,
            events,
        }
    }

    /// Applies a command and waits until it has been committed.
    pub async fn apply(&self, command: StoreCommand) -> Result<Vec<StoreEvent>, StoreError> {
        let pending = self.enqueue(command)?;
        pending.await.map_err(|_| StoreError::Stopped)?
    }

    /// Queues a command immediately; its position in the update order is fixed
    /// before this returns. Await the receiver for the outcome.
    pub fn enqueue(&self, command: StoreCommand) -> Result<PendingApply, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Envelope {
                command,
                reply: Some(reply),
            })
            .map_err(|_| StoreError::Stopped)?;
        Ok(rx)
    }

    /// Queues a command without waiting; failures are only logged.
    pub fn submit(&self, command: StoreCommand) -> Result<(), StoreError> {
        self.commands
            .send(Envelope {
                command,
                reply: None,
            })
            .map_err(|_| StoreError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&MessageStore) -> R) -> R {
        f(&*self.state.read().await)
    }

    pub async fn thread_messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.read(|store| store.thread_messages(thread_id)).await
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.read(|store| store.message(id).cloned()).await
    }

    pub async fn thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        self.read(|store| store.thread(thread_id).cloned()).await
    }
}

async fn run_update_loop(
    mut commands: mpsc::UnboundedReceiver<Envelope>,
    state: Arc<RwLock<MessageStore>>,
    events: broadcast::Sender<StoreEvent>,
) {
    while let Some(envelope) = commands.recv().await {
        let result = state.write().await.apply(envelope.command);
        match &result {
            Ok(applied) => {
                for event in applied {
                    let _ = events.send(event.clone());
                }
            }
            Err(err) => warn!(%err, "store: command rejected"),
        }
        if let Some(reply) = envelope.reply {
            let _ = reply.send(result);
        }
    }
    debug!("store: update loop stopped");
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
