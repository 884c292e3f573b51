use std::sync::{Arc, Mutex};

use shared::{
    domain::{MessageExtras, MessageId, Sender, ThreadId, ThreadKind},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    credentials::{CredentialStore, Notifier, SessionSink},
    error::{PaginationError, SocketError, StoreError},
    http::HttpTransport,
    pagination::{FetchOutcome, HistoryPager, PaginationState},
    socket::{self, SocketHandle, SocketOptions, SocketTransport},
    store::{StoreCommand, StoreEvent, StoreHandle},
};

struct InboundPump {
    socket_id: u64,
    task: JoinHandle<()>,
}

/// Entry point for chat screens: optimistic sends, realtime updates and history
/// paging, all funnelled into one [`StoreHandle`].
pub struct ChatService {
    sockets: Arc<SocketTransport>,
    socket_options: SocketOptions,
    store: StoreHandle,
    pager: HistoryPager,
    me: Sender,
    page_size: u32,
    pump: Mutex<Option<InboundPump>>,
}

impl ChatService {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        http: Arc<HttpTransport>,
        sockets: Arc<SocketTransport>,
        socket_options: SocketOptions,
        me: Sender,
    ) -> Self {
        let store = StoreHandle::spawn();
        let pager = HistoryPager::new(http, store.clone());
        Self {
            sockets,
            socket_options,
            store,
            pager,
            me,
            page_size: ClientSettings::default().history_page_size,
            pump: Mutex::new(None),
        }
    }

    /// Builds a service on the process-wide socket transport.
    pub fn from_settings(
        settings: &ClientSettings,
        credentials: Arc<dyn CredentialStore>,
        session: Arc<dyn SessionSink>,
        notifier: Arc<dyn Notifier>,
        me: Sender,
    ) -> Result<Self, SocketError> {
        let http = Arc::new(HttpTransport::from_settings(
            settings,
            credentials,
            session,
            notifier,
        ));
        let options = SocketOptions::from_settings(settings)?;
        Ok(Self::new(http, socket::global(), options, me)
            .with_page_size(settings.history_page_size))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn pagination_state(&self, thread_id: &ThreadId) -> PaginationState {
        self.pager.state(thread_id)
    }

    /// Connects (or reuses) the shared socket and makes sure its inbound frames
    /// feed the store.
    pub fn connect(&self) -> SocketHandle {
        let handle = self.sockets.connect(&self.socket_options);
        let mut pump = self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = pump
            .as_ref()
            .is_some_and(|p| p.socket_id == handle.id() && !p.task.is_finished());
        if !current {
            if let Some(stale) = pump.take() {
                stale.task.abort();
            }
            *pump = Some(InboundPump {
                socket_id: handle.id(),
                task: tokio::spawn(pump_inbound(
                    handle.id(),
                    handle.subscribe(),
                    self.store.clone(),
                )),
            });
        }
        handle
    }

    pub async fn disconnect(&self) {
        let stale = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stale) = stale {
            stale.task.abort();
        }
        self.sockets.disconnect().await;
    }

    /// Optimistically inserts the message, then hands it to the socket.
    ///
    /// Returns the local id. The message stays `sending` until the server
    /// acknowledges it, and is marked `failed` if the socket refuses it.
    pub async fn send_message(
        &self,
        thread_id: &ThreadId,
        kind: ThreadKind,
        text: impl Into<String>,
        extras: MessageExtras,
    ) -> Result<MessageId, StoreError> {
        let text = text.into();
        let applied = self
            .store
            .apply(StoreCommand::CreateLocal {
                thread_id: thread_id.clone(),
                kind,
                text: text.clone(),
                sender: self.me.clone(),
                extras: extras.clone(),
            })
            .await?;
        let Some(StoreEvent::MessageAdded { message, .. }) = applied.into_iter().next() else {
            return Err(StoreError::UnknownThread(thread_id.clone()));
        };

        self.emit_send(ClientFrame::SendMessage {
            client_id: message.id.clone(),
            thread_id: thread_id.clone(),
            kind,
            text,
            extras,
        })
        .await?;
        Ok(message.id)
    }

    /// Re-emits a `failed` message under its original local id.
    pub async fn resend(&self, id: &MessageId) -> Result<(), StoreError> {
        let applied = self
            .store
            .apply(StoreCommand::Resend { id: id.clone() })
            .await?;
        let Some(StoreEvent::MessageUpdated { thread_id, message }) = applied.into_iter().next()
        else {
            return Err(StoreError::NotResendable(id.clone()));
        };
        let kind = self
            .store
            .thread(&thread_id)
            .await
            .map(|thread| thread.kind)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))?;

        info!(%id, %thread_id, "chat: resending failed message");
        self.emit_send(ClientFrame::SendMessage {
            client_id: message.id,
            thread_id,
            kind,
            text: message.text,
            extras: MessageExtras {
                reply_to: message.reply_to,
                media_uri: message.media_uri,
                mime_type: message.mime_type,
                duration_ms: message.duration_ms,
            },
        })
        .await
    }

    /// Tells the server the local user has read `message_ids`.
    pub fn mark_seen(
        &self,
        thread_id: &ThreadId,
        message_ids: Vec<MessageId>,
    ) -> Result<(), SocketError> {
        let handle = self.sockets.current().ok_or(SocketError::NotConnected)?;
        handle.emit(ClientFrame::MarkSeen {
            thread_id: thread_id.clone(),
            message_ids,
        })
    }

    pub async fn load_older(
        &self,
        thread_id: &ThreadId,
        kind: ThreadKind,
    ) -> Result<FetchOutcome, PaginationError> {
        self.pager
            .fetch_older(thread_id, kind, self.page_size, None)
            .await
    }

    /// Empties the thread and rewinds its history cursor. A page still loading
    /// for the thread is discarded instead of landing in the cleared thread.
    pub async fn clear_thread(&self, thread_id: &ThreadId) -> Result<(), StoreError> {
        // Reset first: any page queued before this point is ordered ahead of the clear.
        self.pager.reset(thread_id);
        self.store
            .apply(StoreCommand::ClearThread {
                thread_id: thread_id.clone(),
            })
            .await?;
        Ok(())
    }

    async fn emit_send(&self, frame: ClientFrame) -> Result<(), StoreError> {
        let ClientFrame::SendMessage { client_id, .. } = &frame else {
            return Ok(());
        };
        let client_id = client_id.clone();
        let handle = match self.sockets.current() {
            Some(handle) => handle,
            None => self.connect(),
        };
        if let Err(err) = handle.emit(frame) {
            warn!(%client_id, %err, "chat: send failed, awaiting user resend");
            self.store
                .apply(StoreCommand::MarkFailed { id: client_id })
                .await?;
        }
        Ok(())
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(pump) = pump.take() {
                pump.task.abort();
            }
        }
    }
}

/// Single consumer of a socket's inbound frames; every frame becomes one store
/// command, applied in arrival order.
async fn pump_inbound(
    socket_id: u64,
    frames: broadcast::Receiver<ServerFrame>,
    store: StoreHandle,
) {
    let mut frames = BroadcastStream::new(frames);

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(socket_id, %err, "chat: inbound frames lagged");
                continue;
            }
        };
        if store.submit(command_for(frame)).is_err() {
            break;
        }
    }
    debug!(socket_id, "chat: inbound pump finished");
}

fn command_for(frame: ServerFrame) -> StoreCommand {
    match frame {
        ServerFrame::Message(inbound) => StoreCommand::Ingest {
            thread_id: inbound.thread_or_channel_id.clone(),
            kind: None,
            message: inbound.into_message(),
        },
        ServerFrame::MessageAck {
            client_id,
            message_id,
        } => StoreCommand::ConfirmSent {
            local_id: client_id,
            server_id: message_id,
        },
        ServerFrame::MessageFailed { client_id, reason } => {
            warn!(
                %client_id,
                reason = reason.as_deref().unwrap_or("unspecified"),
                "chat: server rejected message"
            );
            StoreCommand::MarkFailed { id: client_id }
        }
        ServerFrame::Delivered { message_id } => StoreCommand::MarkDelivered { id: message_id },
        ServerFrame::Seen {
            message_id,
            seen_by,
        } => StoreCommand::MarkSeen {
            id: message_id,
            seen_by,
        },
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
