//! In-process mock backend shared by the async test suites.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{Message, MessageId, MessageStatus, UserId},
    protocol::{ClientFrame, HistoryPage, ServerFrame},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge with a fresh server id.
    NewId,
    /// Acknowledge without a server id.
    KeepId,
    /// Acknowledge with a fixed server id.
    FixedId(&'static str),
    /// Reject every send.
    Fail,
    /// Never answer.
    Silent,
}

#[derive(Clone)]
pub struct MockBackend {
    pub connections: Arc<AtomicUsize>,
    pub history_hits: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<ClientFrame>>>,
    pub push: broadcast::Sender<ServerFrame>,
    history: Arc<HashMap<String, Vec<Message>>>,
    history_delay: Duration,
    ack_mode: AckMode,
    drop_first_connection: bool,
}

pub struct MockBackendBuilder {
    history: HashMap<String, Vec<Message>>,
    history_delay: Duration,
    ack_mode: AckMode,
    drop_first_connection: bool,
}

impl MockBackendBuilder {
    /// Seeds `count` historical messages for `thread_id`, oldest first.
    pub fn history(mut self, thread_id: &str, count: usize) -> Self {
        let messages = (0..count)
            .map(|i| history_message(&format!("{thread_id}-h{i}"), i as i64))
            .collect();
        self.history.insert(thread_id.to_string(), messages);
        self
    }

    pub fn history_delay(mut self, delay: Duration) -> Self {
        self.history_delay = delay;
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn drop_first_connection(mut self) -> Self {
        self.drop_first_connection = true;
        self
    }

    pub async fn spawn(self) -> (String, MockBackend) {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (push, _) = broadcast::channel(64);
        let backend = MockBackend {
            connections: Arc::new(AtomicUsize::new(0)),
            history_hits: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            push,
            history: Arc::new(self.history),
            history_delay: self.history_delay,
            ack_mode: self.ack_mode,
            drop_first_connection: self.drop_first_connection,
        };
        let app = Router::new()
            .route("/messages/:thread_id/:kind", get(history_handler))
            .route("/ws", get(ws_handler))
            .with_state(backend.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), backend)
    }
}

impl MockBackend {
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder {
            history: HashMap::new(),
            history_delay: Duration::ZERO,
            ack_mode: AckMode::NewId,
            drop_first_connection: false,
        }
    }

    pub async fn wait_for_received(&self, count: usize) -> Vec<ClientFrame> {
        for _ in 0..200 {
            {
                let received = self.received.lock().await;
                if received.len() >= count {
                    return received.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock backend did not receive {count} frames");
    }
}

pub fn history_message(id: &str, minute: i64) -> Message {
    Message {
        id: MessageId::from(id),
        text: format!("text {id}"),
        created_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("timestamp")
            + chrono::Duration::minutes(minute),
        sender_id: UserId::from("u-history"),
        sender_name: "history".to_string(),
        avatar: None,
        status: MessageStatus::Delivered,
        seen_by: None,
        reply_to: None,
        media_uri: None,
        mime_type: None,
        duration_ms: None,
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: usize,
    skip: usize,
}

/// Pages newest-first by `skip`; each page is returned oldest-first.
async fn history_handler(
    State(backend): State<MockBackend>,
    Path((thread_id, _kind)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryPage> {
    backend.history_hits.fetch_add(1, Ordering::SeqCst);
    if !backend.history_delay.is_zero() {
        tokio::time::sleep(backend.history_delay).await;
    }
    let all = backend.history.get(&thread_id).cloned().unwrap_or_default();
    let end = all.len().saturating_sub(query.skip);
    let start = end.saturating_sub(query.limit);
    Json(HistoryPage {
        messages: all[start..end].to_vec(),
        has_more: None,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(backend): State<MockBackend>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(backend, socket))
}

async fn ws_connection(backend: MockBackend, socket: WebSocket) {
    let index = backend.connections.fetch_add(1, Ordering::SeqCst);
    if backend.drop_first_connection && index == 0 {
        drop(socket);
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let mut pushed = backend.push.subscribe();
    let mut next_id = 0usize;

    loop {
        tokio::select! {
            frame = pushed.recv() => {
                let Ok(frame) = frame else { break };
                let text = serde_json::to_string(&frame).expect("encode");
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let Some(Ok(WsMessage::Text(text))) = incoming else { break };
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
                backend.received.lock().await.push(frame.clone());
                let ClientFrame::SendMessage { client_id, .. } = frame else { continue };
                let reply = match backend.ack_mode {
                    AckMode::NewId => {
                        next_id += 1;
                        Some(ServerFrame::MessageAck {
                            client_id,
                            message_id: Some(MessageId::from(format!("srv-{index}-{next_id}"))),
                        })
                    }
                    AckMode::KeepId => Some(ServerFrame::MessageAck {
                        client_id,
                        message_id: None,
                    }),
                    AckMode::FixedId(id) => Some(ServerFrame::MessageAck {
                        client_id,
                        message_id: Some(MessageId::from(id)),
                    }),
                    AckMode::Fail => Some(ServerFrame::MessageFailed {
                        client_id,
                        reason: Some("rejected".into()),
                    }),
                    AckMode::Silent => None,
                };
                if let Some(reply) = reply {
                    let text = serde_json::to_string(&reply).expect("encode");
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
