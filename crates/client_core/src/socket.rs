//! Process-wide realtime connection.
//!
//! A [`SocketHandle`] fronts a supervisor task that owns the WebSocket, reconnects
//! with bounded backoff for as long as the handle lives, and buffers outbound
//! frames while disconnected. [`SocketTransport`] is the only place handles are
//! created or destroyed.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ClientSettings, error::SocketError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    url: Url,
    reconnect_min: Duration,
    reconnect_max: Duration,
    connect_timeout: Duration,
}

impl SocketOptions {
    pub fn new(url: &str) -> Result<Self, SocketError> {
        let parsed = Url::parse(url).map_err(|source| SocketError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(SocketError::UnsupportedScheme(url.to_string()));
        }
        Ok(Self {
            url: parsed,
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_millis(5_000),
            connect_timeout: Duration::from_secs(180),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, SocketError> {
        let url = settings
            .resolved_socket_url()
            .ok_or_else(|| SocketError::UnsupportedScheme(settings.api_base_url.clone()))?;
        Ok(Self::new(&url)?
            .with_reconnect_bounds(settings.socket.reconnect_min(), settings.socket.reconnect_max())
            .with_connect_timeout(settings.socket.connect_timeout()))
    }

    pub fn with_reconnect_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max.max(min);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Exponential from `reconnect_min`, capped at `reconnect_max`. `attempt` is 1-indexed.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.reconnect_min
            .saturating_mul(1_u32 << shift)
            .min(self.reconnect_max)
    }
}

struct HandleInner {
    id: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inbound: broadcast::Sender<ServerFrame>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SocketHandle {
    fn spawn(id: u64, options: SocketOptions) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(256);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            id,
            options,
            outbound_rx,
            inbound.clone(),
            state_tx,
            shutdown_rx,
        ));
        Self {
            inner: Arc::new(HandleInner {
                id,
                outbound,
                inbound,
                state,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn same_as(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    pub async fn wait_connected(&self) -> Result<(), SocketError> {
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| SocketError::Closed)?;
        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(SocketError::Closed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.inner.inbound.subscribe()
    }

    /// Queues a frame. Frames emitted while disconnected are flushed after the
    /// next successful reconnect.
    pub fn emit(&self, frame: ClientFrame) -> Result<(), SocketError> {
        if self.state() == ConnectionState::Closed {
            return Err(SocketError::Closed);
        }
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                debug!(socket_id = self.inner.id, %err, "socket: supervisor ended abnormally");
            }
        }
    }
}

/// Owner of the single live [`SocketHandle`].
#[derive(Default)]
pub struct SocketTransport {
    slot: Mutex<Option<SocketHandle>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<SocketTransport>> = OnceLock::new();

/// The process-wide transport shared by every consumer.
pub fn global() -> Arc<SocketTransport> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(SocketTransport::new())))
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live handle when connected; otherwise replaces any stale
    /// handle with a fresh one. Must be called inside a Tokio runtime.
    pub fn connect(&self, options: &SocketOptions) -> SocketHandle {
        let (handle, stale) = {
            let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = slot.as_ref() {
                if existing.is_connected() {
                    return existing.clone();
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let handle = SocketHandle::spawn(id, options.clone());
            info!(socket_id = id, url = %options.url, "socket: created handle");
            (handle.clone(), slot.replace(handle))
        };
        if let Some(stale) = stale {
            debug!(socket_id = stale.id(), "socket: retiring stale handle");
            let _ = stale.inner.shutdown.send(true);
        }
        handle
    }

    pub fn current(&self) -> Option<SocketHandle> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Closes the live handle, if any. Close-time failures are swallowed.
    pub async fn disconnect(&self) {
        let handle = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            info!(socket_id = handle.id(), "socket: disconnecting");
            handle.close().await;
        }
    }
}

enum PumpExit {
    Shutdown,
    HandleDropped,
    Dropped(String),
}

async fn supervise(
    id: u64,
    options: SocketOptions,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    inbound: broadcast::Sender<ServerFrame>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut pending: Option<ClientFrame> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let connect = tokio::time::timeout(
            options.connect_timeout,
            connect_async(options.url.as_str()),
        );
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = connect => result,
        };
        match result {
            Ok(Ok((stream, _))) => {
                attempt = 0;
                state.send_replace(ConnectionState::Connected);
                info!(socket_id = id, "socket: connected");
                match pump(id, stream, &mut outbound, &inbound, &mut shutdown, &mut pending).await {
                    PumpExit::Shutdown | PumpExit::HandleDropped => break,
                    PumpExit::Dropped(reason) => {
                        warn!(socket_id = id, %reason, "socket: connection dropped");
                    }
                }
            }
            Ok(Err(err)) => warn!(socket_id = id, %err, "socket: connect failed"),
            Err(_) => warn!(
                socket_id = id,
                timeout_secs = options.connect_timeout.as_secs(),
                "socket: connect timed out"
            ),
        }

        attempt = attempt.saturating_add(1);
        state.send_replace(ConnectionState::Reconnecting { attempt });
        let delay = options.reconnect_delay(attempt);
        debug!(socket_id = id, attempt, delay_ms = delay.as_millis() as u64, "socket: reconnect scheduled");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(ConnectionState::Closed);
    info!(socket_id = id, "socket: closed");
}

async fn pump(
    id: u64,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    inbound: &broadcast::Sender<ServerFrame>,
    shutdown: &mut watch::Receiver<bool>,
    pending: &mut Option<ClientFrame>,
) -> PumpExit {
    let (mut writer, mut reader) = stream.split();

    if let Some(frame) = pending.take() {
        if let Err(reason) = write_frame(&mut writer, &frame).await {
            *pending = Some(frame);
            return PumpExit::Dropped(reason);
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::HandleDropped;
                };
                if let Err(reason) = write_frame(&mut writer, &frame).await {
                    *pending = Some(frame);
                    return PumpExit::Dropped(reason);
                }
            }
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => match ServerFrame::decode(&text) {
                    Ok(frame) => {
                        let _ = inbound.send(frame);
                    }
                    Err(err) => warn!(socket_id = id, %err, "socket: ignoring undecodable frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Dropped("closed by peer".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Dropped(err.to_string()),
            }
        }
    }
}

async fn write_frame<S>(writer: &mut S, frame: &ClientFrame) -> Result<(), String>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = match frame.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "socket: dropping unencodable frame");
            return Ok(());
        }
    };
    writer.send(Message::Text(text)).await.map_err(|err| err.to_string())
}

#[cfg(test)]
#[path = "tests/socket_tests.rs"]
mod tests;
