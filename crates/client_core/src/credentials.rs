//! Contracts with the application layer: stored credentials, session state and
//! user-facing error surfaces. The core only reads credentials; the
//! session-invalidation path in [`crate::http`] is the single writer.

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_token(&self) -> Option<String>;
    async fn clear_token(&self);
    async fn clear_user(&self);
}

pub trait SessionSink: Send + Sync {
    fn logout(&self);
}

/// Fire-and-forget user-facing error surface. Implementations must not panic.
pub trait Notifier: Send + Sync {
    fn show_error(&self, message: &str);
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    token: RwLock<Option<String>>,
    user: RwLock<Option<serde_json::Value>>,
}

impl InMemoryCredentialStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            user: RwLock::new(None),
        }
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn set_user(&self, user: serde_json::Value) {
        *self.user.write().await = Some(user);
    }

    pub async fn user(&self) -> Option<serde_json::Value> {
        self.user.read().await.clone()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    async fn clear_user(&self) {
        *self.user.write().await = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedOut,
}

/// Session layer that republishes logout signals to any number of observers.
pub struct BroadcastSession {
    events: broadcast::Sender<SessionEvent>,
}

impl BroadcastSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Default for BroadcastSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSink for BroadcastSession {
    fn logout(&self) {
        info!("session: logout requested");
        let _ = self.events.send(SessionEvent::LoggedOut);
    }
}

/// Notifier that only logs; used when no UI surface is attached.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_error(&self, message: &str) {
        warn!(message, "user-facing error");
    }
}
