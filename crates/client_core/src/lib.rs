//! Client-side networking core: an authenticated HTTP transport with retry and
//! session handling, a shared realtime socket, and the message store and
//! history pager that chat screens render from.

pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod pagination;
pub mod retry;
pub mod socket;
pub mod store;

pub use chat::ChatService;
pub use config::{load_settings, ClientSettings};
pub use credentials::{
    BroadcastSession, CredentialStore, InMemoryCredentialStore, Notifier, SessionEvent,
    SessionSink, TracingNotifier,
};
pub use error::{
    ErrorClassification, ErrorKind, HttpFailure, PaginationError, SocketError, StoreError,
    TransportError,
};
pub use http::{HttpResponse, HttpTransport, RequestContext, RequestSpec};
pub use pagination::{FetchOutcome, HistoryPager, HistorySource, PaginationState};
pub use retry::RetryPolicy;
pub use socket::{ConnectionState, SocketHandle, SocketOptions, SocketTransport};
pub use store::{MessageStore, StoreCommand, StoreEvent, StoreHandle};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
