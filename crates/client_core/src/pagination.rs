use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::{
    domain::{ThreadId, ThreadKind},
    protocol::HistoryPage,
};
use tracing::{debug, info};
use url::form_urlencoded::byte_serialize;

use crate::{
    error::{PaginationError, StoreError, TransportError},
    http::HttpTransport,
    store::{StoreCommand, StoreHandle},
};

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub loading: bool,
    pub has_more: bool,
    pub next_skip: u32,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self {
            loading: false,
            has_more: true,
            next_skip: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched {
        received: usize,
        has_more: bool,
        next_skip: u32,
    },
    /// Another fetch for the thread is in flight.
    AlreadyLoading,
    /// The thread's history is known to be exhausted.
    Exhausted,
    /// The thread was reset while this page was loading; the page was dropped.
    Superseded,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_page(
        &self,
        thread_id: &ThreadId,
        kind: ThreadKind,
        limit: u32,
        skip: u32,
    ) -> Result<HistoryPage, TransportError>;
}

#[async_trait]
impl HistorySource for HttpTransport {
    async fn fetch_page(
        &self,
        thread_id: &ThreadId,
        kind: ThreadKind,
        limit: u32,
        skip: u32,
    ) -> Result<HistoryPage, TransportError> {
        let thread_segment: String = byte_serialize(thread_id.as_str().as_bytes()).collect();
        self.get_json(
            &format!("/messages/{thread_segment}/{}", kind.as_path_segment()),
            &[("limit", limit.to_string()), ("skip", skip.to_string())],
        )
        .await
    }
}

#[derive(Debug, Default)]
struct ThreadCursor {
    state: PaginationState,
    /// Bumped by `reset`. A fetch started under an older generation is discarded.
    generation: u64,
}

/// Per-thread history cursor with at-most-one fetch in flight per thread.
pub struct HistoryPager {
    source: Arc<dyn HistorySource>,
    store: StoreHandle,
    cursors: Mutex<HashMap<ThreadId, ThreadCursor>>,
}

impl HistoryPager {
    pub fn new(source: Arc<dyn HistorySource>, store: StoreHandle) -> Self {
        Self {
            source,
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, thread_id: &ThreadId) -> PaginationState {
        self.cursors()
            .get(thread_id)
            .map(|cursor| cursor.state)
            .unwrap_or_default()
    }

    /// Rewinds the thread to its first page.
    ///
    /// A fetch already in flight keeps the thread `loading` until it settles, and
    /// its page is dropped rather than applied.
    pub fn reset(&self, thread_id: &ThreadId) {
        let mut cursors = self.cursors();
        if let Some(cursor) = cursors.get_mut(thread_id) {
            cursor.generation = cursor.generation.wrapping_add(1);
            cursor.state = PaginationState {
                loading: cursor.state.loading,
                ..PaginationState::default()
            };
            debug!(%thread_id, loading = cursor.state.loading, "pagination: cursor reset");
        }
    }

    /// Loads the next older page of `thread_id` and prepends it to the thread.
    ///
    /// `skip` defaults to the thread's cursor. The call is a no-op while another
    /// fetch for the thread is loading or once history is exhausted.
    pub async fn fetch_older(
        &self,
        thread_id: &ThreadId,
        kind: ThreadKind,
        limit: u32,
        skip: Option<u32>,
    ) -> Result<FetchOutcome, PaginationError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let (skip, generation) = {
            let mut cursors = self.cursors();
            let cursor = cursors.entry(thread_id.clone()).or_default();
            if cursor.state.loading {
                debug!(%thread_id, "pagination: fetch already in flight");
                return Ok(FetchOutcome::AlreadyLoading);
            }
            if !cursor.state.has_more {
                debug!(%thread_id, "pagination: history exhausted");
                return Ok(FetchOutcome::Exhausted);
            }
            cursor.state.loading = true;
            (skip.unwrap_or(cursor.state.next_skip), cursor.generation)
        };
        let _guard = InflightGuard {
            pager: self,
            thread_id,
        };

        let page = self.source.fetch_page(thread_id, kind, limit, skip).await?;
        let received = page.messages.len();
        let has_more = page
            .has_more
            .unwrap_or(received >= limit as usize);

        // Checked and queued under one lock so a reset cannot slip in between.
        let pending = {
            let mut cursors = self.cursors();
            let queued = match cursors.get_mut(thread_id) {
                Some(cursor) if cursor.generation == generation => {
                    self.store.enqueue(StoreCommand::PrependHistory {
                        thread_id: thread_id.clone(),
                        kind,
                        messages: page.messages,
                    })?
                }
                stale => {
                    if let Some(cursor) = stale {
                        cursor.state.loading = false;
                    }
                    info!(%thread_id, received, "pagination: thread reset mid-fetch, page dropped");
                    return Ok(FetchOutcome::Superseded);
                }
            };
            queued
        };
        pending.await.map_err(|_| StoreError::Stopped)??;

        let outcome = {
            let mut cursors = self.cursors();
            let cursor = cursors.entry(thread_id.clone()).or_default();
            cursor.state.loading = false;
            if cursor.generation == generation {
                cursor.state.has_more = has_more;
                cursor.state.next_skip = cursor
                    .state
                    .next_skip
                    .max(skip.saturating_add(received as u32));
                FetchOutcome::Fetched {
                    received,
                    has_more,
                    next_skip: cursor.state.next_skip,
                }
            } else {
                FetchOutcome::Superseded
            }
        };

        info!(%thread_id, received, has_more, ?outcome, "pagination: page loaded");
        Ok(outcome)
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<ThreadId, ThreadCursor>> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears `loading` if a fetch fails or its future is dropped mid-flight.
struct InflightGuard<'a> {
    pager: &'a HistoryPager,
    thread_id: &'a ThreadId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(cursor) = self.pager.cursors().get_mut(self.thread_id) {
            cursor.state.loading = false;
        }
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
