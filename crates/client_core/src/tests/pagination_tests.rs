use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use reqwest::{Method, StatusCode};
use shared::domain::{Message, MessageId};
use tokio::sync::Notify;

use crate::{
    credentials::{BroadcastSession, InMemoryCredentialStore, TracingNotifier},
    error::{ErrorClassification, HttpFailure},
    retry::RetryPolicy,
    test_support::{history_message, MockBackend},
};

/// Serves pages from a fixed list; optionally parks the first call until released.
struct FakeSource {
    messages: Vec<Message>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    explicit_has_more: Option<bool>,
    fail: bool,
}

impl FakeSource {
    fn with_messages(count: usize) -> Self {
        Self {
            messages: (0..count)
                .map(|i| history_message(&format!("h{i}"), i as i64))
                .collect(),
            calls: AtomicUsize::new(0),
            gate: None,
            explicit_has_more: None,
            fail: false,
        }
    }
}

#[async_trait]
impl HistorySource for FakeSource {
    async fn fetch_page(
        &self,
        _thread_id: &ThreadId,
        _kind: ThreadKind,
        limit: u32,
        skip: u32,
    ) -> Result<HistoryPage, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Some(gate), 0) = (&self.gate, call) {
            gate.notified().await;
        }
        if self.fail {
            return Err(TransportError::Http(HttpFailure {
                method: Method::GET,
                url: "http://fake/messages".into(),
                classification: ErrorClassification::classify(
                    &Method::GET,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                ),
                retries: 0,
                gave_up: false,
            }));
        }
        let end = self.messages.len().saturating_sub(skip as usize);
        let start = end.saturating_sub(limit as usize);
        Ok(HistoryPage {
            messages: self.messages[start..end].to_vec(),
            has_more: self.explicit_has_more,
        })
    }
}

fn thread() -> ThreadId {
    ThreadId::from("t1")
}

fn pager(source: FakeSource) -> (HistoryPager, Arc<FakeSource>, StoreHandle) {
    let source = Arc::new(source);
    let store = StoreHandle::spawn();
    (
        HistoryPager::new(source.clone(), store.clone()),
        source,
        store,
    )
}

#[tokio::test]
async fn pages_advance_the_cursor_and_prepend_older_items() {
    let (pager, _, store) = pager(FakeSource::with_messages(5));

    let first = pager
        .fetch_older(&thread(), ThreadKind::Direct, 2, None)
        .await
        .expect("page 1");
    assert_eq!(
        first,
        FetchOutcome::Fetched {
            received: 2,
            has_more: true,
            next_skip: 2
        }
    );
    pager
        .fetch_older(&thread(), ThreadKind::Direct, 2, None)
        .await
        .expect("page 2");

    let ids: Vec<MessageId> = store
        .thread_messages(&thread())
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    let expected: Vec<MessageId> = ["h1", "h2", "h3", "h4"]
        .into_iter()
        .map(MessageId::from)
        .collect();
    assert_eq!(ids, expected);
    assert_eq!(pager.state(&thread()).next_skip, 4);
}

#[tokio::test]
async fn short_page_exhausts_history() {
    let (pager, source, _) = pager(FakeSource::with_messages(3));

    let outcome = pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, None)
        .await
        .expect("page");
    assert_eq!(
        outcome,
        FetchOutcome::Fetched {
            received: 3,
            has_more: false,
            next_skip: 3
        }
    );

    let again = pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, None)
        .await
        .expect("noop");
    assert_eq!(again, FetchOutcome::Exhausted);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn explicit_end_of_history_overrides_page_size() {
    let mut source = FakeSource::with_messages(10);
    source.explicit_has_more = Some(false);
    let (pager, _, _) = pager(source);

    let outcome = pager
        .fetch_older(&thread(), ThreadKind::Community, 2, None)
        .await
        .expect("page");
    assert!(matches!(
        outcome,
        FetchOutcome::Fetched { has_more: false, .. }
    ));
    assert!(!pager.state(&thread()).has_more);
}

#[tokio::test]
async fn concurrent_fetches_for_one_thread_issue_a_single_call() {
    let gate = Arc::new(Notify::new());
    let mut source = FakeSource::with_messages(10);
    source.gate = Some(gate.clone());
    let (pager, source, _) = pager(source);
    let tid = thread();

    let (first, second, _) = tokio::join!(
        pager.fetch_older(&tid, ThreadKind::Direct, 3, None),
        pager.fetch_older(&tid, ThreadKind::Direct, 3, None),
        async {
            tokio::task::yield_now().await;
            gate.notify_one();
        }
    );

    assert!(matches!(
        first.expect("first"),
        FetchOutcome::Fetched { received: 3, .. }
    ));
    assert_eq!(second.expect("second"), FetchOutcome::AlreadyLoading);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(!pager.state(&thread()).loading);
}

#[tokio::test]
async fn different_threads_fetch_independently() {
    let (pager, source, _) = pager(FakeSource::with_messages(10));

    let (a_id, b_id) = (ThreadId::from("a"), ThreadId::from("b"));

    let (a, b) = tokio::join!(
        pager.fetch_older(&a_id, ThreadKind::Direct, 3, None),
        pager.fetch_older(&b_id, ThreadKind::Direct, 3, None),
    );

    assert!(matches!(a.expect("a"), FetchOutcome::Fetched { .. }));
    assert!(matches!(b.expect("b"), FetchOutcome::Fetched { .. }));
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failure_releases_the_loading_flag() {
    let mut source = FakeSource::with_messages(10);
    source.fail = true;
    let (pager, _, _) = pager(source);

    let err = pager
        .fetch_older(&thread(), ThreadKind::Direct, 3, None)
        .await
        .expect_err("should fail");

    assert!(matches!(err, PaginationError::Transport(_)));
    let state = pager.state(&thread());
    assert!(!state.loading);
    assert!(state.has_more);
    assert_eq!(state.next_skip, 0);
}

#[tokio::test]
async fn dropped_fetch_releases_the_loading_flag() {
    let gate = Arc::new(Notify::new());
    let mut source = FakeSource::with_messages(10);
    source.gate = Some(gate);
    let (pager, _, _) = pager(source);

    let pending = tokio::time::timeout(
        Duration::from_millis(20),
        pager.fetch_older(&thread(), ThreadKind::Direct, 3, None),
    )
    .await;

    assert!(pending.is_err(), "fetch should still be parked");
    assert!(!pager.state(&thread()).loading);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let (pager, _, _) = pager(FakeSource::with_messages(20));

    pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, Some(10))
        .await
        .expect("page");
    assert_eq!(pager.state(&thread()).next_skip, 15);
    pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, Some(0))
        .await
        .expect("page");
    assert_eq!(pager.state(&thread()).next_skip, 15);
}

#[tokio::test]
async fn reset_allows_refetching_from_the_start() {
    let (pager, source, _) = pager(FakeSource::with_messages(1));
    pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, None)
        .await
        .expect("page");
    pager.reset(&thread());

    assert_eq!(pager.state(&thread()), PaginationState::default());
    pager
        .fetch_older(&thread(), ThreadKind::Direct, 5, None)
        .await
        .expect("page");
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reset_mid_fetch_keeps_a_single_call_and_drops_the_stale_page() {
    let gate = Arc::new(Notify::new());
    let mut source = FakeSource::with_messages(10);
    source.gate = Some(gate.clone());
    let (pager, source, store) = pager(source);
    let tid = thread();

    let (first, second) = tokio::join!(
        pager.fetch_older(&tid, ThreadKind::Direct, 3, None),
        async {
            // The first fetch is parked on the gate by now.
            tokio::task::yield_now().await;
            pager.reset(&tid);
            assert!(pager.state(&tid).loading);
            let second = pager.fetch_older(&tid, ThreadKind::Direct, 3, None).await;
            gate.notify_one();
            second
        }
    );

    assert_eq!(second.expect("second"), FetchOutcome::AlreadyLoading);
    assert_eq!(first.expect("first"), FetchOutcome::Superseded);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pager.state(&tid), PaginationState::default());
    assert!(store.thread_messages(&tid).await.is_empty());

    let again = pager
        .fetch_older(&tid, ThreadKind::Direct, 3, None)
        .await
        .expect("page");
    assert_eq!(
        again,
        FetchOutcome::Fetched {
            received: 3,
            has_more: true,
            next_skip: 3
        }
    );
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn http_history_source_hits_the_endpoint_once_under_contention() {
    let (url, backend) = MockBackend::builder()
        .history("t1", 4)
        .history_delay(Duration::from_millis(150))
        .spawn()
        .await;
    let transport = HttpTransport::new(
        url,
        Arc::new(InMemoryCredentialStore::default()),
        Arc::new(BroadcastSession::new()),
        Arc::new(TracingNotifier),
    )
    .with_retry_policy(RetryPolicy::new(0, 1, 0));
    let store = StoreHandle::spawn();
    let pager = HistoryPager::new(Arc::new(transport), store.clone());
    let tid = thread();

    let (first, second) = tokio::join!(
        pager.fetch_older(&tid, ThreadKind::Direct, 3, None),
        pager.fetch_older(&tid, ThreadKind::Direct, 3, None),
    );

    assert!(matches!(
        first.expect("first"),
        FetchOutcome::Fetched {
            received: 3,
            has_more: true,
            next_skip: 3
        }
    ));
    assert_eq!(second.expect("second"), FetchOutcome::AlreadyLoading);
    assert_eq!(backend.history_hits.load(Ordering::SeqCst), 1);

    let last = pager
        .fetch_older(&thread(), ThreadKind::Direct, 3, None)
        .await
        .expect("last page");
    assert_eq!(
        last,
        FetchOutcome::Fetched {
            received: 1,
            has_more: false,
            next_skip: 4
        }
    );
    assert_eq!(store.thread_messages(&thread()).await.len(), 4);
}
