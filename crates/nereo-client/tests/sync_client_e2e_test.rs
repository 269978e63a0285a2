//! End-to-end tests of `SyncClient` against an in-process axum backend.
//!
//! The backend serves the SSE streams from a broadcast channel, the read
//! endpoints from shared JSON state and the write endpoints with configurable
//! failures. Channel timings are shortened so timeouts and backoff run in
//! milliseconds on the real clock.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, patch, post},
};
use nereo_client::{ApiClient, ClientConfig, ClientError, HttpConnector, SyncClient, SystemEnv};
use nereo_core::{CacheKey, ChannelConfig, ChannelState, ChannelStatus, Scope, Subscription, keys};
use nereo_proto::{BookingStatus, NewSubscriber, Topic, paths};
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot, watch},
};

const TENANT: &str = "tenant-1";
const WAIT: Duration = Duration::from_secs(5);

/// Backend state shared with the handlers.
struct Backend {
    events: broadcast::Sender<String>,
    sse_connections: AtomicUsize,
    /// SSE requests answered with 503 before streams are accepted
    reject_streams: AtomicUsize,
    kpis: Mutex<Value>,
    subscribers: Mutex<Value>,
    board: Mutex<Value>,
    /// Message of the 500 returned by writes, `None` to accept them
    fail_writes: Mutex<Option<String>>,
    patches: Mutex<Vec<Value>>,
}

impl Backend {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            sse_connections: AtomicUsize::new(0),
            reject_streams: AtomicUsize::new(0),
            kpis: Mutex::new(json!({"monthlyRevenue": 400, "churnRate": 2})),
            subscribers: Mutex::new(json!([
                {"id": "s1", "fullName": "Ana", "status": "active", "branchId": "b1"},
                {"id": "s2", "fullName": "Luis", "status": "active", "branchId": "b1"},
            ])),
            board: Mutex::new(json!([
                {"id": "bk-1", "status": "waiting"},
                {"id": "bk-2", "status": "waiting"},
            ])),
            fail_writes: Mutex::new(None),
            patches: Mutex::new(Vec::new()),
        })
    }

    fn publish(&self, raw: &str) {
        self.events.send(raw.to_string()).unwrap();
    }

    fn write_failure(&self) -> Option<Response> {
        self.fail_writes.lock().unwrap().clone().map(|message| {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"message": message}))).into_response()
        })
    }
}

async fn stream(
    State(backend): State<Arc<Backend>>,
    Path((topic, _tenant)): Path<(String, String)>,
) -> Response {
    backend.sse_connections.fetch_add(1, Ordering::SeqCst);

    if topic == "bookings" {
        // Never answers: exercises the connect timeout.
        std::future::pending::<()>().await;
    }

    let rejected = backend
        .reject_streams
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejected {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let events = backend.events.subscribe();
    let stream = futures::stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(data) => return Some((Ok::<_, Infallible>(Event::default().data(data)), events)),
                Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).into_response()
}

async fn kpis(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(backend.kpis.lock().unwrap().clone())
}

async fn list_subscribers(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(backend.subscribers.lock().unwrap().clone())
}

async fn create_subscriber(
    State(backend): State<Arc<Backend>>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = backend.write_failure() {
        return failure;
    }

    let created = json!({
        "id": "s3",
        "fullName": body["fullName"],
        "status": "active",
        "branchId": "b1",
    });
    if let Some(list) = backend.subscribers.lock().unwrap().as_array_mut() {
        list.insert(0, created.clone());
    }
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn subscriber_action(
    State(backend): State<Arc<Backend>>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    if let Some(failure) = backend.write_failure() {
        return failure;
    }
    Json(json!({"id": id, "action": action})).into_response()
}

async fn booking_status(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(failure) = backend.write_failure() {
        return failure;
    }

    backend.patches.lock().unwrap().push(body.clone());
    if let Some(board) = backend.board.lock().unwrap().as_array_mut() {
        for booking in board.iter_mut().filter(|b| b["id"] == id.as_str()) {
            booking["status"] = body["status"].clone();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn bookings(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(backend.board.lock().unwrap().clone())
}

fn spawn_axum_with_shutdown(listener: TcpListener, router: Router) -> oneshot::Sender<()> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, router.into_make_service());
        let _ = serve
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    shutdown_tx
}

/// Running backend plus a client pointed at it.
struct Harness {
    backend: Arc<Backend>,
    client: SyncClient,
    _shutdown: oneshot::Sender<()>,
}

async fn start() -> Harness {
    let backend = Backend::new();
    let router = Router::new()
        .route("/api/v1/sse/{topic}/{tenant}", get(stream))
        .route("/api/v1/analytics/kpis", get(kpis))
        .route("/api/v1/subscribers", get(list_subscribers).post(create_subscriber))
        .route("/api/v1/subscribers/{id}/{action}", post(subscriber_action))
        .route("/api/v1/bookings", get(bookings))
        .route("/api/v1/bookings/{id}/status", patch(booking_status))
        .with_state(Arc::clone(&backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let shutdown = spawn_axum_with_shutdown(listener, router);

    let config = ClientConfig::default()
        .with_base_url(format!("http://{addr}"))
        .with_request_timeout(Duration::from_secs(2))
        .with_channel(ChannelConfig {
            connect_timeout: Duration::from_millis(300),
            backoff_base: Duration::from_millis(20),
            max_retry_delay: Duration::from_millis(200),
            fallback_poll_interval: Duration::from_millis(750),
        });

    let http = reqwest::Client::builder().cookie_store(true).no_proxy().build().unwrap();
    let api = ApiClient::new(http.clone(), &config);
    let connector = HttpConnector::new(http, &config);
    let client = SyncClient::with_parts(SystemEnv::new(), connector, api, config);

    Harness { backend, client, _shutdown: shutdown }
}

async fn wait_for_status(
    status: &mut watch::Receiver<ChannelStatus>,
    done: impl Fn(&ChannelStatus) -> bool,
) -> ChannelStatus {
    tokio::time::timeout(WAIT, status.wait_for(|s| done(s))).await.unwrap().map(|s| *s).unwrap()
}

/// Poll the cache until `key` satisfies `done`.
async fn wait_for_value(
    client: &SyncClient,
    key: &CacheKey,
    done: impl Fn(&Value) -> bool,
) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(value) = client.cached(key).await
                && done(&value)
            {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

fn scope() -> Scope {
    Scope::tenant(TENANT).with_branch("b1")
}

#[tokio::test]
async fn test_kpi_event_merges_into_cached_snapshot() {
    let h = start().await;
    let kpis = keys::kpis(TENANT);
    h.client.fetch(kpis.clone(), &paths::analytics_kpis(None)).await.unwrap();

    let handle =
        h.client.subscribe(Subscription::new(Topic::Analytics, Scope::tenant(TENANT))).await;
    let mut status = handle.watch_status();
    wait_for_status(&mut status, |s| s.state == ChannelState::Connected).await;

    h.backend.publish(r#"{"type":"kpi_updated","payload":{"monthlyRevenue":500}}"#);

    let merged = wait_for_value(&h.client, &kpis, |v| v["monthlyRevenue"] == 500).await;
    assert_eq!(merged, json!({"monthlyRevenue": 500, "churnRate": 2}));

    let core = h.client.core();
    assert_eq!(core.lock().await.cache().is_stale(&kpis), Some(false));

    handle.close().await;
}

#[tokio::test]
async fn test_unrecognized_event_invalidates_and_refetches() {
    let h = start().await;
    let kpis = keys::kpis(TENANT);
    h.client.fetch(kpis.clone(), &paths::analytics_kpis(None)).await.unwrap();
    let mut invalidations = h.client.invalidations();

    let handle =
        h.client.subscribe(Subscription::new(Topic::Analytics, Scope::tenant(TENANT))).await;
    let mut status = handle.watch_status();
    wait_for_status(&mut status, |s| s.state == ChannelState::Connected).await;

    *h.backend.kpis.lock().unwrap() = json!({"monthlyRevenue": 900, "churnRate": 1});
    h.backend.publish(r#"{"type":"report_generated","payload":{}}"#);

    let stale = tokio::time::timeout(WAIT, invalidations.recv()).await.unwrap().unwrap();
    assert_eq!(stale, vec![kpis.clone()]);

    let refreshed = h.client.refetch_stale().await;
    assert_eq!(refreshed, vec![kpis.clone()]);
    assert_eq!(h.client.cached(&kpis).await, Some(json!({"monthlyRevenue": 900, "churnRate": 1})));

    handle.close().await;
}

#[tokio::test]
async fn test_failed_pause_rolls_back_with_one_notice() {
    let h = start().await;
    let list = keys::subscriber_list(TENANT, Some("b1"));
    let detail = keys::subscriber("s1");
    h.client.fetch(list.clone(), &paths::subscriber_list(Some("b1"))).await.unwrap();
    h.client.core().lock().await.store(detail.clone(), json!({"id": "s1", "status": "active"}));
    let before = h.client.cached(&list).await;

    *h.backend.fail_writes.lock().unwrap() = Some("db down".to_string());
    let mut notices = h.client.notices();

    let err = h.client.pause_subscriber(&scope(), "s1").await.unwrap_err();
    let ClientError::Rejected { notice, source } = err else {
        panic!("expected a rejected mutation");
    };
    insta::assert_snapshot!(notice.to_string(), @"could not pause the membership: db down");
    assert_eq!(source.message(), "db down");

    assert_eq!(h.client.cached(&list).await, before);
    assert_eq!(h.client.cached(&detail).await, Some(json!({"id": "s1", "status": "active"})));

    // The fetched list is reloaded, the detail has no registered query
    let core = h.client.core();
    assert_eq!(core.lock().await.cache().is_stale(&list), Some(false));
    assert_eq!(core.lock().await.cache().is_stale(&detail), Some(true));

    assert_eq!(notices.try_recv().unwrap(), notice);
    assert!(notices.try_recv().is_err(), "exactly one notice per failure");
}

#[tokio::test]
async fn test_committed_move_refetches_board() {
    let h = start().await;
    let board = keys::booking_board(TENANT, Some("b1"));
    h.client.fetch(board.clone(), &paths::bookings_today(TENANT, Some("b1"))).await.unwrap();

    let response = h.client.move_booking(&scope(), "bk-2", BookingStatus::Washing).await.unwrap();
    assert_eq!(response, Value::Null);

    assert_eq!(h.backend.patches.lock().unwrap().clone(), vec![json!({"status": "washing"})]);
    assert_eq!(
        h.client.cached(&board).await,
        Some(json!([{"id": "bk-1", "status": "waiting"}, {"id": "bk-2", "status": "washing"}]))
    );

    let core = h.client.core();
    assert_eq!(core.lock().await.cache().is_stale(&board), Some(false));
    assert!(core.lock().await.mutations().pending().is_empty());
}

#[tokio::test]
async fn test_created_subscriber_replaces_placeholder() {
    let h = start().await;
    let list = keys::subscriber_list(TENANT, Some("b1"));
    h.client.fetch(list.clone(), &paths::subscriber_list(Some("b1"))).await.unwrap();

    let request = NewSubscriber {
        full_name: "Marta".into(),
        phone: "555".into(),
        plate: "AB123CD".into(),
        plan_id: "p-1".into(),
        ..Default::default()
    };
    let created = h.client.create_subscriber(&scope(), &request).await.unwrap();
    assert_eq!(created["id"], "s3");

    let rows = h.client.cached(&list).await.unwrap();
    let ids: Vec<_> = rows.as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!("s3"), json!("s1"), json!("s2")]);
}

#[tokio::test]
async fn test_failed_create_removes_placeholder() {
    let h = start().await;
    let list = keys::subscriber_list(TENANT, Some("b1"));
    *h.backend.fail_writes.lock().unwrap() = Some("duplicate plate".to_string());

    let request = NewSubscriber { full_name: "Marta".into(), ..Default::default() };
    let err = h.client.create_subscriber(&scope(), &request).await.unwrap_err();

    assert!(matches!(err, ClientError::Rejected { .. }));
    assert_eq!(h.client.cached(&list).await, None, "placeholder list must not survive rollback");
}

#[tokio::test]
async fn test_silent_stream_falls_back_to_polling() {
    let h = start().await;
    let handle = h.client.subscribe(Subscription::new(Topic::Bookings, scope())).await;
    let mut status = handle.watch_status();

    let fallback = wait_for_status(&mut status, |s| s.fallback_polling).await;
    assert_eq!(fallback.polling_interval, Duration::from_millis(750));
    assert_ne!(fallback.state, ChannelState::Connected);

    handle.close().await;
    assert!(!handle.status().fallback_polling);
    assert_eq!(handle.status().state, ChannelState::Disconnected);
}

#[tokio::test]
async fn test_rejected_streams_are_retried() {
    let h = start().await;
    h.backend.reject_streams.store(3, Ordering::SeqCst);

    let handle =
        h.client.subscribe(Subscription::new(Topic::Analytics, Scope::tenant(TENANT))).await;
    let mut status = handle.watch_status();
    let connected = wait_for_status(&mut status, |s| s.state == ChannelState::Connected).await;

    assert_eq!(connected.retry_count, 0);
    assert!(!connected.fallback_polling);
    assert_eq!(h.backend.sse_connections.load(Ordering::SeqCst), 4);

    assert!(h.client.unsubscribe(&handle.key()).await);
    assert!(!h.client.unsubscribe(&handle.key()).await);
}

#[tokio::test]
async fn test_refused_streams_fall_back_to_polling() {
    let h = start().await;
    h.backend.reject_streams.store(usize::MAX, Ordering::SeqCst);

    let handle =
        h.client.subscribe(Subscription::new(Topic::Analytics, Scope::tenant(TENANT))).await;
    let mut status = handle.watch_status();
    let fallback = wait_for_status(&mut status, |s| s.fallback_polling).await;

    assert_ne!(fallback.state, ChannelState::Connected);
    assert!(fallback.retry_count > 0);
    assert_eq!(fallback.polling_interval, Duration::from_millis(750));

    handle.close().await;
}

#[tokio::test]
async fn test_resubscribe_replaces_channel() {
    let h = start().await;
    let first =
        h.client.subscribe(Subscription::new(Topic::Analytics, Scope::tenant(TENANT))).await;
    let mut status = first.watch_status();
    wait_for_status(&mut status, |s| s.state == ChannelState::Connected).await;

    let second = h.client.subscribe(Subscription::new(Topic::Analytics, scope())).await;
    assert_eq!(first.status().state, ChannelState::Disconnected);
    let current = h.client.channel(&second.key()).await.unwrap();
    assert_eq!(current.subscription(), second.subscription());

    h.client.close_all().await;
    assert!(h.client.channel(&second.key()).await.is_none());
}
