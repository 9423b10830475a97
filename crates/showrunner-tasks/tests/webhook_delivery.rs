//! Webhook deliverer tests against a local HTTP receiver

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use showrunner_tasks::{
    MemoryStore, Priority, TaskRecord, TaskState, TaskStore, TerminalEvent, TaskType,
    WebhookConfig, WebhookDeliverer,
};

#[derive(Clone)]
struct Received {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Number of 500s to answer before accepting
    fail_first: Arc<AtomicU32>,
}

async fn hook(State(state): State<Received>, body: axum::body::Bytes) -> StatusCode {
    state.bodies.lock().unwrap().push(body.to_vec());
    if state.fail_first.load(Ordering::SeqCst) > 0 {
        state.fail_first.fetch_sub(1, Ordering::SeqCst);
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// Spawn a one-route receiver; returns its URL and the captured bodies
async fn spawn_receiver(fail_first: u32) -> (String, Received) {
    let received = Received {
        bodies: Arc::new(Mutex::new(Vec::new())),
        fail_first: Arc::new(AtomicU32::new(fail_first)),
    };
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(received.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/hook", addr), received)
}

fn terminal_event(callback_url: &str, state: TaskState) -> TerminalEvent {
    let mut record = TaskRecord::new(
        "P1",
        TaskType::EvaluateDepartment,
        serde_json::json!({"department": "story"}),
        Priority::High,
        Duration::from_secs(86_400),
    )
    .with_callback_url(callback_url)
    .with_metadata(serde_json::json!({"trace": "t-1"}));
    record.state = state;
    record.started_at = Some(chrono::Utc::now());
    record.finished_at = Some(chrono::Utc::now());
    if state == TaskState::Completed {
        record.result = Some(serde_json::json!({"rating": 89}));
    }
    TerminalEvent::from_record(&record)
}

fn fast_config() -> WebhookConfig {
    WebhookConfig {
        timeout: Duration::from_secs(2),
        max_attempts: 4,
        backoff_base: Duration::from_millis(50),
        concurrency: 4,
    }
}

#[tokio::test]
async fn delivers_completed_envelope_on_first_attempt() {
    let (url, received) = spawn_receiver(0).await;
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());

    let deliverer = Arc::new(WebhookDeliverer::new(store.clone(), fast_config()).unwrap());
    let runner = deliverer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .publish_terminal(&terminal_event(&url, TaskState::Completed))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let bodies = received.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);

    let envelope: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(envelope["state"], "completed");
    assert_eq!(envelope["projectId"], "P1");
    assert_eq!(envelope["result"]["rating"], 89);
    assert_eq!(envelope["metadata"]["trace"], "t-1");

    deliverer.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn retries_on_500_with_identical_payload() {
    let (url, received) = spawn_receiver(2).await;
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());

    let deliverer = Arc::new(WebhookDeliverer::new(store.clone(), fast_config()).unwrap());
    let runner = deliverer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .publish_terminal(&terminal_event(&url, TaskState::Completed))
        .await
        .unwrap();

    // Backoff 50ms + 100ms before the third (successful) attempt
    tokio::time::sleep(Duration::from_millis(600)).await;
    let bodies = received.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[1], bodies[2]);

    deliverer.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    let (url, received) = spawn_receiver(u32::MAX).await;
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());

    let deliverer = Arc::new(WebhookDeliverer::new(store.clone(), fast_config()).unwrap());
    let runner = deliverer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .publish_terminal(&terminal_event(&url, TaskState::Failed))
        .await
        .unwrap();

    // 4 attempts with 50/100/200ms backoff, then dropped for good
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(received.bodies.lock().unwrap().len(), 4);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(received.bodies.lock().unwrap().len(), 4);

    deliverer.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn skips_events_without_callback_url() {
    let (url, received) = spawn_receiver(0).await;
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());

    let deliverer = Arc::new(WebhookDeliverer::new(store.clone(), fast_config()).unwrap());
    let runner = deliverer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut event = terminal_event(&url, TaskState::Completed);
    event.callback_url = None;
    store.publish_terminal(&event).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(received.bodies.lock().unwrap().is_empty());

    deliverer.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_event_delivers_cancelled_envelope() {
    let (url, received) = spawn_receiver(0).await;
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());

    let deliverer = Arc::new(WebhookDeliverer::new(store.clone(), fast_config()).unwrap());
    let runner = deliverer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .publish_terminal(&terminal_event(&url, TaskState::Cancelled))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let bodies = received.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let envelope: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(envelope["state"], "cancelled");

    deliverer.shutdown();
    handle.await.unwrap().unwrap();
}
