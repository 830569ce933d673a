use super::file_watch::{WatchFilter, spawn_debounce_loop, validate_watch_path};
use super::webhook::{event_from_request, hmac_sha1_hex, hmac_sha256_hex, verify_webhook_auth};
use super::runner::TriggerDeps;
use super::*;
use crate::core::bus::{BusEvent, EventBus};
use crate::core::storage::Storage;
use axum::http::{HeaderMap, HeaderValue};
use notify::event::{CreateKind, DataChange, ModifyKind};
use notify::{Event, EventKind};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;

/// Records every delivered event and hands out sequential job ids.
#[derive(Default)]
struct CollectingSink {
    events: StdMutex<Vec<TriggerEvent>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<TriggerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TriggerSink for CollectingSink {
    async fn deliver(&self, _trigger: &TriggerConfig, event: TriggerEvent) -> Result<String> {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        Ok(format!("job-{}", events.len()))
    }
}

struct FailingSink;

#[async_trait]
impl TriggerSink for FailingSink {
    async fn deliver(&self, _trigger: &TriggerConfig, _event: TriggerEvent) -> Result<String> {
        Err(OrchestratorError::NotFound("workflow missing".to_string()))
    }
}

fn hmac_webhook(cooldown: u64) -> TriggerConfig {
    let mut config = TriggerConfig::new("GitHub push", TriggerType::Webhook, "deploy")
        .setting("auth_type", json!("hmac_sha256"))
        .setting("secret", json!("s3cret"));
    config.cooldown_seconds = cooldown;
    config
}

fn signed_headers(sig: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-hub-signature-256", HeaderValue::from_str(sig).unwrap());
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers
}

#[tokio::test(start_paused = true)]
async fn signed_webhook_respects_cooldown() {
    let config = hmac_webhook(30);
    let sink = Arc::new(CollectingSink::default());
    let emitter = TriggerEmitter::new(config.clone(), sink.clone());

    let body = br#"{"x":1}"#;
    let sig = format!("sha256={}", hmac_sha256_hex(b"s3cret", body));
    let headers = signed_headers(&sig);
    let (config, headers, emitter) = (&config, &headers, &emitter);

    let fire = || async move {
        verify_webhook_auth(config, headers, body).unwrap();
        let (payload, metadata) = event_from_request(headers, body);
        emitter.emit(payload, metadata).await
    };

    assert_eq!(fire().await, EmitOutcome::Submitted("job-1".to_string()));

    tokio::time::advance(Duration::from_secs(5)).await;
    match fire().await {
        EmitOutcome::Suppressed { retry_after } => {
            assert_eq!(retry_after, Duration::from_secs(25));
        }
        other => panic!("expected suppression, got {:?}", other),
    }

    tokio::time::advance(Duration::from_secs(26)).await;
    assert_eq!(fire().await, EmitOutcome::Submitted("job-2".to_string()));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload["x"], 1);
    assert_eq!(events[0].metadata["source"], "webhook");
    assert_eq!(events[0].metadata["trigger_type"], "webhook");
}

#[tokio::test]
async fn failed_submission_still_starts_cooldown() {
    let mut config = TriggerConfig::new("m", TriggerType::Manual, "wf");
    config.cooldown_seconds = 60;
    let emitter = TriggerEmitter::new(config, Arc::new(FailingSink));
    assert!(matches!(
        emitter.emit(Map::new(), Map::new()).await,
        EmitOutcome::Failed(_)
    ));
    assert!(matches!(
        emitter.emit(Map::new(), Map::new()).await,
        EmitOutcome::Suppressed { .. }
    ));
}

#[test]
fn flipping_any_signature_byte_is_rejected() {
    let config = hmac_webhook(0);
    let body = br#"{"x":1}"#;
    let good = hmac_sha256_hex(b"s3cret", body);
    assert!(verify_webhook_auth(&config, &signed_headers(&good), body).is_ok());

    for i in 0..good.len() {
        let mut bad = good.clone().into_bytes();
        bad[i] = if bad[i] == b'0' { b'1' } else { b'0' };
        let bad = String::from_utf8(bad).unwrap();
        let err = verify_webhook_auth(&config, &signed_headers(&bad), body).unwrap_err();
        assert_eq!(err.error_type(), "AuthenticationError");
    }

    // Same signature, different body.
    assert!(verify_webhook_auth(&config, &signed_headers(&good), br#"{"x":2}"#).is_err());
}

#[test]
fn sha1_signatures_use_their_own_header() {
    let config = TriggerConfig::new("legacy", TriggerType::Webhook, "wf")
        .setting("auth_type", json!("hmac_sha1"))
        .setting("secret", json!("k"));
    let body = b"payload";
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-hub-signature",
        HeaderValue::from_str(&format!("sha1={}", hmac_sha1_hex(b"k", body))).unwrap(),
    );
    assert!(verify_webhook_auth(&config, &headers, body).is_ok());
    assert!(verify_webhook_auth(&config, &HeaderMap::new(), body).is_err());
}

#[test]
fn api_key_and_bearer_auth() {
    let api = TriggerConfig::new("a", TriggerType::Webhook, "wf")
        .setting("auth_type", json!("api_key"))
        .setting("api_key", json!("abc"));
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", HeaderValue::from_static("abc"));
    assert!(verify_webhook_auth(&api, &headers, b"").is_ok());
    headers.insert("x-api-key", HeaderValue::from_static("abd"));
    assert!(verify_webhook_auth(&api, &headers, b"").is_err());

    let bearer = TriggerConfig::new("b", TriggerType::Webhook, "wf")
        .setting("auth_type", json!("bearer"))
        .setting("token", json!("tok"));
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
    assert!(verify_webhook_auth(&bearer, &headers, b"").is_ok());
    headers.insert("authorization", HeaderValue::from_static("Basic tok"));
    assert!(verify_webhook_auth(&bearer, &headers, b"").is_err());
}

#[test]
fn missing_secret_is_a_configuration_error() {
    let config = TriggerConfig::new("w", TriggerType::Webhook, "wf")
        .setting("auth_type", json!("hmac_sha256"));
    assert!(config.validate().is_err());
    let err = verify_webhook_auth(&config, &HeaderMap::new(), b"{}").unwrap_err();
    assert_eq!(err.error_type(), "ConfigurationError");
}

#[test]
fn non_object_bodies_are_wrapped() {
    let headers = HeaderMap::new();
    let (payload, _) = event_from_request(&headers, b"[1,2]");
    assert_eq!(payload["data"], json!([1, 2]));
    let (payload, metadata) = event_from_request(&headers, b"plain text");
    assert_eq!(payload["body"], "plain text");
    assert_eq!(metadata["body_bytes"], 10);
}

fn modify_event(path: &str) -> notify::Result<Event> {
    Ok(Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(PathBuf::from(path)))
}

#[tokio::test(start_paused = true)]
async fn rapid_file_events_collapse_into_one_emission() {
    let config = TriggerConfig::new("inbox", TriggerType::FileWatch, "ingest")
        .setting("path", json!("/srv/inbox"))
        .setting("patterns", json!(["*.csv"]));
    let filter = WatchFilter::from_config(&config).unwrap();
    let sink = Arc::new(CollectingSink::default());
    let emitter = TriggerEmitter::new(config, sink.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = spawn_debounce_loop(
        PathBuf::from("/srv/inbox"),
        rx,
        filter,
        Duration::from_millis(200),
        emitter,
        cancel.clone(),
    );

    tx.send(Ok(Event::new(EventKind::Create(CreateKind::File))
        .add_path(PathBuf::from("/srv/inbox/a.csv"))))
        .unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(modify_event("/srv/inbox/a.csv")).unwrap();
    }
    // Filtered out by the glob.
    tx.send(modify_event("/srv/inbox/notes.txt")).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(sink.events().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["event_type"], "modified");
    assert_eq!(events[0].payload["file_name"], "a.csv");
    assert_eq!(events[0].payload["watch_path"], "/srv/inbox");
    assert_eq!(events[0].metadata["source"], "file_watch");

    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn watch_paths_are_restricted() {
    assert!(validate_watch_path("/srv/../etc").is_err());
    assert!(validate_watch_path("/").is_err());
    assert!(validate_watch_path("").is_err());
    #[cfg(unix)]
    {
        assert!(validate_watch_path("/etc").is_err());
        assert!(validate_watch_path("/etc/nginx").is_err());
        assert!(validate_watch_path("/tmp/drop").is_ok());
    }
}

#[test]
fn config_round_trips_through_json() {
    let config = hmac_webhook(10);
    let json = serde_json::to_string(&config).unwrap();
    let back: TriggerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);

    let minimal: TriggerConfig = serde_json::from_value(json!({
        "name": "n",
        "trigger_type": "manual",
        "workflow_id": "wf"
    }))
    .unwrap();
    assert!(minimal.enabled);
    assert!(!minimal.id.is_empty());
    assert_eq!(minimal.priority, JobPriority::Normal);
}

#[test]
fn trigger_types_parse_from_their_names() {
    for t in TriggerType::ALL {
        assert_eq!(TriggerType::parse(t.as_str()), Some(t));
    }
    assert_eq!(TriggerType::parse("email"), None);
}

async fn runner_with(sink: Arc<dyn TriggerSink>) -> (TriggerRunner, Storage, Arc<EventBus>) {
    let storage = Storage::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let deps = TriggerDeps {
        bus: bus.clone(),
        scheduler: Arc::new(Mutex::new(JobScheduler::new().await.unwrap())),
    };
    (TriggerRunner::new(storage.clone(), sink, deps), storage, bus)
}

async fn wait_for_events(sink: &CollectingSink, n: usize) -> Vec<TriggerEvent> {
    for _ in 0..200 {
        let events = sink.events();
        if events.len() >= n {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sink.events()
}

#[tokio::test]
async fn invalid_stored_trigger_is_listed_in_error() {
    let (runner, storage, _) = runner_with(Arc::new(CollectingSink::default())).await;
    let broken = TriggerConfig::new("Inbox", TriggerType::FileWatch, "ingest");
    let manual = TriggerConfig::new("Manual", TriggerType::Manual, "ingest");
    storage.save_trigger(&broken).await.unwrap();
    storage.save_trigger(&manual).await.unwrap();

    assert_eq!(runner.load_and_start_all().await.unwrap(), 1);
    let views = runner.list().await;
    assert_eq!(views.len(), 2);

    let view = runner.get(&broken.id).await.unwrap();
    assert_eq!(view.state, TriggerState::Error);
    assert!(view.error_message.unwrap().contains("requires 'path'"));
    let err = runner.fire(&broken.id, Map::new()).await.unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    assert_eq!(runner.get(&manual.id).await.unwrap().state, TriggerState::Running);
}

#[tokio::test]
async fn stop_is_idempotent_after_failed_start() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let (runner, _, _) = runner_with(Arc::new(CollectingSink::default())).await;
    let config = TriggerConfig::new("Inbox", TriggerType::FileWatch, "ingest")
        .setting("path", json!(missing.to_string_lossy()));

    let view = runner.add(config.clone()).await.unwrap();
    assert_eq!(view.state, TriggerState::Error);
    assert!(view.error_message.unwrap().contains("does not exist"));

    runner.stop_all().await;
    runner.stop_all().await;
    let view = runner.get(&config.id).await.unwrap();
    assert_eq!(view.state, TriggerState::Stopped);
    assert!(view.error_message.is_none());
    assert!(runner.remove(&config.id).await.unwrap());
}

#[test]
fn out_of_range_trigger_timeout_is_rejected() {
    let config = TriggerConfig::new("m", TriggerType::Manual, "wf")
        .setting("timeout_seconds", json!(10_000_000_000_000u64));
    assert_eq!(config.validate().unwrap_err().error_type(), "ConfigurationError");
    let config = config.setting("timeout_seconds", json!(600));
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn app_event_trigger_fires_from_the_bus() {
    let sink = Arc::new(CollectingSink::default());
    let (runner, _, bus) = runner_with(sink.clone()).await;
    let config = TriggerConfig::new("Invoice window", TriggerType::AppEvent, "invoices")
        .setting("event_types", json!(["window.focused", "job.queued"]))
        .setting("pattern", json!("Invoice"))
        .setting("poll_interval_ms", json!(10));
    let view = runner.add(config.clone()).await.unwrap();
    assert_eq!(view.state, TriggerState::Running);

    let mut data = Map::new();
    data.insert("title".to_string(), json!("Invoice 42 - Excel"));
    bus.publish(BusEvent::new("window.focused", data.clone()));
    let events = wait_for_events(&sink, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trigger_id, config.id);
    assert_eq!(events[0].payload["event_type"], "window.focused");
    assert_eq!(events[0].metadata["source"], "app_event");

    // Own jobs and other triggers' submissions are ignored.
    let mut own = data.clone();
    own.insert("trigger_id".to_string(), json!(config.id));
    bus.publish(BusEvent::new("window.focused", own));
    let mut other = data.clone();
    other.insert("trigger_id".to_string(), json!("another-trigger"));
    bus.publish(BusEvent::new("job.queued", other));

    data.insert("title".to_string(), json!("Invoice 43 - Excel"));
    bus.publish(BusEvent::new("window.focused", data));
    let events = wait_for_events(&sink, 2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].payload["data"]["title"], "Invoice 43 - Excel");

    // Counters are written after delivery returns.
    let mut view = runner.get(&config.id).await.unwrap();
    for _ in 0..200 {
        if view.config.trigger_count == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        view = runner.get(&config.id).await.unwrap();
    }
    assert_eq!(view.config.trigger_count, 2);
    assert_eq!(view.config.success_count, 2);

    runner.stop_all().await;
    assert_eq!(bus.subscriber_count(), 0);
}
