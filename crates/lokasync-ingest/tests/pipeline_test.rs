//! End-to-end behaviour of the ingest pipeline without a broker.
//!
//! Messages enter through `handle_inbound`, exactly as the network thread
//! delivers them, and the dispatcher is drained before assertions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::runtime::Handle;

use lokasync_core::{CompositeKey, Config, FieldSet, FlashStatus, UpdateSession, PROGRESS_FIELDS};
use lokasync_ingest::{
    decode, handle_inbound, ConnectionStatus, Dispatcher, InboundMessage, IngestError,
    IngestStats, LogIngestService, MessagePublisher, Notifier, Pipeline, Qos, TransportError,
    UpsertEngine,
};
use lokasync_storage::{
    Error as StorageError, FilterOptions, LogFilter, MemorySessionStore, SessionStore,
    UpsertOutcome,
};

const LIVE_TOPIC: &str = "lokasync/ota/log/live";
const DRAIN: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingPublisher {
    offline: AtomicBool,
    sent: Mutex<Vec<(String, Value, Qos)>>,
}

impl RecordingPublisher {
    fn offline() -> Self {
        let publisher = Self::default();
        publisher.offline.store(true, Ordering::SeqCst);
        publisher
    }

    fn sent(&self) -> Vec<(String, Value, Qos)> {
        self.sent.lock().clone()
    }
}

impl MessagePublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let value = serde_json::from_slice(&payload).unwrap();
        self.sent.lock().push((topic.to_string(), value, qos));
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        if self.offline.load(Ordering::SeqCst) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connected
        }
    }
}

/// Store that fails every operation.
struct UnavailableStore;

fn unavailable<T>() -> lokasync_storage::Result<T> {
    Err(StorageError::Storage("store unavailable".to_string()))
}

#[async_trait]
impl SessionStore for UnavailableStore {
    async fn find_one(&self, _: &CompositeKey) -> lokasync_storage::Result<Option<UpdateSession>> {
        unavailable()
    }

    async fn update_fields(&self, _: &CompositeKey, _: &FieldSet) -> lokasync_storage::Result<bool> {
        unavailable()
    }

    async fn insert(&self, _: UpdateSession) -> lokasync_storage::Result<UpdateSession> {
        unavailable()
    }

    async fn upsert(
        &self,
        _: &CompositeKey,
        _: &FieldSet,
        _: DateTime<Utc>,
    ) -> lokasync_storage::Result<UpsertOutcome> {
        unavailable()
    }

    async fn list(
        &self,
        _: &LogFilter,
        _: usize,
        _: usize,
    ) -> lokasync_storage::Result<Vec<UpdateSession>> {
        unavailable()
    }

    async fn count(&self, _: &LogFilter) -> lokasync_storage::Result<usize> {
        unavailable()
    }

    async fn get_by_session_id(&self, _: &str) -> lokasync_storage::Result<Option<UpdateSession>> {
        unavailable()
    }

    async fn delete_by_session_id(&self, _: &str) -> lokasync_storage::Result<usize> {
        unavailable()
    }

    async fn filter_options(&self) -> lokasync_storage::Result<FilterOptions> {
        unavailable()
    }
}

struct Harness {
    store: Arc<dyn SessionStore>,
    publisher: Arc<RecordingPublisher>,
    stats: Arc<IngestStats>,
    pipeline: Arc<Pipeline>,
}

impl Harness {
    fn new() -> Self {
        Self::with(Arc::new(MemorySessionStore::new()), RecordingPublisher::default())
    }

    fn with(store: Arc<dyn SessionStore>, publisher: RecordingPublisher) -> Self {
        let publisher = Arc::new(publisher);
        let stats = Arc::new(IngestStats::new());
        let notifier = Notifier::new(
            publisher.clone(),
            LIVE_TOPIC,
            Qos::AtLeastOnce,
            chrono_tz::Asia::Jakarta,
        );
        let pipeline = Arc::new(Pipeline::new(
            UpsertEngine::new(Arc::clone(&store)),
            notifier,
            Arc::clone(&stats),
        ));
        Self {
            store,
            publisher,
            stats,
            pipeline,
        }
    }

    /// Deliver `messages` through a fresh dispatcher and wait for all of them.
    async fn deliver(&self, messages: Vec<InboundMessage>) {
        let dispatcher = Dispatcher::spawn(&Handle::current(), Arc::clone(&self.pipeline));
        let dispatch = dispatcher.handle();
        for message in messages {
            handle_inbound(message, &dispatch, &self.stats);
        }
        dispatcher.shutdown(DRAIN).await;
    }

    async fn all(&self) -> Vec<UpdateSession> {
        self.store.list(&LogFilter::default(), 0, 100).await.unwrap()
    }
}

fn identity(session_id: &str) -> Value {
    json!({
        "session_id": session_id,
        "node_mac": "00:1A:2B:3C:4D:5E",
        "node_location": "Cibubur-SayuranPagi",
        "node_type": "Pembibitan",
        "node_id": "1a",
        "node_codename": "cibubur-sayuranpagi_pembibitan_1a",
        "firmware_version": "1.0.0",
    })
}

fn device_message(session_id: &str, message: &str, data: Option<Value>) -> InboundMessage {
    let mut body = identity(session_id);
    body["message"] = json!(message);
    if let Some(data) = data {
        body["data"] = data;
    }
    InboundMessage {
        topic: "lokasync/ota/log".to_string(),
        payload: serde_json::to_vec(&body).unwrap(),
        qos: Qos::AtLeastOnce,
        retain: false,
    }
}

#[tokio::test]
async fn test_started_then_size() {
    let harness = Harness::new();
    harness
        .deliver(vec![
            device_message("session-001", "OTA update started", None),
            device_message("session-001", "Firmware size OK", Some(json!({"size_kb": 1024}))),
        ])
        .await;

    let sessions = harness.all().await;
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.flash_status, FlashStatus::InProgress);
    assert!(session.download_started_at.is_some());
    assert_eq!(session.firmware_size_kb, Some(1024.0));
    assert!(session.bytes_written.is_none());
    assert!(session.download_duration_sec.is_none());
    assert!(session.download_speed_kbps.is_none());
    assert!(session.download_completed_at.is_none());
    assert!(session.flash_completed_at.is_none());
}

#[tokio::test]
async fn test_full_session_ends_in_success() {
    let harness = Harness::new();
    harness
        .deliver(vec![
            device_message("session-001", "OTA update started", None),
            device_message("session-001", "Firmware size OK", Some(json!({"size_kb": 1024}))),
            device_message("session-001", "Firmware bytes written", Some(json!({"bytes": 1048576}))),
            device_message("session-001", "Download time (s)", Some(json!({"seconds": 12.5}))),
            device_message("session-001", "Download speed (kb/s)", Some(json!({"speed_kbps": 81.92}))),
            device_message("session-001", "Download complete", None),
        ])
        .await;
    harness
        .deliver(vec![device_message("session-001", "OTA update complete", None)])
        .await;

    let sessions = harness.all().await;
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.flash_status, FlashStatus::Success);
    assert!(session.flash_completed_at.is_some());
    assert!(session.download_started_at.is_some());
    assert!(session.download_completed_at.is_some());
    assert_eq!(session.firmware_size_kb, Some(1024.0));
    assert_eq!(session.bytes_written, Some(1_048_576));
    assert_eq!(session.download_duration_sec, Some(12.5));
    assert_eq!(session.download_speed_kbps, Some(81.92));

    let counters = harness.stats.snapshot();
    assert_eq!(counters.received, 7);
    assert_eq!(counters.upserted, 7);
    assert_eq!(counters.published, 7);
}

#[tokio::test]
async fn test_started_after_complete_resets_status() {
    let harness = Harness::new();
    harness
        .deliver(vec![device_message("session-001", "OTA update complete", None)])
        .await;
    assert_eq!(harness.all().await[0].flash_status, FlashStatus::Success);

    harness
        .deliver(vec![device_message("session-001", "OTA update started", None)])
        .await;

    let sessions = harness.all().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].flash_status, FlashStatus::InProgress);
    assert!(sessions[0].flash_completed_at.is_some());
    assert!(sessions[0].download_started_at.is_some());

    let (_, body, _) = harness.publisher.sent().pop().unwrap();
    assert_eq!(body["flash_status"], json!("in progress"));
}

#[tokio::test]
async fn test_out_of_order_arrival_is_accepted() {
    let harness = Harness::new();
    harness
        .deliver(vec![device_message("session-001", "OTA update complete", None)])
        .await;
    harness
        .deliver(vec![device_message(
            "session-001",
            "Firmware size OK",
            Some(json!({"size_kb": 512})),
        )])
        .await;

    let session = harness.all().await.remove(0);
    assert_eq!(session.flash_status, FlashStatus::Success);
    assert_eq!(session.firmware_size_kb, Some(512.0));
}

#[tokio::test]
async fn test_retained_message_is_dropped() {
    let harness = Harness::new();
    let mut retained = device_message("session-001", "OTA update started", None);
    retained.retain = true;
    harness.deliver(vec![retained]).await;

    assert!(harness.all().await.is_empty());
    let counters = harness.stats.snapshot();
    assert_eq!(counters.received, 1);
    assert_eq!(counters.retained_dropped, 1);
    assert_eq!(counters.dispatched, 0);
}

#[tokio::test]
async fn test_missing_identity_field_creates_nothing() {
    let harness = Harness::new();
    let mut body = identity("session-001");
    body.as_object_mut().unwrap().remove("node_codename");
    body["message"] = json!("OTA update started");
    let message = InboundMessage {
        topic: "lokasync/ota/log".to_string(),
        payload: serde_json::to_vec(&body).unwrap(),
        qos: Qos::AtLeastOnce,
        retain: false,
    };
    harness.deliver(vec![message]).await;

    assert!(harness.all().await.is_empty());
    assert_eq!(harness.stats.snapshot().rejected, 1);
    assert!(harness.publisher.sent().is_empty());
}

#[tokio::test]
async fn test_missing_field_leaves_existing_record_untouched() {
    let harness = Harness::new();
    harness
        .deliver(vec![device_message("session-001", "OTA update started", None)])
        .await;
    let before = harness.all().await;

    let mut body = identity("session-001");
    body["node_mac"] = json!("");
    body["message"] = json!("OTA update complete");
    let message = InboundMessage {
        topic: "lokasync/ota/log".to_string(),
        payload: serde_json::to_vec(&body).unwrap(),
        qos: Qos::AtLeastOnce,
        retain: false,
    };
    harness.deliver(vec![message]).await;

    assert_eq!(harness.all().await, before);
}

#[tokio::test]
async fn test_unknown_and_malformed_messages_are_skipped() {
    let harness = Harness::new();
    let malformed = InboundMessage {
        topic: "lokasync/ota/log".to_string(),
        payload: b"{\"session_id\": ".to_vec(),
        qos: Qos::AtMostOnce,
        retain: false,
    };
    harness
        .deliver(vec![
            device_message("session-001", "Rebooting into new firmware", None),
            device_message("session-001", "Firmware size OK", None),
            malformed,
        ])
        .await;

    assert!(harness.all().await.is_empty());
    assert_eq!(harness.stats.snapshot().rejected, 3);
}

#[tokio::test]
async fn test_same_message_twice_is_idempotent() {
    let harness = Harness::new();
    let now = Utc::now();
    let message = device_message("session-001", "Firmware size OK", Some(json!({"size_kb": 1024})));

    let event = decode(&message.payload, now).unwrap();
    let once = harness.pipeline.process(event.clone()).await.unwrap();
    let twice = harness.pipeline.process(event).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(harness.all().await.len(), 1);
}

#[tokio::test]
async fn test_last_write_wins_per_field() {
    let harness = Harness::new();
    let now = Utc::now();
    for size in [1024, 2048] {
        let message = device_message("session-001", "Firmware size OK", Some(json!({"size_kb": size})));
        let event = decode(&message.payload, now).unwrap();
        harness.pipeline.process(event).await.unwrap();
    }

    let session = harness.all().await.remove(0);
    assert_eq!(session.firmware_size_kb, Some(2048.0));
}

#[tokio::test]
async fn test_first_sight_has_explicit_nulls() {
    let harness = Harness::new();
    harness
        .deliver(vec![device_message("session-001", "Download complete", None)])
        .await;

    let (_, published, _) = harness.publisher.sent().remove(0);
    for field in PROGRESS_FIELDS {
        if field == "download_completed_at" {
            assert!(published[field].is_string());
        } else {
            assert!(published[field].is_null(), "{} should be null", field);
        }
    }
    assert_eq!(published["flash_status"], "in progress");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_identities_stay_separate() {
    let harness = Harness::new();
    let dispatcher = Dispatcher::spawn(&Handle::current(), Arc::clone(&harness.pipeline));

    let threads: Vec<_> = ["session-A", "session-B"]
        .into_iter()
        .map(|session_id| {
            let dispatch = dispatcher.handle();
            let stats = Arc::clone(&harness.stats);
            std::thread::spawn(move || {
                for message in [
                    device_message(session_id, "OTA update started", None),
                    device_message(session_id, "Firmware size OK", Some(json!({"size_kb": 100}))),
                ] {
                    handle_inbound(message, &dispatch, &stats);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    dispatcher.shutdown(DRAIN).await;

    let sessions = harness.all().await;
    assert_eq!(sessions.len(), 2);
    let mut ids: Vec<_> = sessions.iter().map(|s| s.key.session_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["session-A", "session-B"]);
    for session in &sessions {
        assert!(session.download_started_at.is_some());
        assert_eq!(session.firmware_size_kb, Some(100.0));
    }
}

#[tokio::test]
async fn test_notifier_publishes_wire_form() {
    let harness = Harness::new();
    harness
        .deliver(vec![device_message("session-001", "OTA update started", None)])
        .await;

    let sent = harness.publisher.sent();
    assert_eq!(sent.len(), 1);
    let (topic, body, qos) = &sent[0];
    assert_eq!(topic, LIVE_TOPIC);
    assert_eq!(*qos, Qos::AtLeastOnce);
    assert_eq!(body["session_id"], "session-001");
    assert_eq!(body["node_codename"], "cibubur-sayuranpagi_pembibitan_1a");
    assert_eq!(body["flash_status"], "in progress");

    let started = body["download_started_at"].as_str().unwrap();
    assert!(
        chrono::NaiveDateTime::parse_from_str(started, "%Y-%m-%d %H:%M:%S").is_ok(),
        "unexpected datetime format {}",
        started
    );
    assert!(body["created_at"].is_string());
}

#[tokio::test]
async fn test_publish_failure_keeps_store_write() {
    let harness = Harness::with(
        Arc::new(MemorySessionStore::new()),
        RecordingPublisher::offline(),
    );
    harness
        .deliver(vec![device_message("session-001", "OTA update started", None)])
        .await;

    assert_eq!(harness.all().await.len(), 1);
    let counters = harness.stats.snapshot();
    assert_eq!(counters.upserted, 1);
    assert_eq!(counters.published, 0);
    assert_eq!(counters.publish_failed, 1);
}

#[tokio::test]
async fn test_store_failure_is_reported_not_published() {
    let harness = Harness::with(Arc::new(UnavailableStore), RecordingPublisher::default());
    let message = device_message("session-001", "OTA update started", None);
    let event = decode(&message.payload, Utc::now()).unwrap();

    let result = harness.pipeline.process(event).await;
    assert!(matches!(result, Err(IngestError::Storage(_))));

    harness
        .deliver(vec![device_message("session-001", "Download complete", None)])
        .await;

    assert!(harness.publisher.sent().is_empty());
    assert_eq!(harness.stats.snapshot().failed, 2);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_counted() {
    let harness = Harness::new();
    let dispatcher = Dispatcher::spawn(&Handle::current(), Arc::clone(&harness.pipeline));
    let dispatch = dispatcher.handle();
    dispatcher.shutdown(DRAIN).await;

    handle_inbound(
        device_message("session-001", "OTA update started", None),
        &dispatch,
        &harness.stats,
    );

    assert!(dispatch.is_closed());
    assert!(harness.all().await.is_empty());
    assert_eq!(harness.stats.snapshot().failed, 1);
}

fn service_config() -> Config {
    let mut config = Config::from_toml_str("").unwrap();
    config.mqtt.broker_url = "127.0.0.1:1".to_string();
    config.mqtt.subscribe_topic = "lokasync/ota/log".to_string();
    config.mqtt.publish_topic = LIVE_TOPIC.to_string();
    config.mqtt.connect_timeout_secs = 0;
    config.mqtt.reconnect_interval_ms = 50;
    config
}

#[tokio::test]
async fn test_service_rejects_invalid_config() {
    let mut config = service_config();
    config.mqtt.subscribe_topic.clear();
    let result = LogIngestService::new(config, Arc::new(MemorySessionStore::new()));
    assert!(matches!(result, Err(IngestError::Core(_))));
}

#[tokio::test]
async fn test_service_survives_unreachable_broker() {
    let service =
        LogIngestService::new(service_config(), Arc::new(MemorySessionStore::new())).unwrap();
    assert!(!service.health().running);
    assert!(matches!(service.stop().await, Err(IngestError::NotRunning)));

    service.start().await.unwrap();
    assert!(matches!(service.start().await, Err(IngestError::AlreadyRunning)));

    let health = service.health();
    assert!(health.running);
    assert_ne!(health.connection, ConnectionStatus::Connected);
    assert_eq!(health.publish_topic, LIVE_TOPIC);

    service.stop().await.unwrap();
    let health = service.health();
    assert!(!health.running);
    assert_eq!(health.connection, ConnectionStatus::Disconnected);
}
