//! End-to-end offline behaviour of the worker.

use std::sync::Arc;

use bridgenotary_core::WorkerConfig;
use bridgenotary_net::mock::ScriptedFetcher;
use bridgenotary_net::Request;
use bridgenotary_store::{
    CacheKey, CacheStorage, MemoryCacheStorage, MemoryQueueStore, Payload, QueueStore,
    SqliteCacheStorage, SqliteQueueStore,
};
use bridgenotary_sw::{
    ServiceWorker, SubmissionOutcome, SyncReport, WorkerEvent, WorkerHandles, WorkerState,
    OFFLINE_BODY,
};
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "https://bridgenotary.com";
const RELAY: &str = "https://bridgenotary.com/api/request-form";
const JANE: &str = r#"{"fullName":"Jane Doe","email":"jane@x.com","phone":"5551234567","serviceType":"Loan signing"}"#;

struct Harness {
    fetcher: Arc<ScriptedFetcher>,
    caches: Arc<MemoryCacheStorage>,
    queue: Arc<MemoryQueueStore>,
    worker: ServiceWorker,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

fn harness_with(version: &str, caches: Arc<MemoryCacheStorage>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fetcher = Arc::new(ScriptedFetcher::new());
    let queue = Arc::new(MemoryQueueStore::new());
    let config = WorkerConfig {
        origin: ORIGIN.to_string(),
        cache_version: version.to_string(),
        ..Default::default()
    };
    let handles = WorkerHandles {
        fetcher: fetcher.clone(),
        caches: caches.clone(),
        queue: queue.clone(),
    };
    let (worker, events) = ServiceWorker::new(&config, handles).unwrap();
    Harness {
        fetcher,
        caches,
        queue,
        worker,
        events,
    }
}

async fn active_harness() -> Harness {
    let h = harness_with("v1", Arc::new(MemoryCacheStorage::new()));
    for path in ["/", "/index.html", "/manifest.json"] {
        h.fetcher
            .respond(Method::GET, &format!("{ORIGIN}{path}"), 200, "<html></html>");
    }
    h.worker.start().await.unwrap();
    assert_eq!(h.worker.state().await, WorkerState::Activated);
    h
}

fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
}

#[tokio::test]
async fn test_cross_origin_request_is_not_intercepted() {
    let h = active_harness().await;
    let calls_before = h.fetcher.call_count();

    let response = h
        .worker
        .handle_fetch(get("https://fonts.googleapis.com/css2?family=Inter"))
        .await;

    assert!(response.is_none());
    assert_eq!(h.fetcher.call_count(), calls_before);
    for name in h.worker.partitions().names() {
        let key = CacheKey::get("https://fonts.googleapis.com/css2?family=Inter");
        assert!(h.caches.match_entry(name, &key).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_static_asset_served_from_cache_after_first_fetch() {
    let h = active_harness().await;
    let logo = format!("{ORIGIN}/images/logo.png");
    h.fetcher.respond(Method::GET, &logo, 200, vec![0x89, b'P', b'N', b'G']);

    let first = h.worker.handle_fetch(get(&logo)).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert!(!first.from_cache);

    h.fetcher.set_offline(true);
    let second = h.worker.handle_fetch(get(&logo)).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(h.fetcher.calls_to(&logo), 1);
}

#[tokio::test]
async fn test_api_response_survives_going_offline() {
    let h = active_harness().await;
    let url = format!("{ORIGIN}/api/services");
    h.fetcher
        .respond(Method::GET, &url, 200, r#"{"services":["apostille"]}"#);

    let live = h.worker.handle_fetch(get(&url)).await.unwrap();
    assert!(!live.from_cache);

    h.fetcher.set_offline(true);
    let offline = h.worker.handle_fetch(get(&url)).await.unwrap();
    assert_eq!(offline.status, StatusCode::OK);
    assert!(offline.from_cache);
    assert_eq!(offline.text().unwrap(), r#"{"services":["apostille"]}"#);
}

#[tokio::test]
async fn test_offline_form_post_gets_503() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let request = Request::post_json(Url::parse(RELAY).unwrap(), Bytes::from_static(JANE.as_bytes()));
    let response = h.worker.handle_fetch(request).await.unwrap();

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().unwrap(), OFFLINE_BODY);
    assert_eq!(h.caches.len("bridgenotary-api-v1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_precached_shell_served_offline() {
    let h = active_harness().await;
    let calls_before = h.fetcher.call_count();
    h.fetcher.set_offline(true);

    for path in ["/", "/index.html"] {
        let response = h
            .worker
            .handle_fetch(get(&format!("{ORIGIN}{path}")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK, "{path}");
        assert!(response.from_cache, "{path}");
        assert_eq!(response.text().unwrap(), "<html></html>");
    }
    assert_eq!(h.fetcher.call_count(), calls_before + 2);
}

#[tokio::test]
async fn test_reinstall_keeps_intercepting() {
    let h = active_harness().await;
    let logo = format!("{ORIGIN}/images/logo.png");
    h.fetcher.respond(Method::GET, &logo, 200, vec![0x89, b'P', b'N', b'G']);

    let report = h.worker.install().await.unwrap();
    assert_eq!(report.failed, Vec::<String>::new());
    assert_eq!(h.worker.state().await, WorkerState::Installed);

    let response = h.worker.handle_fetch(get(&logo)).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.fetcher.calls_to(&logo), 1);
}

#[tokio::test]
async fn test_uncached_document_offline_gets_503() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let response = h
        .worker
        .handle_fetch(get(&format!("{ORIGIN}/client-portal")))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_queued_form_is_delivered_on_sync() {
    let mut h = active_harness().await;
    h.fetcher.set_offline(true);

    let outcome = h.worker.submit_form(Payload::new(JANE)).await;
    let SubmissionOutcome::Queued { id } = outcome else {
        panic!("expected Queued, got {outcome:?}");
    };
    assert_eq!(h.queue.count().await.unwrap(), 1);

    h.fetcher.set_offline(false);
    h.fetcher
        .respond(Method::POST, RELAY, 200, r#"{"success":true,"id":"form-1"}"#);
    let report = h.worker.handle_sync("sync-forms").await.unwrap().unwrap();

    assert_eq!(report.replayed, 1);
    assert!(h.queue.get(&id).await.unwrap().is_none());

    let replay = h
        .fetcher
        .calls()
        .into_iter()
        .filter(|call| call.method == Method::POST)
        .last()
        .unwrap();
    assert_eq!(replay.body.as_deref(), Some(JANE.as_bytes()));

    let mut synced = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, WorkerEvent::SyncCompleted(_)) {
            synced = true;
        }
    }
    assert!(synced);
}

#[tokio::test]
async fn test_failed_replay_keeps_payload_intact() {
    let h = active_harness().await;
    let queued = h.worker.enqueue_submission(Payload::new(JANE)).await.unwrap();

    h.fetcher.respond(Method::POST, RELAY, 500, "relay down");
    let report = h.worker.handle_sync("sync-forms").await.unwrap().unwrap();
    assert_eq!(report.failed, 1);

    let stored = h.queue.get(&queued.id).await.unwrap().unwrap();
    assert_eq!(stored.data.as_bytes(), JANE.as_bytes());
    assert_eq!(stored, queued);
}

#[tokio::test]
async fn test_sync_on_empty_queue_is_a_no_op() {
    let h = active_harness().await;
    let calls_before = h.fetcher.call_count();

    for _ in 0..2 {
        let report = h.worker.handle_sync("sync-forms").await.unwrap();
        assert_eq!(report, Some(SyncReport::default()));
    }
    assert_eq!(h.fetcher.call_count(), calls_before);
}

#[tokio::test]
async fn test_new_version_cleans_up_old_partitions() {
    let caches = Arc::new(MemoryCacheStorage::new());
    let old = harness_with("v1", caches.clone());
    old.worker.start().await.unwrap();
    for name in ["bridgenotary-runtime-v1", "bridgenotary-api-v1"] {
        caches.open(name).await.unwrap();
    }
    drop(old);

    let new = harness_with("v2", caches.clone());
    new.worker
        .register_client("tab-1", Url::parse(ORIGIN).unwrap())
        .await;
    let (_, activated) = new.worker.start().await.unwrap();

    assert_eq!(activated.deleted.len(), 3);
    assert_eq!(activated.claimed, 1);
    assert!(new.worker.is_controlled("tab-1").await);
    assert_eq!(
        new.caches.keys().await.unwrap(),
        vec!["bridgenotary-static-v2"]
    );
}

fn sqlite_worker(dir: &std::path::Path, fetcher: Arc<ScriptedFetcher>) -> ServiceWorker {
    let config = WorkerConfig {
        origin: ORIGIN.to_string(),
        data_dir: dir.to_path_buf(),
        ..Default::default()
    };
    let handles = WorkerHandles {
        fetcher,
        caches: Arc::new(SqliteCacheStorage::new(config.cache_db_path())),
        queue: Arc::new(SqliteQueueStore::new(config.queue_db_path())),
    };
    let (worker, _events) = ServiceWorker::new(&config, handles).unwrap();
    worker
}

#[tokio::test]
async fn test_sqlite_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());

    let queued = {
        let worker = sqlite_worker(dir.path(), fetcher.clone());
        worker.enqueue_submission(Payload::new(JANE)).await.unwrap()
    };

    let queue = SqliteQueueStore::new(dir.path().join("queue.db"));
    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(queue.get(&queued.id).await.unwrap(), Some(queued.clone()));

    fetcher.respond(Method::POST, RELAY, 200, r#"{"success":true}"#);
    let worker = sqlite_worker(dir.path(), fetcher.clone());
    let report = worker.handle_sync("sync-forms").await.unwrap().unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(queue.count().await.unwrap(), 0);
    let replay = fetcher.calls().pop().unwrap();
    assert_eq!(replay.body.as_deref(), Some(JANE.as_bytes()));
}
