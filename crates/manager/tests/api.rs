//! End-to-end exercises of the HTTP control surface against a live
//! server on an ephemeral port.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use ctsieve_core::api::{
    AcquireRequest, AcquireResponse, CacheStatsResponse, CompleteRequest, ErrorReport,
    HeartbeatRequest, OkResponse, ResumeRequest, UploadRecord, UploadResponse,
};
use ctsieve_manager::cache::DedupCache;
use ctsieve_manager::coordinator::Coordinator;
use ctsieve_manager::http::{AppState, router};
use ctsieve_manager::store::{CatalogLog, RangeState, Store};

const CERT_A: &[u8] = include_bytes!("../testdata/cert_a.der");
const CERT_B: &[u8] = include_bytes!("../testdata/cert_b.der");

fn leaf_b64(der: &[u8]) -> String {
    let mut leaf = vec![0u8, 0];
    leaf.extend_from_slice(&1_700_000_000_000_u64.to_be_bytes());
    leaf.extend_from_slice(&0u16.to_be_bytes());
    leaf.extend_from_slice(&(der.len() as u32).to_be_bytes()[1..]);
    leaf.extend_from_slice(der);
    leaf.extend_from_slice(&[0, 0]);
    B64.encode(leaf)
}

fn record(der: &[u8], ct_index: u64) -> UploadRecord {
    UploadRecord {
        ct_entry: leaf_b64(der),
        ct_log_url: "https://ct.example.com/argon/".into(),
        log_name: "argon".into(),
        worker_name: "w1".into(),
        ct_index,
        ip_address: None,
    }
}

async fn spawn_manager(tree_size: u64) -> (String, AppState) {
    let store = Arc::new(Store::in_memory().unwrap());
    store
        .apply_catalog(
            &[CatalogLog {
                log_name: "argon".into(),
                log_url: "https://ct.example.com/argon/".into(),
                category: "google".into(),
                tree_size,
                active: true,
            }],
            tree_size,
        )
        .unwrap();

    let state = AppState {
        store: store.clone(),
        coordinator: Arc::new(Coordinator::new(store, 300, 900)),
        cache: Arc::new(DedupCache::new(50_000)),
    };
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn full_range_lifecycle_over_http() {
    let (base, state) = spawn_manager(8).await;
    let http = reqwest::Client::new();

    // one pending range: the first worker wins, the second gets none
    let grant = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w1".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap()
        .into_grant()
        .expect("w1 should receive the range");
    assert_eq!((grant.start, grant.end, grant.current), (0, 8, 0));

    let empty = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w2".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap();
    assert!(empty.into_grant().is_none());

    // advance to the end of the range
    let ok = http
        .post(format!("{base}/api/worker/heartbeat"))
        .json(&HeartbeatRequest {
            worker_name: "w1".into(),
            log_name: "argon".into(),
            start: 0,
            current: 8,
        })
        .send()
        .await
        .unwrap()
        .json::<OkResponse>()
        .await
        .unwrap();
    assert!(ok.ok);

    // upload twice: inserts, then pure duplicates
    let batch = vec![record(CERT_A, 3), record(CERT_B, 4)];
    let first = http
        .post(format!("{base}/api/worker/upload"))
        .json(&batch)
        .send()
        .await
        .unwrap()
        .json::<UploadResponse>()
        .await
        .unwrap();
    assert_eq!((first.inserted, first.duplicates, first.failures), (2, 0, 0));

    let second = http
        .post(format!("{base}/api/worker/upload"))
        .json(&batch)
        .send()
        .await
        .unwrap()
        .json::<UploadResponse>()
        .await
        .unwrap();
    assert_eq!(
        (second.inserted, second.duplicates, second.failures),
        (0, 2, 0)
    );
    assert_eq!(state.store.count_certs().unwrap(), 2);

    let stats = http
        .get(format!("{base}/api/cache/stats"))
        .send()
        .await
        .unwrap()
        .json::<CacheStatsResponse>()
        .await
        .unwrap()
        .cache_stats;
    assert_eq!(stats.miss_count, 2);
    assert_eq!(stats.hit_count, 2);
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.cache_size, 2);

    // boundary behavior
    let zero = http
        .post(format!("{base}/api/worker/upload"))
        .json(&Vec::<UploadRecord>::new())
        .send()
        .await
        .unwrap()
        .json::<UploadResponse>()
        .await
        .unwrap();
    assert_eq!((zero.inserted, zero.duplicates, zero.failures), (0, 0, 0));

    let oversized: Vec<UploadRecord> = (0..33).map(|i| record(CERT_A, i)).collect();
    let response = http
        .post(format!("{base}/api/worker/upload"))
        .json(&oversized)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);

    // complete, then verify the assignment really is gone
    let done = http
        .post(format!("{base}/api/worker/complete"))
        .json(&CompleteRequest {
            worker_name: "w1".into(),
            log_name: "argon".into(),
            start: 0,
        })
        .send()
        .await
        .unwrap()
        .json::<OkResponse>()
        .await
        .unwrap();
    assert!(done.ok);
    assert_eq!(
        state.store.get_range("argon", 0).unwrap().unwrap().state,
        RangeState::Complete
    );

    let stale = http
        .post(format!("{base}/api/worker/heartbeat"))
        .json(&HeartbeatRequest {
            worker_name: "w1".into(),
            log_name: "argon".into(),
            start: 0,
            current: 8,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), reqwest::StatusCode::CONFLICT);

    // privileged clear wipes counters
    http.post(format!("{base}/api/cache/clear"))
        .send()
        .await
        .unwrap()
        .json::<OkResponse>()
        .await
        .unwrap();
    let stats = http
        .get(format!("{base}/api/cache/stats"))
        .send()
        .await
        .unwrap()
        .json::<CacheStatsResponse>()
        .await
        .unwrap()
        .cache_stats;
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.cache_size, 0);
}

#[tokio::test]
async fn resume_hands_the_range_to_the_next_worker() {
    let (base, _state) = spawn_manager(16).await;
    let http = reqwest::Client::new();

    let grant = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w1".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap()
        .into_grant()
        .unwrap();

    http.post(format!("{base}/api/worker/heartbeat"))
        .json(&HeartbeatRequest {
            worker_name: "w1".into(),
            log_name: grant.log_name.clone(),
            start: grant.start,
            current: 5,
        })
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // worker-initiated shutdown; idempotent
    for _ in 0..2 {
        http.post(format!("{base}/api/worker/resume"))
            .json(&ResumeRequest {
                worker_name: "w1".into(),
                log_name: grant.log_name.clone(),
                start: grant.start,
                current: 5,
            })
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();
    }

    let resumed = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w2".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap()
        .into_grant()
        .expect("resumed range should be reassignable");
    assert_eq!(resumed.start, grant.start);
    assert_eq!(resumed.current, 5);
}

#[tokio::test]
async fn reported_errors_fail_the_range() {
    let (base, state) = spawn_manager(16).await;
    let http = reqwest::Client::new();

    let grant = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w1".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap()
        .into_grant()
        .unwrap();

    http.post(format!("{base}/api/worker/error"))
        .json(&ErrorReport {
            worker_name: "w1".into(),
            log_name: grant.log_name.clone(),
            start: grant.start,
            message: "get-entries returned 404".into(),
        })
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let range = state.store.get_range(&grant.log_name, grant.start).unwrap().unwrap();
    assert_eq!(range.state, RangeState::Failed);
    assert!(state.store.assignment(&grant.log_name, grant.start).unwrap().is_none());

    // failed ranges are not handed out again
    let next = http
        .post(format!("{base}/api/worker/acquire"))
        .json(&AcquireRequest {
            worker_name: "w2".into(),
            category: "google".into(),
        })
        .send()
        .await
        .unwrap()
        .json::<AcquireResponse>()
        .await
        .unwrap();
    assert!(next.into_grant().is_none());
}
