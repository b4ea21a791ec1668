//! End-to-end tests for the sync engine against the in-memory remote.

use async_trait::async_trait;
use serde_json::{json, Map};
use skiff_storage::{BucketStorage, StorageConfig};
use skiff_sync_engine::{
    Connector, Credentials, MockConnection, MockConnector, MockRemote, RetryConfig,
    SubscriptionOptions, SyncDatabase, SyncError, SyncOptions, SyncResult, SyncStatus,
    UploadError,
};
use skiff_sync_protocol::OpId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use skiff_testkit::{init_tracing, lines};
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};

const WAIT: Duration = Duration::from_secs(5);

fn options() -> SyncOptions {
    SyncOptions::new()
        .with_connection_retry_delay(Duration::from_millis(20))
        .with_upload_retry_delay(Duration::from_millis(20))
        .with_crud_upload_throttle(Duration::ZERO)
        .with_lock_timeout(Duration::from_millis(200))
        .with_stream_idle_timeout(Duration::from_secs(5))
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

async fn wait_status(
    rx: &mut watch::Receiver<SyncStatus>,
    predicate: impl FnMut(&SyncStatus) -> bool,
) -> SyncStatus {
    within(rx.wait_for(predicate)).await.unwrap().clone()
}

async fn next_connection(
    connections: &mut mpsc::UnboundedReceiver<MockConnection>,
) -> MockConnection {
    within(connections.recv()).await.expect("remote dropped")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

fn checkpoint_line(last_op_id: i64, buckets: serde_json::Value) -> String {
    json!({ "checkpoint": { "last_op_id": last_op_id.to_string(), "buckets": buckets } })
        .to_string()
}

fn put_line(bucket: &str, op_id: i64, table: &str, id: &str, checksum: u32) -> String {
    json!({
        "data": {
            "bucket": bucket,
            "data": [{
                "op_id": op_id.to_string(),
                "op": "PUT",
                "object_type": table,
                "object_id": id,
                "checksum": checksum,
                "data": json!({ "name": id }).to_string(),
            }]
        }
    })
    .to_string()
}

fn complete_line(last_op_id: i64) -> String {
    lines::checkpoint_complete(last_op_id)
}

/// Sends a single-bucket checkpoint holding one row and completes it.
fn send_one_row_checkpoint(conn: &MockConnection, op_id: i64, id: &str) {
    let checksum = 100 + op_id as u32;
    assert!(conn.send_json(&checkpoint_line(
        op_id,
        json!([{ "bucket": "b1", "checksum": checksum, "count": 1 }]),
    )));
    assert!(conn.send_json(&put_line("b1", op_id, "items", id, checksum)));
    assert!(conn.send_json(&complete_line(op_id)));
}

type Harness = (
    SyncDatabase,
    Arc<MockConnector>,
    Arc<MockRemote>,
    mpsc::UnboundedReceiver<MockConnection>,
);

fn setup() -> Harness {
    init_tracing();
    let db = SyncDatabase::in_memory().unwrap();
    let connector = Arc::new(MockConnector::signed_in("https://sync.example.com"));
    let (remote, connections) = MockRemote::new();
    (db, connector, Arc::new(remote), connections)
}

#[tokio::test]
async fn test_connect_downloads_and_applies_checkpoint() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote.clone(), options()).await.unwrap();
    assert!(db.is_syncing());

    let conn = next_connection(&mut connections).await;
    assert!(conn.request.buckets.is_empty());
    assert_eq!(conn.request.client_id.as_deref(), Some(db.client_id().unwrap().as_str()));
    assert_eq!(conn.credentials.token, "token");

    let mut rx = db.status_receiver();
    wait_status(&mut rx, |s| s.connected).await;

    send_one_row_checkpoint(&conn, 1, "r1");
    let status = wait_status(&mut rx, |s| s.has_synced == Some(true)).await;
    assert!(status.last_synced_at.is_some());
    assert!(!status.data_flow.downloading);

    let row = db.storage().row("items", "r1").unwrap().unwrap();
    assert_eq!(row["name"], "r1");
    within(db.wait_for_first_sync(None)).await;
}

#[tokio::test]
async fn test_reconnect_resumes_after_known_buckets() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    send_one_row_checkpoint(&conn, 3, "r1");
    within(db.wait_for_first_sync(None)).await;

    db.disconnect().await;
    assert!(!db.is_syncing());
    within(conn.closed()).await;

    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    assert_eq!(conn.request.after("b1"), Some(OpId(3)));
}

#[tokio::test]
async fn test_progress_is_reported_while_downloading() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    let mut rx = db.status_receiver();

    conn.send_json(&checkpoint_line(
        2,
        json!([{ "bucket": "b1", "checksum": 3, "count": 2 }]),
    ));
    let status = wait_status(&mut rx, |s| s.data_flow.download_progress.is_some()).await;
    assert!(status.data_flow.downloading);
    let progress = status.data_flow.download_progress.unwrap();
    assert_eq!(progress.overall().total, 2);
    assert_eq!(progress.overall().downloaded, 0);

    conn.send_json(&put_line("b1", 1, "items", "a", 1));
    let status = wait_status(&mut rx, |s| {
        s.data_flow
            .download_progress
            .as_ref()
            .is_some_and(|p| p.overall().downloaded == 1)
    })
    .await;
    assert!(!status.has_synced.unwrap_or(false));

    conn.send_json(&put_line("b1", 2, "items", "b", 2));
    conn.send_json(&complete_line(2));
    let status = wait_status(&mut rx, |s| s.has_synced == Some(true)).await;
    assert!(status.data_flow.download_progress.is_none());
    assert_eq!(db.storage().rows("items").unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_credentials_fail_connect() {
    let db = SyncDatabase::in_memory().unwrap();
    let connector = Arc::new(MockConnector::new(None));
    let (remote, _connections) = MockRemote::new();
    let remote = Arc::new(remote);

    let result = db.connect(connector, remote.clone(), options()).await;
    assert!(matches!(result, Err(SyncError::MissingCredentials)));
    assert_eq!(remote.open_count(), 0);
    eventually(|| !db.is_syncing()).await;
}

#[tokio::test]
async fn test_invalid_endpoint_fails_connect() {
    let db = SyncDatabase::in_memory().unwrap();
    let connector = Arc::new(MockConnector::new(Some(Credentials::new(
        "https://sync.example.com/",
        "token",
    ))));
    let (remote, _connections) = MockRemote::new();

    let result = db.connect(connector, Arc::new(remote), options()).await;
    assert!(matches!(result, Err(SyncError::InvalidCredentials(_))));
}

#[tokio::test]
async fn test_transient_open_error_is_retried() {
    let (db, connector, remote, mut connections) = setup();
    remote.fail_next_open(SyncError::transport_retryable("connection refused"));

    db.connect(connector, remote.clone(), options()).await.unwrap();
    let status = db.status();
    assert!(status.data_flow.download_error.is_some() || status.connected);

    let conn = next_connection(&mut connections).await;
    assert_eq!(remote.open_count(), 2);
    let mut rx = db.status_receiver();
    let status = wait_status(&mut rx, |s| s.connected).await;
    assert!(status.data_flow.download_error.is_none());
    drop(conn);
}

#[tokio::test]
async fn test_unauthorized_refetches_credentials() {
    let (db, connector, remote, mut connections) = setup();
    remote.fail_next_open(SyncError::Unauthorized("token revoked".into()));

    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let _conn = next_connection(&mut connections).await;
    assert!(connector.fetch_count() >= 2);
}

#[tokio::test]
async fn test_expiring_token_reconnects_with_new_credentials() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector.clone(), remote, options()).await.unwrap();
    let first = next_connection(&mut connections).await;
    let fetches = connector.fetch_count();

    connector.set_credentials(Some(Credentials::new("https://sync.example.com", "fresh")));
    first.send_json(r#"{"token_expires_in":10}"#);

    let second = next_connection(&mut connections).await;
    assert_eq!(second.credentials.token, "fresh");
    assert!(connector.fetch_count() > fetches);
    within(first.closed()).await;
}

#[tokio::test]
async fn test_expired_token_reconnects() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let first = next_connection(&mut connections).await;

    first.send_json(r#"{"token_expires_in":0}"#);
    let _second = next_connection(&mut connections).await;
    assert_eq!(remote.open_count(), 2);
    assert!(connector.fetch_count() >= 2);
}

#[tokio::test]
async fn test_long_token_lifetime_keeps_stream() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote.clone(), options()).await.unwrap();
    let conn = next_connection(&mut connections).await;

    conn.send_json(&lines::keepalive(600));
    conn.send_json(r#"{"some_future_line":{"x":1}}"#);
    conn.send_json(r#"{"log":{"severity":"info","line":"hello"}}"#);
    send_one_row_checkpoint(&conn, 1, "r1");
    within(db.wait_for_first_sync(None)).await;

    assert_eq!(remote.open_count(), 1);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_stream_end_reconnects() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote.clone(), options()).await.unwrap();
    let first = next_connection(&mut connections).await;
    drop(first);

    let _second = next_connection(&mut connections).await;
    assert_eq!(remote.open_count(), 2);
}

#[tokio::test]
async fn test_idle_stream_reconnects() {
    let (db, connector, remote, mut connections) = setup();
    let options = options().with_stream_idle_timeout(Duration::from_millis(100));
    db.connect(connector, remote.clone(), options).await.unwrap();

    let first = next_connection(&mut connections).await;
    let _second = next_connection(&mut connections).await;
    assert!(first.is_closed());
    assert!(remote.open_count() >= 2);
}

#[tokio::test]
async fn test_backoff_restarts_after_stream_opened() {
    let (db, connector, remote, mut connections) = setup();
    // A second consecutive failure would wait far longer than WAIT.
    let retry = RetryConfig::fixed(Duration::from_millis(20))
        .with_max_delay(Duration::from_secs(60))
        .with_backoff_multiplier(1000.0);
    db.connect(connector, remote.clone(), options().with_retry(retry))
        .await
        .unwrap();

    let first = next_connection(&mut connections).await;
    assert!(first.fail(SyncError::transport_retryable("connection reset")));
    let second = next_connection(&mut connections).await;
    assert!(second.fail(SyncError::transport_retryable("connection reset")));
    let _third = next_connection(&mut connections).await;
    assert_eq!(remote.open_count(), 3);
}

#[tokio::test]
async fn test_checksum_mismatch_downloads_bucket_again() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let first = next_connection(&mut connections).await;

    first.send_json(&checkpoint_line(
        1,
        json!([{ "bucket": "b1", "checksum": 6, "count": 1 }]),
    ));
    first.send_json(&put_line("b1", 1, "items", "r1", 5));
    first.send_json(&complete_line(1));

    let second = next_connection(&mut connections).await;
    assert_eq!(second.request.after("b1"), None);
    assert!(db.storage().row("items", "r1").unwrap().is_none());
    assert_ne!(db.status().has_synced, Some(true));

    send_one_row_checkpoint(&second, 1, "r1");
    within(db.wait_for_first_sync(None)).await;
    assert!(db.storage().row("items", "r1").unwrap().is_some());
}

#[tokio::test]
async fn test_checkpoint_diff_updates_target() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;

    conn.send_json(&checkpoint_line(
        1,
        json!([{ "bucket": "b1", "checksum": 101, "count": 1 }]),
    ));
    conn.send_json(&put_line("b1", 1, "items", "r1", 101));
    conn.send_json(&complete_line(1));
    within(db.wait_for_first_sync(None)).await;

    conn.send_json(
        &json!({
            "checkpoint_diff": {
                "last_op_id": "2",
                "updated_buckets": [{ "bucket": "b2", "checksum": 7, "count": 1 }],
                "removed_buckets": ["b1"]
            }
        })
        .to_string(),
    );
    conn.send_json(&put_line("b2", 2, "items", "r2", 7));
    conn.send_json(&complete_line(2));

    let storage = Arc::clone(db.storage());
    eventually(move || {
        storage.row("items", "r2").unwrap().is_some()
            && storage.row("items", "r1").unwrap().is_none()
    })
    .await;
}

#[tokio::test]
async fn test_partial_checkpoint_syncs_priority() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    let mut rx = db.status_receiver();

    conn.send_json(&checkpoint_line(
        2,
        json!([
            { "bucket": "urgent", "checksum": 1, "count": 1, "priority": 0 },
            { "bucket": "rest", "checksum": 2, "count": 1, "priority": 3 }
        ]),
    ));
    conn.send_json(&put_line("urgent", 1, "items", "u1", 1));
    conn.send_json(r#"{"partial_checkpoint_complete":{"last_op_id":"2","priority":0}}"#);

    let status = wait_status(&mut rx, |s| s.status_for_priority(0).has_synced == Some(true)).await;
    assert_ne!(status.has_synced, Some(true));
    assert!(db.storage().row("items", "u1").unwrap().is_some());
    within(db.wait_for_first_sync(Some(0))).await;

    conn.send_json(&put_line("rest", 2, "items", "r1", 2));
    conn.send_json(&complete_line(2));
    let status = wait_status(&mut rx, |s| s.has_synced == Some(true)).await;
    assert!(status.priority_status_entries.is_empty());
}

#[tokio::test]
async fn test_local_writes_upload_before_checkpoint_applies() {
    let (db, connector, remote, mut connections) = setup();
    remote.set_write_checkpoint(5);
    db.write_transaction(|tx| {
        let mut data = Map::new();
        data.insert("name".into(), json!("local"));
        tx.put("items", "mine", data)
    })
    .unwrap();

    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let conn = next_connection(&mut connections).await;

    conn.send_json(
        &json!({
            "checkpoint": {
                "last_op_id": "5",
                "write_checkpoint": "5",
                "buckets": [{ "bucket": "b1", "checksum": 105, "count": 1 }]
            }
        })
        .to_string(),
    );
    conn.send_json(&put_line("b1", 5, "items", "mine", 105));
    conn.send_json(&complete_line(5));

    within(db.wait_for_first_sync(None)).await;
    assert!(connector.upload_count() >= 1);
    assert!(remote.write_checkpoint_count() >= 1);
    assert!(db.get_crud_batch(10).unwrap().is_none());
    let row = db.storage().row("items", "mine").unwrap().unwrap();
    assert_eq!(row["name"], "mine");
}

#[tokio::test]
async fn test_write_checkpoint_failure_is_retried() {
    let (db, connector, remote, mut connections) = setup();
    remote.set_write_checkpoint(5);
    remote.fail_next_write_checkpoint(SyncError::transport_retryable("service unavailable"));
    remote.fail_next_write_checkpoint(SyncError::transport_retryable("service unavailable"));

    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    db.write_transaction(|tx| tx.put("items", "mine", Map::new()))
        .unwrap();

    conn.send_json(
        &json!({
            "checkpoint": {
                "last_op_id": "5",
                "write_checkpoint": "5",
                "buckets": [{ "bucket": "b1", "checksum": 105, "count": 1 }]
            }
        })
        .to_string(),
    );
    conn.send_json(&put_line("b1", 5, "items", "mine", 105));
    conn.send_json(&complete_line(5));

    within(db.wait_for_first_sync(None)).await;
    assert!(remote.write_checkpoint_count() >= 3);
    assert!(db.get_crud_batch(10).unwrap().is_none());
    let row = db.storage().row("items", "mine").unwrap().unwrap();
    assert_eq!(row["name"], "mine");
    let mut rx = db.status_receiver();
    wait_status(&mut rx, |s| s.data_flow.upload_error.is_none()).await;
}

#[tokio::test]
async fn test_writes_while_connected_are_uploaded() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector.clone(), remote, options()).await.unwrap();
    let _conn = next_connection(&mut connections).await;

    db.write_transaction(|tx| tx.put("items", "a", Map::new())).unwrap();
    let storage = Arc::clone(db.storage());
    eventually(move || !storage.has_pending_crud().unwrap()).await;
    assert!(connector.upload_count() >= 1);
}

#[tokio::test]
async fn test_fatal_upload_error_discards_transaction() {
    let (db, connector, remote, mut connections) = setup();
    connector.push_upload_result(Err(UploadError::fatal("row rejected")));
    db.write_transaction(|tx| tx.put("items", "bad", Map::new())).unwrap();

    let mut rx = db.status_receiver();
    db.connect(connector.clone(), remote, options()).await.unwrap();
    let _conn = next_connection(&mut connections).await;

    let status = wait_status(&mut rx, |s| s.data_flow.upload_error.is_some()).await;
    assert!(status.data_flow.upload_error.unwrap().contains("row rejected"));
    let storage = Arc::clone(db.storage());
    eventually(move || !storage.has_pending_crud().unwrap()).await;
    assert_eq!(connector.upload_count(), 1);
}

#[tokio::test]
async fn test_retryable_upload_error_is_retried() {
    let (db, connector, remote, mut connections) = setup();
    connector.push_upload_result(Err(UploadError::retryable("service unavailable")));
    db.write_transaction(|tx| tx.put("items", "a", Map::new())).unwrap();

    let mut rx = db.status_receiver();
    db.connect(connector.clone(), remote, options()).await.unwrap();
    let _conn = next_connection(&mut connections).await;

    wait_status(&mut rx, |s| s.data_flow.upload_error.is_some()).await;
    let storage = Arc::clone(db.storage());
    eventually(move || !storage.has_pending_crud().unwrap()).await;
    assert_eq!(connector.upload_count(), 2);
    wait_status(&mut rx, |s| s.data_flow.upload_error.is_none()).await;
}

#[tokio::test]
async fn test_incomplete_upload_is_retried() {
    let (db, connector, remote, mut connections) = setup();
    let mut calls = 0;
    connector.set_upload_handler(move |storage| {
        calls += 1;
        if calls > 1 {
            if let Some(transaction) = storage.next_crud_transaction()? {
                transaction.complete(None)?;
            }
        }
        Ok(())
    });
    db.write_transaction(|tx| tx.put("items", "a", Map::new())).unwrap();

    db.connect(connector.clone(), remote, options()).await.unwrap();
    let _conn = next_connection(&mut connections).await;

    let storage = Arc::clone(db.storage());
    eventually(move || !storage.has_pending_crud().unwrap()).await;
    assert!(connector.upload_count() >= 2);
}

#[tokio::test]
async fn test_stream_subscription_is_requested_and_synced() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let first = next_connection(&mut connections).await;
    assert!(first
        .request
        .streams
        .as_ref()
        .is_some_and(|s| s.include_defaults && s.subscriptions.is_empty()));

    let stream = db.sync_stream("lists", Some(json!({ "id": 1 })));
    let subscription = stream
        .subscribe(SubscriptionOptions::default().with_priority(1))
        .unwrap();

    let second = next_connection(&mut connections).await;
    let requested = &second.request.streams.as_ref().unwrap().subscriptions;
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].stream, "lists");
    assert_eq!(requested[0].parameters, Some(json!({ "id": 1 })));
    within(first.closed()).await;

    second.send_json(&checkpoint_line(
        1,
        json!([{
            "bucket": "lists_1",
            "checksum": 9,
            "count": 1,
            "priority": 1,
            "subscriptions": [{ "sub": 0 }]
        }]),
    ));
    second.send_json(&put_line("lists_1", 1, "lists", "l1", 9));
    second.send_json(&complete_line(1));

    within(subscription.wait_for_first_sync()).await;
    let status = stream.status().unwrap();
    assert!(status.has_synced);
    assert!(status.has_explicit_subscription);
}

#[tokio::test]
async fn test_second_subscription_does_not_reconnect() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote.clone(), options()).await.unwrap();
    let _first = next_connection(&mut connections).await;

    let stream = db.sync_stream("lists", None);
    let a = stream.subscribe(SubscriptionOptions::default()).unwrap();
    let _second = next_connection(&mut connections).await;
    let b = stream.subscribe(SubscriptionOptions::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.open_count(), 2);
    a.unsubscribe();
    b.unsubscribe();
}

#[tokio::test]
async fn test_disconnect_closes_stream_and_is_idempotent() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;

    db.disconnect().await;
    db.disconnect().await;
    within(conn.closed()).await;
    let status = db.status();
    assert!(!status.connected);
    assert!(!status.connecting);
    assert!(!db.is_syncing());
}

/// Connector whose credential fetch never completes.
struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        std::future::pending().await
    }

    async fn upload_data(&self, _storage: &Arc<BucketStorage>) -> Result<(), UploadError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_disconnect_cancels_pending_credential_fetch() {
    init_tracing();
    let db = Arc::new(SyncDatabase::in_memory().unwrap());
    let (remote, _connections) = MockRemote::new();

    let connecting = {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            db.connect(Arc::new(HangingConnector), Arc::new(remote), options())
                .await
        })
    };
    let syncing = Arc::clone(&db);
    eventually(move || syncing.is_syncing()).await;

    within(db.disconnect()).await;
    assert!(!db.is_syncing());
    within(connecting).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_replaces_existing_connection() {
    let (db, connector, remote, mut connections) = setup();
    db.connect(connector.clone(), remote.clone(), options()).await.unwrap();
    let first = next_connection(&mut connections).await;

    db.connect(connector, remote, options()).await.unwrap();
    let _second = next_connection(&mut connections).await;
    assert!(first.is_closed());
}

#[tokio::test]
async fn test_disconnect_and_clear_removes_data() {
    let (db, connector, remote, mut connections) = setup();
    let client_id = db.client_id().unwrap();
    db.connect(connector, remote, options()).await.unwrap();
    let conn = next_connection(&mut connections).await;
    send_one_row_checkpoint(&conn, 1, "r1");
    within(db.wait_for_first_sync(None)).await;

    db.disconnect_and_clear().await.unwrap();
    assert!(db.storage().row("items", "r1").unwrap().is_none());
    assert!(db.storage().bucket_states().unwrap().is_empty());
    assert_ne!(db.status().has_synced, Some(true));
    assert_eq!(db.client_id().unwrap(), client_id);
}

#[tokio::test]
async fn test_synced_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.db");
    {
        let db = SyncDatabase::open(StorageConfig::file(&path)).unwrap();
        let connector = Arc::new(MockConnector::signed_in("https://sync.example.com"));
        let (remote, mut connections) = MockRemote::new();
        db.connect(connector, Arc::new(remote), options()).await.unwrap();
        let conn = next_connection(&mut connections).await;
        send_one_row_checkpoint(&conn, 1, "r1");
        within(db.wait_for_first_sync(None)).await;
        db.disconnect().await;
    }

    let db = SyncDatabase::open(StorageConfig::file(&path)).unwrap();
    let status = db.status();
    assert_eq!(status.has_synced, Some(true));
    assert!(status.last_synced_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_instance_waits_for_lock_then_takes_over() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let connector = Arc::new(MockConnector::signed_in("https://sync.example.com"));

    let owner = SyncDatabase::open(StorageConfig::file(&path)).unwrap();
    let (owner_remote, mut owner_connections) = MockRemote::new();
    owner
        .connect(connector.clone(), Arc::new(owner_remote), options())
        .await
        .unwrap();
    let owner_conn = next_connection(&mut owner_connections).await;

    let observer = SyncDatabase::open(StorageConfig::file(&path)).unwrap();
    let (observer_remote, mut observer_connections) = MockRemote::new();
    let observer_remote = Arc::new(observer_remote);
    observer
        .connect(connector, observer_remote.clone(), options())
        .await
        .unwrap();

    let mut rx = observer.status_receiver();
    wait_status(&mut rx, |s| s.connected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(observer_remote.open_count(), 0);

    drop(owner);
    within(owner_conn.closed()).await;
    let conn = next_connection(&mut observer_connections).await;
    assert_eq!(observer_remote.open_count(), 1);

    send_one_row_checkpoint(&conn, 1, "r1");
    within(observer.wait_for_first_sync(None)).await;
}
