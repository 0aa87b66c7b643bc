//! End-to-end pipeline tests over in-memory fakes of the stream client.

use async_trait::async_trait;
use bytes::Bytes;
use pg_kinesis_cdc::postgres::decode::{parse_columns, parse_prelude, Prelude};
use pg_kinesis_cdc::{
    AckCoordinator, BatchPublisher, BridgeError, BridgeMetrics, ChangeEvent, ClientProvider, Lsn,
    OutgoingRecord, PutRecordsOutcome, RecordFailure, ShutdownToken, StreamClient, TableFilter,
    MAX_BATCH_BYTES, MAX_BATCH_RECORDS,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What the fake client should do on one call.
#[derive(Clone)]
enum Script {
    Accept,
    FailIndexes(Vec<usize>),
    TransportError,
}

/// Records every batch it sees and replays a scripted response per call.
/// Once the script runs dry, everything is accepted.
#[derive(Default)]
struct FakeClient {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Vec<(String, Bytes)>>>,
}

impl FakeClient {
    fn scripted(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn batches(&self) -> Vec<Vec<(String, Bytes)>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamClient for FakeClient {
    async fn put_records(
        &self,
        _stream: &str,
        records: &[OutgoingRecord],
    ) -> anyhow::Result<PutRecordsOutcome> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Accept);

        if matches!(step, Script::TransportError) {
            return Err(anyhow::anyhow!("connection reset by peer"));
        }

        self.calls.lock().unwrap().push(
            records
                .iter()
                .map(|r| (r.partition_key.clone(), r.payload.clone()))
                .collect(),
        );

        match step {
            Script::Accept => Ok(PutRecordsOutcome::success()),
            Script::FailIndexes(indexes) => Ok(PutRecordsOutcome {
                failed: indexes
                    .into_iter()
                    .map(|index| RecordFailure {
                        index,
                        code: "ProvisionedThroughputExceededException".to_string(),
                        message: "slow down".to_string(),
                    })
                    .collect(),
            }),
            Script::TransportError => unreachable!(),
        }
    }
}

struct FakeProvider {
    client: Arc<FakeClient>,
    connects: AtomicUsize,
}

impl FakeProvider {
    fn new(client: Arc<FakeClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            connects: AtomicUsize::new(0),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn connect(&self) -> anyhow::Result<Arc<dyn StreamClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

fn record(lsn: u64, key: &str, body: &str) -> OutgoingRecord {
    OutgoingRecord {
        payload: Bytes::copy_from_slice(body.as_bytes()),
        partition_key: key.to_string(),
        lsn: Lsn(lsn),
    }
}

fn publisher(client: Arc<FakeClient>) -> (BatchPublisher, Arc<FakeProvider>, ShutdownToken) {
    let provider = FakeProvider::new(client);
    let shutdown = ShutdownToken::new();
    let publisher = BatchPublisher::new(
        "test-stream",
        provider.clone(),
        Arc::new(BridgeMetrics::new()),
        shutdown.clone(),
    );
    (publisher, provider, shutdown)
}

// ---------------------------------------------------------------------------
// Publisher behavior
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn partial_failure_retries_only_failed_records_in_order() {
    // S5: three records, the middle one fails on the first attempt.
    let client = FakeClient::scripted(vec![Script::FailIndexes(vec![1]), Script::Accept]);
    let (mut publisher, _, _) = publisher(client.clone());

    for (lsn, body) in [(1, "r0"), (2, "r1"), (3, "r2")] {
        assert!(!publisher.submit(record(lsn, "public.users", body)).await.unwrap());
    }
    assert!(publisher.flush().await.unwrap());

    let batches = client.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 3);
    // Second attempt carries exactly the failed record.
    assert_eq!(batches[1].len(), 1);
    assert_eq!(batches[1][0].1, Bytes::from_static(b"r1"));

    // The coordinator is told once, with the last-submitted LSN.
    let ack = AckCoordinator::new();
    ack.observe_enqueued(Lsn(3)).await;
    assert_eq!(ack.acked_lsn().await, Lsn(3));
}

#[tokio::test(start_paused = true)]
async fn transport_error_rebuilds_client_and_retries_whole_buffer() {
    let client = FakeClient::scripted(vec![Script::TransportError, Script::Accept]);
    let (mut publisher, provider, _) = publisher(client.clone());

    publisher.submit(record(1, "public.users", "a")).await.unwrap();
    publisher.submit(record(2, "public.users", "b")).await.unwrap();
    assert!(publisher.flush().await.unwrap());

    // One connect for the first attempt, one after the transport error.
    assert_eq!(provider.connects(), 2);

    // The retry resent the whole buffer.
    let batches = client.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn count_bound_triggers_synchronous_flush() {
    let client = FakeClient::scripted(vec![]);
    let (mut publisher, _, _) = publisher(client.clone());

    for i in 0..MAX_BATCH_RECORDS - 1 {
        let flushed = publisher
            .submit(record(i as u64 + 1, "public.users", "x"))
            .await
            .unwrap();
        assert!(!flushed);
        assert!(publisher.pending() <= MAX_BATCH_RECORDS);
    }

    let flushed = publisher
        .submit(record(MAX_BATCH_RECORDS as u64, "public.users", "x"))
        .await
        .unwrap();
    assert!(flushed, "500th record must flush synchronously");
    assert_eq!(publisher.pending(), 0);
    assert_eq!(client.batches()[0].len(), MAX_BATCH_RECORDS);
}

#[tokio::test(start_paused = true)]
async fn byte_bound_flushes_older_records_first() {
    let client = FakeClient::scripted(vec![]);
    let (mut publisher, _, _) = publisher(client.clone());

    // Six records of ~1MiB: the sixth would push the buffer past 5MiB.
    let big = "x".repeat(900 * 1024);
    for i in 0..5 {
        let flushed = publisher.submit(record(i + 1, "public.blobs", &big)).await.unwrap();
        assert!(!flushed);
    }
    assert!(publisher.pending_bytes() <= MAX_BATCH_BYTES);

    let flushed = publisher.submit(record(6, "public.blobs", &big)).await.unwrap();
    // The pre-flush published the five older records, not this one.
    assert!(!flushed);
    assert_eq!(publisher.pending(), 1);
    assert_eq!(client.batches()[0].len(), 5);
    assert!(publisher.pending_bytes() <= MAX_BATCH_BYTES);
}

#[tokio::test(start_paused = true)]
async fn oversized_record_is_rejected_not_buffered() {
    let client = FakeClient::scripted(vec![]);
    let (mut publisher, _, _) = publisher(client.clone());

    let huge = "x".repeat((1 << 20) + 1);
    let err = publisher
        .submit(record(1, "public.blobs", &huge))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::OversizedRecord { .. }));
    assert_eq!(publisher.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_flush_is_a_no_op() {
    let client = FakeClient::scripted(vec![]);
    let (mut publisher, _, _) = publisher(client.clone());

    assert!(!publisher.flush().await.unwrap());
    assert!(client.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_retries_after_one_attempt() {
    let client = FakeClient::scripted(vec![Script::TransportError; 200]);
    let (mut publisher, _, shutdown) = publisher(client.clone());

    publisher.submit(record(1, "public.users", "a")).await.unwrap();
    shutdown.trigger();

    let err = publisher.flush().await.unwrap_err();
    assert!(err.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_is_fatal() {
    let client = FakeClient::scripted(vec![Script::TransportError; 200]);
    let (mut publisher, _, _) = publisher(client.clone());

    publisher.submit(record(1, "public.users", "a")).await.unwrap();
    let err = publisher.flush().await.unwrap_err();
    assert!(matches!(err, BridgeError::Publish(_)));
}

#[tokio::test(start_paused = true)]
async fn published_order_is_a_subsequence_of_submit_order() {
    let client = FakeClient::scripted(vec![
        Script::FailIndexes(vec![0, 2]),
        Script::FailIndexes(vec![1]),
        Script::Accept,
    ]);
    let (mut publisher, _, _) = publisher(client.clone());

    for (lsn, body) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
        publisher.submit(record(lsn, "public.users", body)).await.unwrap();
    }
    assert!(publisher.flush().await.unwrap());

    let batches = client.batches();
    let bodies =
        |i: usize| -> Vec<&[u8]> { batches[i].iter().map(|(_, b)| b.as_ref()).collect() };
    assert_eq!(bodies(0), vec![b"a" as &[u8], b"b", b"c", b"d"]);
    // Failed subset keeps its original relative order.
    assert_eq!(bodies(1), vec![b"a" as &[u8], b"c"]);
    assert_eq!(bodies(2), vec![b"c" as &[u8]]);
}

// ---------------------------------------------------------------------------
// Parse → filter → encode scenarios
// ---------------------------------------------------------------------------

/// Run one WAL line through prelude, filter, columns, and encode.
fn process(
    filter: &TableFilter,
    lsn: Lsn,
    payload: &str,
) -> Option<std::result::Result<OutgoingRecord, BridgeError>> {
    let row = match parse_prelude(payload).unwrap() {
        Prelude::Begin | Prelude::Commit => return None,
        Prelude::Row(row) => row,
    };
    if !filter.include(row.relation) {
        return None;
    }
    let images = parse_columns(&row).unwrap();
    let event = ChangeEvent::from_row(row.op, row.relation, images, lsn);
    Some(event.encode())
}

#[test]
fn insert_passthrough_produces_canonical_envelope() {
    // S1: no filters, one INSERT at LSN 0/1A0.
    let filter = TableFilter::new(&[], &[]).unwrap();
    let record = process(
        &filter,
        "0/1A0".parse().unwrap(),
        "table public.users: INSERT: id[integer]:7 name[text]:'a'",
    )
    .unwrap()
    .unwrap();

    assert_eq!(record.partition_key, "public.users");
    assert_eq!(record.lsn, "0/1A0".parse::<Lsn>().unwrap());

    let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    let expected: serde_json::Value = serde_json::json!({
        "lsn": "0/1A0",
        "table": "public.users",
        "operation": "INSERT",
        "columns": {
            "id": {"new": {"v": "7", "t": "integer", "q": "false"}},
            "name": {"new": {"v": "a", "t": "text", "q": "true"}}
        }
    });
    assert_eq!(value, expected);
}

#[test]
fn update_emits_old_only_for_changed_columns() {
    // S2: name changed a → b, id unchanged.
    let filter = TableFilter::new(&[], &[]).unwrap();
    let record = process(
        &filter,
        Lsn(0x200),
        "table public.users: UPDATE: old-key: id[integer]:1 name[text]:'a' \
         new-tuple: id[integer]:1 name[text]:'b'",
    )
    .unwrap()
    .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    let columns = &value["columns"];
    assert_eq!(columns["name"]["new"]["v"], "b");
    assert_eq!(columns["name"]["old"]["v"], "a");
    assert_eq!(columns["id"]["new"]["v"], "1");
    assert!(columns["id"].get("old").is_none());
}

#[test]
fn delete_emits_old_values_only() {
    // S3: DELETE carries only old.
    let filter = TableFilter::new(&[], &[]).unwrap();
    let record = process(
        &filter,
        Lsn(0x300),
        "table public.users: DELETE: id[integer]:1",
    )
    .unwrap()
    .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(value["operation"], "DELETE");
    assert_eq!(value["columns"]["id"]["old"]["v"], "1");
    assert!(value["columns"]["id"].get("new").is_none());
}

#[test]
fn excluded_relation_produces_no_record() {
    // S4: include public.*, exclude public.secret.
    let filter = TableFilter::new(
        &["public.*".to_string()],
        &["public.secret".to_string()],
    )
    .unwrap();

    assert!(process(
        &filter,
        Lsn(1),
        "table public.secret: INSERT: id[integer]:1"
    )
    .is_none());
    assert!(process(
        &filter,
        Lsn(2),
        "table public.users: INSERT: id[integer]:1"
    )
    .is_some());
}

#[test]
fn transaction_markers_produce_no_record() {
    let filter = TableFilter::new(&[], &[]).unwrap();
    assert!(process(&filter, Lsn(1), "BEGIN 693").is_none());
    assert!(process(&filter, Lsn(2), "COMMIT 693").is_none());
}
