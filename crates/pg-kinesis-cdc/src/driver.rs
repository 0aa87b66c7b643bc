//! Replication driver: owns the upstream connection, pumps WAL messages
//! to the consumer task, and keeps the keepalive cadence.
//!
//! Two tasks per connection:
//!
//! - the **driver** blocks on the socket with a 1 s deadline (expiry is
//!   the normal idle path), hands payloads to the consumer, answers
//!   server heartbeats, emits coalesced flush signals, and reports
//!   statistics;
//! - the **consumer** runs parse → filter → encode → submit and is the
//!   sole writer to the publish buffer.
//!
//! The hand-off channel holds at most one message: while the consumer
//! sits inside a flush, the driver blocks on the send and stops draining
//! the socket, which pushes backpressure all the way to the upstream.

use crate::ack::AckCoordinator;
use crate::common::{
    BridgeError, BridgeMetrics, ChangeEvent, Lsn, MetricsSnapshot, Result, ShutdownToken,
    TableFilter,
};
use crate::config::BridgeConfig;
use crate::kinesis::client::ClientProvider;
use crate::kinesis::publisher::BatchPublisher;
use crate::postgres::client::{ReplicationClient, ReplicationFrame};
use crate::postgres::decode::{parse_columns, parse_prelude, Prelude};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Socket receive deadline; also paces keepalive and flush checks.
const REPLICATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Interval between coalesced flush signals.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Interval between statistics reports.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// One WAL payload handed from the driver to the consumer.
#[derive(Debug)]
struct WalEvent {
    lsn: Lsn,
    payload: Bytes,
}

/// Owns everything one connection's streaming needs. Ack state, the
/// filter cache, and statistics live outside and survive reconnects; the
/// publisher is created per connection (its buffer is re-derived from
/// the slot replay after a reconnect).
pub struct ReplicationDriver {
    config: Arc<BridgeConfig>,
    filter: Arc<TableFilter>,
    metrics: Arc<BridgeMetrics>,
    ack: Arc<AckCoordinator>,
    provider: Arc<dyn ClientProvider>,
    shutdown: ShutdownToken,
    connected_once: AtomicBool,
}

impl ReplicationDriver {
    pub fn new(
        config: Arc<BridgeConfig>,
        filter: Arc<TableFilter>,
        metrics: Arc<BridgeMetrics>,
        ack: Arc<AckCoordinator>,
        provider: Arc<dyn ClientProvider>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            filter,
            metrics,
            ack,
            provider,
            shutdown,
            connected_once: AtomicBool::new(false),
        }
    }

    /// Whether any connection attempt has ever reached streaming.
    pub fn connected_once(&self) -> bool {
        self.connected_once.load(Ordering::SeqCst)
    }

    /// Connect, stream until shutdown or a fatal error, then drain.
    pub async fn connect_and_stream(&self) -> Result<()> {
        let params = self.config.connect_params()?;
        let client = ReplicationClient::connect(&params)
            .await
            .map_err(|e| BridgeError::connect(format!("unable to connect to {params}: {e:#}")))?;
        let mut stream = client.start_replication(&self.config.slot).await.map_err(|e| {
            BridgeError::connect(format!(
                "unable to start replication on slot {}: {e:#}",
                self.config.slot
            ))
        })?;

        self.connected_once.store(true, Ordering::SeqCst);
        self.ack.reset_status_clock().await;
        info!(
            "replication starting on slot {} from LSN {}",
            self.config.slot,
            self.ack.acked_lsn().await
        );

        // Rendezvous hand-off: at most one message in flight.
        let (msg_tx, msg_rx) = mpsc::channel::<WalEvent>(1);
        let (flush_tx, flush_rx) = mpsc::channel::<()>(1);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<BridgeError>(1);

        let publisher = BatchPublisher::new(
            self.config.stream.clone(),
            self.provider.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        );
        let consumer = Consumer::new(
            publisher,
            self.filter.clone(),
            self.metrics.clone(),
            self.ack.clone(),
            self.shutdown.clone(),
        );
        let consumer_handle = tokio::spawn(consumer.run(msg_rx, flush_rx, fatal_tx));

        let mut last_flush_signal = Instant::now();
        let mut last_stats = Instant::now();
        let mut result: Result<()> = Ok(());

        while !self.shutdown.is_set() {
            let mut reply_requested = false;

            match stream.recv_timeout(REPLICATION_POLL_INTERVAL).await {
                Ok(None) => {}
                Ok(Some(ReplicationFrame::XLogData { lsn, data })) => {
                    if msg_tx.send(WalEvent { lsn, payload: data }).await.is_err() {
                        // The consumer is gone: either shutdown raced us
                        // or it died with a fatal error.
                        if !self.shutdown.is_set() {
                            result = Err(fatal_rx.try_recv().unwrap_or_else(|_| {
                                BridgeError::replication("consumer task ended unexpectedly")
                            }));
                        }
                        break;
                    }
                }
                Ok(Some(ReplicationFrame::Keepalive {
                    reply_requested: requested,
                    ..
                })) => reply_requested = requested,
                Err(e) => {
                    result = Err(BridgeError::replication(format!("{e:#}")));
                    break;
                }
            }

            // Did the consumer die?
            if let Ok(fatal) = fatal_rx.try_recv() {
                result = Err(fatal);
                break;
            }

            if let Err(e) = self.ack.maybe_send_standby(&mut stream, reply_requested).await {
                result = Err(BridgeError::replication(format!(
                    "unable to send standby status: {e:#}"
                )));
                break;
            }

            if last_flush_signal.elapsed() >= FLUSH_INTERVAL {
                // Coalesced: a queued signal means one is already pending.
                if flush_tx.try_send(()).is_ok() {
                    last_flush_signal = Instant::now();
                }
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.report_stats(last_stats.elapsed()).await;
                last_stats = Instant::now();
            }
        }

        // Draining: stop intake, let the consumer finish (on shutdown it
        // performs one final flush), then send a final standby status.
        drop(msg_tx);
        drop(flush_tx);
        if result.is_err() && !self.shutdown.is_set() {
            // The connection already failed; don't wait out a retrying
            // flush, the slot replays whatever is still buffered.
            consumer_handle.abort();
        }
        if let Err(e) = consumer_handle.await {
            if !e.is_cancelled() {
                warn!("consumer task panicked: {e}");
            }
        }
        if result.is_ok() {
            if let Ok(fatal) = fatal_rx.try_recv() {
                result = Err(fatal);
            }
        }
        if let Err(e) = self.ack.maybe_send_standby(&mut stream, true).await {
            warn!("final standby status failed: {e:#}");
        }

        result
    }

    async fn report_stats(&self, window: Duration) {
        let snap = self.metrics.snapshot_and_reset();
        info!(
            "inserts={} ({:.1}/s) updates={} ({:.1}/s) deletes={} ({:.1}/s) \
             skipped={} ({:.1}/s) published={} ({:.1}/s, {:.0}ms/record, {:.1}s total) lsn={}",
            snap.inserts,
            MetricsSnapshot::per_second(snap.inserts, window),
            snap.updates,
            MetricsSnapshot::per_second(snap.updates, window),
            snap.deletes,
            MetricsSnapshot::per_second(snap.deletes, window),
            snap.skipped,
            MetricsSnapshot::per_second(snap.skipped, window),
            snap.records_published,
            MetricsSnapshot::per_second(snap.records_published, window),
            snap.ms_per_record(),
            snap.publish_secs(),
            self.ack.acked_lsn().await,
        );
    }
}

/// The sole writer to the publish buffer. Runs the per-message workflow
/// and the flush-signal path.
struct Consumer {
    publisher: BatchPublisher,
    filter: Arc<TableFilter>,
    metrics: Arc<BridgeMetrics>,
    ack: Arc<AckCoordinator>,
    shutdown: ShutdownToken,
    /// LSN of the last message whose record entered the buffer; what a
    /// timer-triggered flush may acknowledge.
    last_seen: Option<Lsn>,
}

impl Consumer {
    fn new(
        publisher: BatchPublisher,
        filter: Arc<TableFilter>,
        metrics: Arc<BridgeMetrics>,
        ack: Arc<AckCoordinator>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            publisher,
            filter,
            metrics,
            ack,
            shutdown,
            last_seen: None,
        }
    }

    async fn run(
        mut self,
        mut messages: mpsc::Receiver<WalEvent>,
        mut flush: mpsc::Receiver<()>,
        fatal: mpsc::Sender<BridgeError>,
    ) {
        let mut wakeup = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = wakeup.recv() => break,
                signal = flush.recv() => match signal {
                    Some(()) => {
                        if let Err(e) = self.flush_now().await {
                            let _ = fatal.try_send(e);
                            return;
                        }
                    }
                    None => break,
                },
                message = messages.recv() => match message {
                    Some(event) => {
                        if let Err(e) = self.handle(event).await {
                            let _ = fatal.try_send(e);
                            return;
                        }
                    }
                    None => break,
                },
            }
        }

        if self.shutdown.is_set() {
            // Graceful drain: one final flush; on failure the data is
            // simply re-delivered from the slot after restart.
            match self.publisher.flush().await {
                Ok(true) => {
                    if let Some(lsn) = self.last_seen {
                        self.ack.observe_enqueued(lsn).await;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("final flush failed; records will be re-delivered: {e}"),
            }
        }
        // On a connection failure the buffer is dropped: the publisher
        // never retries across reconnections, the slot replays instead.
    }

    /// The per-message workflow: parse prelude, drop transaction
    /// markers, filter, parse columns, encode, submit.
    async fn handle(&mut self, event: WalEvent) -> Result<()> {
        let text = std::str::from_utf8(&event.payload).map_err(|e| {
            BridgeError::parse(
                format!("payload is not valid UTF-8: {e}"),
                String::from_utf8_lossy(&event.payload),
            )
        })?;

        let row = match parse_prelude(text).map_err(|e| BridgeError::parse(e.to_string(), text))? {
            Prelude::Begin | Prelude::Commit => return Ok(()),
            Prelude::Row(row) => row,
        };

        if !self.filter.include(row.relation) {
            self.metrics.record_skipped();
            return Ok(());
        }

        self.metrics.record_op(row.op);
        let images = parse_columns(&row).map_err(|e| BridgeError::parse(e.to_string(), text))?;
        let change = ChangeEvent::from_row(row.op, row.relation, images, event.lsn);
        let record = change.encode()?;

        let flushed = self.publisher.submit(record).await?;
        self.last_seen = Some(event.lsn);
        if flushed {
            self.ack.observe_enqueued(event.lsn).await;
        }
        Ok(())
    }

    /// Timer-triggered flush: acknowledge up to the last buffered LSN
    /// once the publish succeeded.
    async fn flush_now(&mut self) -> Result<()> {
        if self.publisher.flush().await? {
            if let Some(lsn) = self.last_seen {
                self.ack.observe_enqueued(lsn).await;
            }
        }
        Ok(())
    }
}
