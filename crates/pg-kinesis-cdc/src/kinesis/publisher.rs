//! Batching publisher with at-least-once semantics.
//!
//! Records accumulate in a FIFO buffer bounded by count and aggregate
//! payload. A flush publishes the whole buffer: full success clears it,
//! per-record rejections shrink it to the failed subset (original order
//! preserved), and transport failures retry the whole buffer with a
//! fresh client. The caller learns through `submit`'s return value
//! whether the record it just handed over has been published, which is
//! what couples acknowledgements to durability.

use crate::common::{
    BridgeError, BridgeMetrics, OutgoingRecord, Result, RetryBackoff, ShutdownToken,
    MAX_RECORD_BYTES,
};
use crate::kinesis::client::{ClientProvider, PutRecordsOutcome, StreamClient};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Maximum records per publish request.
pub const MAX_BATCH_RECORDS: usize = 500;
/// Maximum aggregate payload per publish request.
pub const MAX_BATCH_BYTES: usize = 5 << 20; // 5MiB

const MAX_FLUSH_ATTEMPTS: u32 = 100;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Accumulates encoded records and publishes them in batches.
pub struct BatchPublisher {
    stream: String,
    provider: Arc<dyn ClientProvider>,
    client: Option<Arc<dyn StreamClient>>,
    buffer: Vec<OutgoingRecord>,
    buffer_bytes: usize,
    metrics: Arc<BridgeMetrics>,
    shutdown: ShutdownToken,
}

impl BatchPublisher {
    pub fn new(
        stream: impl Into<String>,
        provider: Arc<dyn ClientProvider>,
        metrics: Arc<BridgeMetrics>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            stream: stream.into(),
            provider,
            client: None,
            buffer: Vec::new(),
            buffer_bytes: 0,
            metrics,
            shutdown,
        }
    }

    /// Number of buffered records.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Aggregate payload bytes of buffered records.
    pub fn pending_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Append a record, flushing when a buffer bound is hit.
    ///
    /// Returns `true` only when the just-submitted record itself has been
    /// published; the caller may then advance acknowledgement state to
    /// this record's LSN. A flush triggered to make room for the record
    /// (byte bound) publishes *older* records only and reports `false`.
    pub async fn submit(&mut self, record: OutgoingRecord) -> Result<bool> {
        if record.payload.len() > MAX_RECORD_BYTES {
            return Err(BridgeError::OversizedRecord {
                bytes: record.payload.len(),
            });
        }

        if self.buffer_bytes + record.payload.len() > MAX_BATCH_BYTES {
            self.flush().await?;
        }

        self.buffer_bytes += record.payload.len();
        self.buffer.push(record);

        if self.buffer.len() >= MAX_BATCH_RECORDS {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Publish the current buffer. Returns `true` when records were
    /// published, `false` when the buffer was already empty.
    ///
    /// Retries with jittered exponential backoff; per-record rejections
    /// keep only the failed subset for the next attempt, transport
    /// failures discard the client so the provider builds a fresh one.
    /// Shutdown is honored between attempts, after the in-flight request
    /// finishes, so a final drain flush always gets one real attempt.
    pub async fn flush(&mut self) -> Result<bool> {
        if self.buffer.is_empty() {
            return Ok(false);
        }

        let mut backoff = RetryBackoff::new(BACKOFF_BASE, BACKOFF_CAP);
        while backoff.attempt() < MAX_FLUSH_ATTEMPTS {
            let delay = backoff.next_delay();

            let client = match self.client.clone() {
                Some(client) => Some(client),
                None => match self.provider.connect().await {
                    Ok(client) => {
                        self.client = Some(client.clone());
                        Some(client)
                    }
                    Err(e) => {
                        warn!(
                            "unable to build stream client: {e:#}; retrying in {:?}",
                            delay
                        );
                        None
                    }
                },
            };

            if let Some(client) = client {
                let started = Instant::now();
                match client.put_records(&self.stream, &self.buffer).await {
                    Ok(outcome) if outcome.is_complete() => {
                        self.metrics
                            .record_published(self.buffer.len() as u64, started.elapsed());
                        self.buffer.clear();
                        self.buffer_bytes = 0;
                        return Ok(true);
                    }
                    Ok(outcome) => {
                        let total = self.buffer.len();
                        self.retain_failed(&outcome);
                        self.metrics
                            .record_published((total - self.buffer.len()) as u64, started.elapsed());
                        warn!(
                            "{} of {} records failed during publish; retrying in {:?}",
                            self.buffer.len(),
                            total,
                            delay
                        );
                    }
                    Err(e) => {
                        warn!("publish request failed: {e:#}; retrying in {:?}", delay);
                        // Force a fresh client (and credentials) next time.
                        self.client = None;
                    }
                }
            }

            if self.shutdown.is_set() {
                return Err(BridgeError::Interrupted);
            }
            tokio::time::sleep(delay).await;
        }

        Err(BridgeError::publish(format!(
            "batch of {} records not accepted after {} attempts",
            self.buffer.len(),
            MAX_FLUSH_ATTEMPTS
        )))
    }

    /// Shrink the buffer to the records the service rejected, preserving
    /// their original relative order.
    fn retain_failed(&mut self, outcome: &PutRecordsOutcome) {
        let failed: HashSet<usize> = outcome.failed.iter().map(|f| f.index).collect();
        let records = std::mem::take(&mut self.buffer);
        self.buffer = records
            .into_iter()
            .enumerate()
            .filter(|(index, _)| failed.contains(index))
            .map(|(_, record)| record)
            .collect();
        self.buffer_bytes = self.buffer.iter().map(|r| r.payload.len()).sum();
    }
}
