//! Stream client seams and the AWS Kinesis implementation.
//!
//! The publisher talks to the downstream service through two traits:
//! [`StreamClient`] performs one PutRecords call, [`ClientProvider`]
//! builds a fresh client. The provider is consulted again after any
//! transport-level failure so a new client picks up rotated credentials
//! and endpoint changes.

use crate::common::OutgoingRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use std::sync::Arc;
use tracing::debug;

/// One record the downstream service rejected within an otherwise
/// successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// Index of the record within the submitted batch.
    pub index: usize,
    pub code: String,
    pub message: String,
}

/// Result of one PutRecords call that reached the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRecordsOutcome {
    /// Rejected records, in batch order. Empty means full success.
    pub failed: Vec<RecordFailure>,
}

impl PutRecordsOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A client capable of publishing one batch of records.
///
/// A transport-level `Err` means the request as a whole failed and every
/// record must be retried; per-record rejections come back in the
/// [`PutRecordsOutcome`].
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn put_records(
        &self,
        stream: &str,
        records: &[OutgoingRecord],
    ) -> Result<PutRecordsOutcome>;
}

/// Builds stream clients. Called once per connection and again after any
/// transport error, so each retry can pick up fresh credentials.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StreamClient>>;
}

/// Provider backed by the AWS default credential chain (environment,
/// profile, IMDS/IRSA). An endpoint override supports LocalStack-style
/// deployments.
#[derive(Debug, Clone, Default)]
pub struct KinesisClientProvider {
    endpoint_url: Option<String>,
}

impl KinesisClientProvider {
    pub fn new(endpoint_url: Option<String>) -> Self {
        Self { endpoint_url }
    }
}

#[async_trait]
impl ClientProvider for KinesisClientProvider {
    async fn connect(&self) -> Result<Arc<dyn StreamClient>> {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let mut builder = aws_sdk_kinesis::config::Builder::from(&base);
        if let Some(ref endpoint) = self.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let client = aws_sdk_kinesis::Client::from_conf(builder.build());
        debug!("built Kinesis client");
        Ok(Arc::new(KinesisStreamClient { client }))
    }
}

struct KinesisStreamClient {
    client: aws_sdk_kinesis::Client,
}

#[async_trait]
impl StreamClient for KinesisStreamClient {
    async fn put_records(
        &self,
        stream: &str,
        records: &[OutgoingRecord],
    ) -> Result<PutRecordsOutcome> {
        let entries = records
            .iter()
            .map(|record| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(record.payload.to_vec()))
                    .partition_key(record.partition_key.clone())
                    .build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("building PutRecords entries")?;

        let output = self
            .client
            .put_records()
            .stream_name(stream)
            .set_records(Some(entries))
            .send()
            .await
            .context("Kinesis PutRecords request failed")?;

        let failed = output
            .records()
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry.error_code().map(|code| RecordFailure {
                    index,
                    code: code.to_string(),
                    message: entry.error_message().unwrap_or_default().to_string(),
                })
            })
            .collect();

        Ok(PutRecordsOutcome { failed })
    }
}
