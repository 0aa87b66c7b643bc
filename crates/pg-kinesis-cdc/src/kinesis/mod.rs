//! Downstream side of the bridge: the Kinesis client seams and the
//! batching publisher.

pub mod client;
pub mod publisher;

pub use client::{
    ClientProvider, KinesisClientProvider, PutRecordsOutcome, RecordFailure, StreamClient,
};
pub use publisher::{BatchPublisher, MAX_BATCH_BYTES, MAX_BATCH_RECORDS};
