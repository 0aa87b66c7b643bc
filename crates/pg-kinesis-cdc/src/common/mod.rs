//! Database- and sink-agnostic pieces of the bridge:
//!
//! - [`BridgeError`] - error taxonomy for the whole pipeline
//! - [`Lsn`] - write-ahead-log positions
//! - [`PatternMatcher`] / [`PatternSet`] - compiled table patterns
//! - [`TableFilter`] - include/exclude decisions, memoized per relation
//! - [`ChangeEvent`] / [`Envelope`] - row change model and JSON envelope
//! - [`BridgeMetrics`] - lock-free statistics counters
//! - [`RetryBackoff`] - jittered exponential backoff
//! - [`ShutdownToken`] - process-wide shutdown flag + broadcast

mod backoff;
mod error;
mod event;
mod filter;
mod lsn;
mod metrics;
pub mod pattern;
mod shutdown;

pub use backoff::*;
pub use error::*;
pub use event::*;
pub use filter::*;
pub use lsn::*;
pub use metrics::*;
pub use pattern::{PatternError, PatternMatcher, PatternSet};
pub use shutdown::*;
