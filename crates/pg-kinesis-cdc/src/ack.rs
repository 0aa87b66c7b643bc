//! Acknowledgement coordination between the publisher and the upstream
//! replication slot.
//!
//! `maxAckedLSN` only ever advances after a successful flush, so every
//! standby-status frame the bridge sends refers exclusively to data that
//! has been durably handed off downstream. `maxSentLSN` trails it and
//! tracks what the upstream has actually been told; the gap between the
//! two (or a forced flag, or the 5 s keepalive cadence, or an explicit
//! server request) is what triggers the next frame.

use crate::common::Lsn;
use crate::postgres::client::ReplicationStream;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Time before a proactive standby-status frame is sent even when
/// nothing changed.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for standby-status frames. Seam over the replication
/// stream so the cadence logic is testable without a socket.
#[async_trait]
pub trait StatusSink: Send {
    async fn send_standby_status(&mut self, lsn: Lsn) -> Result<()>;
}

#[async_trait]
impl StatusSink for ReplicationStream {
    async fn send_standby_status(&mut self, lsn: Lsn) -> Result<()> {
        ReplicationStream::send_standby_status(self, lsn).await
    }
}

struct AckState {
    /// Highest LSN whose payload was confirmed enqueued downstream.
    /// Monotonically non-decreasing for the process lifetime.
    max_acked: Lsn,
    /// Highest LSN transmitted to the upstream. Never exceeds max_acked.
    max_sent: Lsn,
    last_status: Instant,
    force_ack: bool,
}

/// Serializes acknowledgement state behind one mutex. The lock is held
/// across the standby-status send itself; the send is quick and the
/// cadence is 5 s, so contention is negligible.
pub struct AckCoordinator {
    state: Mutex<AckState>,
}

impl AckCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AckState {
                max_acked: Lsn::ZERO,
                max_sent: Lsn::ZERO,
                last_status: Instant::now(),
                force_ack: false,
            }),
        }
    }

    /// Record that every event up to `lsn` has been durably published.
    /// Called only after a successful flush.
    pub async fn observe_enqueued(&self, lsn: Lsn) {
        let mut state = self.state.lock().await;
        if lsn > state.max_acked {
            state.max_acked = lsn;
            state.force_ack = true;
        }
    }

    /// Send a standby-status frame when due: on a server request, when a
    /// flush advanced the acked position, when the sent position trails,
    /// or when the keepalive cadence expired.
    pub async fn maybe_send_standby<S: StatusSink + ?Sized>(
        &self,
        sink: &mut S,
        force: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if force
            || state.force_ack
            || state.max_acked > state.max_sent
            || state.last_status.elapsed() >= KEEPALIVE_TIMEOUT
        {
            sink.send_standby_status(state.max_acked).await?;
            state.last_status = Instant::now();
            state.max_sent = state.max_acked;
            state.force_ack = false;
        }

        Ok(())
    }

    /// Current acknowledged position (for statistics).
    pub async fn acked_lsn(&self) -> Lsn {
        self.state.lock().await.max_acked
    }

    /// Restart the keepalive clock; called when a connection enters
    /// streaming so a reconnect does not fire an immediate frame.
    pub async fn reset_status_clock(&self) {
        self.state.lock().await.last_status = Instant::now();
    }
}

impl Default for AckCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Lsn>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn send_standby_status(&mut self, lsn: Lsn) -> Result<()> {
            self.sent.push(lsn);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl StatusSink for FailingSink {
        async fn send_standby_status(&mut self, _lsn: Lsn) -> Result<()> {
            Err(anyhow::anyhow!("broken pipe"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_status_when_nothing_due() {
        let ack = AckCoordinator::new();
        let mut sink = RecordingSink::default();

        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert!(sink.sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_advances_and_triggers_status() {
        let ack = AckCoordinator::new();
        let mut sink = RecordingSink::default();

        ack.observe_enqueued(Lsn(0x1A0)).await;
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert_eq!(sink.sent, vec![Lsn(0x1A0)]);

        // Nothing new: no second frame.
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert_eq!(sink.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_cadence() {
        let ack = AckCoordinator::new();
        let mut sink = RecordingSink::default();

        ack.observe_enqueued(Lsn(5)).await;
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert_eq!(sink.sent.len(), 1);

        // Quiet stream: exactly one proactive frame after the timeout.
        tokio::time::advance(KEEPALIVE_TIMEOUT).await;
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert_eq!(sink.sent, vec![Lsn(5), Lsn(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_requested_reply() {
        let ack = AckCoordinator::new();
        let mut sink = RecordingSink::default();

        ack.maybe_send_standby(&mut sink, true).await.unwrap();
        assert_eq!(sink.sent, vec![Lsn::ZERO]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_lsn_is_monotonic() {
        let ack = AckCoordinator::new();
        ack.observe_enqueued(Lsn(100)).await;
        ack.observe_enqueued(Lsn(50)).await;
        assert_eq!(ack.acked_lsn().await, Lsn(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_keeps_state_pending() {
        let ack = AckCoordinator::new();
        ack.observe_enqueued(Lsn(9)).await;

        let mut broken = FailingSink;
        assert!(ack.maybe_send_standby(&mut broken, false).await.is_err());

        // The frame was never delivered, so the next healthy sink still
        // gets one.
        let mut sink = RecordingSink::default();
        ack.maybe_send_standby(&mut sink, false).await.unwrap();
        assert_eq!(sink.sent, vec![Lsn(9)]);
    }
}
