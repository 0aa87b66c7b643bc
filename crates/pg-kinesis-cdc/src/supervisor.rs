//! Lifecycle management: the reconnect loop and slot administration.
//!
//! The supervisor owns the state that must survive reconnects (filter
//! cache, metrics, acknowledgement state) and hands the driver a fresh
//! connection after transient failures. The upstream slot replays
//! anything that was not acknowledged, so a reconnect never loses data.

use crate::ack::AckCoordinator;
use crate::common::{BridgeError, BridgeMetrics, Result, ShutdownToken, TableFilter};
use crate::config::BridgeConfig;
use crate::driver::ReplicationDriver;
use crate::kinesis::client::{ClientProvider, KinesisClientProvider};
use crate::postgres::client::ReplicationClient;
use crate::postgres::params::ConnectParams;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Delay between reconnect attempts after streaming has worked once.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between attempts before the first successful connect
/// (HA deployments racing for the slot).
pub const INITIAL_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the bridge until shutdown.
pub struct Supervisor {
    config: Arc<BridgeConfig>,
    shutdown: ShutdownToken,
}

impl Supervisor {
    pub fn new(config: BridgeConfig, shutdown: ShutdownToken) -> Self {
        Self {
            config: Arc::new(config),
            shutdown,
        }
    }

    /// Reconnect loop. Returns an error only for configuration problems
    /// or when the first connect fails without `retry_initial`.
    pub async fn run(&self) -> Result<()> {
        let filter = Arc::new(
            TableFilter::new(&self.config.include_tables, &self.config.exclude_tables)
                .map_err(|e| BridgeError::config(format!("invalid table pattern: {e}")))?,
        );
        let metrics = Arc::new(BridgeMetrics::new());
        let ack = Arc::new(AckCoordinator::new());
        let provider: Arc<dyn ClientProvider> = Arc::new(KinesisClientProvider::new(
            self.config.endpoint_url.clone(),
        ));
        let driver = ReplicationDriver::new(
            self.config.clone(),
            filter,
            metrics,
            ack,
            provider,
            self.shutdown.clone(),
        );

        info!("starting bridge: {:?}", self.config);

        while !self.shutdown.is_set() {
            match driver.connect_and_stream().await {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => {}
                Err(e) => error!("replication ended: {e}"),
            }

            if !driver.connected_once() && !self.config.retry_initial {
                return Err(BridgeError::connect(
                    "failed to connect initially; pass --retry-initial to keep retrying \
                     (useful for HA setups)",
                ));
            }

            if self.shutdown.is_set() {
                break;
            }

            let delay = if driver.connected_once() {
                RECONNECT_INTERVAL
            } else {
                INITIAL_RECONNECT_INTERVAL
            };
            info!("reconnecting in {:?}", delay);

            let mut wakeup = self.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wakeup.recv() => {}
            }
        }

        info!("shutdown complete");
        Ok(())
    }
}

/// Create the replication slot (with the test_decoding plugin).
pub async fn create_slot(params: &ConnectParams, slot: &str) -> Result<()> {
    let mut client = ReplicationClient::connect(params)
        .await
        .map_err(|e| BridgeError::connect(format!("unable to connect to {params}: {e:#}")))?;
    client
        .create_replication_slot(slot)
        .await
        .map_err(|e| BridgeError::replication(format!("unable to create slot {slot}: {e:#}")))?;
    info!("created replication slot {}", slot);
    Ok(())
}

/// Drop the replication slot.
pub async fn drop_slot(params: &ConnectParams, slot: &str) -> Result<()> {
    let mut client = ReplicationClient::connect(params)
        .await
        .map_err(|e| BridgeError::connect(format!("unable to connect to {params}: {e:#}")))?;
    client
        .drop_replication_slot(slot)
        .await
        .map_err(|e| BridgeError::replication(format!("unable to drop slot {slot}: {e:#}")))?;
    info!("dropped replication slot {}", slot);
    Ok(())
}
