// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use traceline_relay::{Relay, StoreProcessor};
use traceline_telemetry::flusher::DeliveryWorker;
use traceline_telemetry::intake::{IntakeClient, IntakeConfig};
use traceline_telemetry::spillover::{SpilloverConfig, SpilloverFile};
use traceline_telemetry::AggregationStore;

use crate::config::AgentConfig;
use crate::error::ServicesError;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wires the relay, the shared store, and the delivery worker together from
/// one config.
pub struct AgentServices {
    config: AgentConfig,
}

/// Running agent. Dropping the handle leaves the tasks running; call
/// [`ServicesHandle::stop`] for an orderly shutdown with a final flush.
#[derive(Debug)]
pub struct ServicesHandle {
    cancel: CancellationToken,
    relay_addr: SocketAddr,
    store: Arc<Mutex<AggregationStore>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentServices {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub async fn start(self) -> Result<ServicesHandle, ServicesError> {
        let config = self.config;
        config.validate()?;

        let store = Arc::new(Mutex::new(AggregationStore::new(config.reporting_interval)));
        let cancel = CancellationToken::new();

        // Open the persistent pieces before spawning anything, so a failure
        // here leaves no task behind.
        let spillover = SpilloverFile::open(SpilloverConfig {
            path: config.spillover_path.clone(),
            max_bytes: config.spillover_max_bytes,
            max_attempts: config.spillover_max_attempts,
        })
        .map_err(|e| ServicesError::Spillover(e.to_string()))?;

        let relay = Relay::new(
            config.relay_port,
            Arc::new(StoreProcessor::new(Arc::clone(&store))),
        );
        let (relay_addr, relay_handle) = relay
            .start(cancel.clone())
            .await
            .map_err(|e| ServicesError::RelayStart(e.to_string()))?;
        info!("Relay accepting reports on {relay_addr}");

        let intake = IntakeClient::new(IntakeConfig {
            url: config.ingest_url.clone(),
            key: config.ingest_key.clone(),
            hostname: config.hostname.clone(),
            https_proxy: config.https_proxy.clone(),
            timeout: traceline_telemetry::intake::DEFAULT_TIMEOUT,
        });
        if !intake.is_enabled() {
            error!("TRACELINE_INGEST_KEY not set, won't deliver metrics");
        }

        let worker = DeliveryWorker::new(
            Arc::clone(&store),
            intake,
            spillover,
            config.reporting_interval,
        );
        let worker_handle = tokio::spawn(worker.run(cancel.clone()));

        Ok(ServicesHandle {
            cancel,
            relay_addr,
            store,
            tasks: vec![relay_handle, worker_handle],
        })
    }
}

impl ServicesHandle {
    /// Address the relay actually bound. With a zero port in the config this
    /// is where the ephemeral port landed.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// The shared store, for recording traces in-process without a relay
    /// round trip.
    pub fn store(&self) -> Arc<Mutex<AggregationStore>> {
        Arc::clone(&self.store)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.is_empty()
    }

    /// Cancels every task and waits for them, final flush included. Safe to
    /// call more than once.
    pub async fn stop(&mut self) -> Result<(), ServicesError> {
        if !self.cancel.is_cancelled() {
            info!("Stopping agent services");
            self.cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            match timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Service task ended abnormally: {e}"),
                Err(_) => return Err(ServicesError::ShutdownTimeout),
            }
        }
        Ok(())
    }
}
