// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{lock_store, AggregationStore, ReportingPeriod};
use crate::intake::IntakeClient;
use crate::spillover::SpilloverFile;

/// Budget per period during the shutdown flush, so a dead network cannot
/// stall process exit.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Background task that moves completed periods out of the store and into
/// the intake, parking failures in spillover for later.
///
/// The store lock is held only while draining; every network call happens
/// after the guard is dropped.
pub struct DeliveryWorker {
    store: Arc<Mutex<AggregationStore>>,
    intake: IntakeClient,
    spillover: SpilloverFile,
    interval: Duration,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<Mutex<AggregationStore>>,
        intake: IntakeClient,
        spillover: SpilloverFile,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            intake,
            spillover,
            interval,
        }
    }

    /// Runs flush cycles until the token is cancelled, then makes one
    /// bounded final pass over everything still buffered.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Delivery worker started");
        let mut flush_interval = interval(self.interval);
        flush_interval.tick().await; // discard first tick, which is instantaneous
        loop {
            tokio::select! {
                _ = flush_interval.tick() => {
                    self.flush().await;
                }
                _ = cancel.cancelled() => {
                    info!("Delivery worker shutting down");
                    self.final_flush().await;
                    break;
                }
            }
        }
    }

    /// One delivery cycle: drain completed periods, ship them, then walk the
    /// spillover backlog if nothing failed fresh.
    pub async fn flush(&mut self) {
        let periods = { lock_store(&self.store).drain_ready() };
        if !self.intake.is_enabled() {
            if !periods.is_empty() {
                debug!(
                    "Intake disabled, discarding {} ready period(s)",
                    periods.len()
                );
            }
            return;
        }

        let mut had_failure = false;
        for period in periods {
            if let Err(e) = self.intake.ship(&period).await {
                error!("Failed to deliver period {}: {e}", period.period_start());
                had_failure = true;
                self.spill(&period);
            }
        }

        // A fresh failure means the intake is unreachable right now; walking
        // the backlog would only burn redelivery attempts.
        if !had_failure {
            self.retry_backlog().await;
        }
    }

    async fn retry_backlog(&mut self) {
        let entries = match self.spillover.drain() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read spillover backlog: {e}");
                return;
            }
        };
        for entry in entries {
            let seq = entry.seq;
            if entry.attempts >= self.spillover.max_attempts() {
                warn!(
                    "Dropping period {} after {} failed redelivery attempts; data lost",
                    entry.period.period_start, entry.attempts
                );
                if let Err(e) = self.spillover.acknowledge(seq) {
                    error!("Failed to drop spillover entry {seq}: {e}");
                }
                continue;
            }
            let period = ReportingPeriod::from_payload(entry.period);
            match self.intake.ship(&period).await {
                Ok(()) => {
                    debug!("Redelivered spilled period {}", period.period_start());
                    if let Err(e) = self.spillover.acknowledge(seq) {
                        error!("Failed to acknowledge spillover entry {seq}: {e}");
                    }
                }
                Err(e) => {
                    debug!(
                        "Spilled period {} still undeliverable: {e}",
                        period.period_start()
                    );
                    if let Err(e) = self.spillover.record_attempt(seq) {
                        error!("Failed to record attempt on spillover entry {seq}: {e}");
                    }
                    // The link is down again; later entries can wait for the
                    // next cycle.
                    break;
                }
            }
        }
    }

    async fn final_flush(&mut self) {
        let periods = { lock_store(&self.store).drain_all() };
        if periods.is_empty() {
            return;
        }
        if !self.intake.is_enabled() {
            debug!(
                "Intake disabled, discarding {} period(s) at shutdown",
                periods.len()
            );
            return;
        }
        info!("Final flush of {} period(s)", periods.len());
        for period in periods {
            match timeout(FINAL_FLUSH_TIMEOUT, self.intake.ship(&period)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Final delivery of period {} failed: {e}",
                        period.period_start()
                    );
                    self.spill(&period);
                }
                Err(_) => {
                    warn!(
                        "Final delivery of period {} timed out",
                        period.period_start()
                    );
                    self.spill(&period);
                }
            }
        }
    }

    fn spill(&mut self, period: &ReportingPeriod) {
        match self.spillover.append(period) {
            Ok(()) => debug!("Spilled period {} for redelivery", period.period_start()),
            Err(e) => error!(
                "Failed to spill period {}: {e}; period lost",
                period.period_start()
            ),
        }
    }
}
