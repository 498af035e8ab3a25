// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Core telemetry pipeline for the Traceline agent: per-request layer trees,
//! statistical aggregation into fixed reporting periods, durable spillover
//! for undeliverable data, and delivery to the intake.
//!
//! Nothing in this crate panics into the host application. Instrumentation
//! mistakes are logged and discarded; delivery failures are parked on disk
//! and retried.

pub mod aggregator;
pub mod errors;
pub mod flusher;
pub mod intake;
pub mod layer;
pub mod metric;
pub mod spillover;
pub mod tracer;
mod util;

pub use aggregator::{lock_store, AggregationStore, PeriodPayload, ReportingPeriod};
pub use errors::{ShipError, SpilloverError, TraceError};
pub use layer::{Layer, LayerPayload};
pub use metric::{MetricIdentity, MetricPayload, MetricStats};
pub use tracer::{Instrument, RequestTracer};
