// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::io;

use thiserror::Error;

/// Failures while assembling a layer tree. These never propagate into the
/// instrumented application; the tracer logs them and discards the trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace finished with {open} layer(s) still open")]
    Unbalanced { open: usize },
}

/// Failures while delivering a reporting period to the intake.
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("intake is disabled, no ingest key configured")]
    Disabled,
    #[error("failed to serialize period payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("failed to compress period payload: {0}")]
    Compression(io::Error),
    #[error("request to intake failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("intake rejected payload with status {0}")]
    Status(reqwest::StatusCode),
}

/// Failures in the durable spillover file.
#[derive(Debug, Error)]
pub enum SpilloverError {
    #[error("spillover io: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode spillover entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt spillover record at byte {offset}")]
    Corrupt { offset: u64 },
    #[error("entry of {size} bytes exceeds spillover capacity of {capacity} bytes")]
    Oversize { size: u64, capacity: u64 },
}
