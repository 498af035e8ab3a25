// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to start relay: {0}")]
    RelayStart(String),
    #[error("Failed to open spillover file: {0}")]
    Spillover(String),
    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}
