// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Assembly of the Traceline agent process: environment configuration, the
//! loopback relay, the shared aggregation store, and the delivery worker.

pub mod config;
pub mod error;
pub mod services;

pub use config::AgentConfig;
pub use error::ServicesError;
pub use services::{AgentServices, ServicesHandle};
