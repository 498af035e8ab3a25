// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Cross-process reporting for the Traceline agent. Instrumented processes
//! hold a [`Recorder`]; the agent process runs the [`Relay`], which decodes
//! framed report messages off loopback HTTP and feeds them to the shared
//! aggregation store.

pub mod errors;
pub mod http_utils;
pub mod message;
pub mod recorder;
pub mod relay;

pub use errors::{MessageError, RelayError};
pub use message::{Command, ReportMessage, HEADER_LEN, PROTOCOL_VERSION};
pub use recorder::Recorder;
pub use relay::{
    Relay, ReportProcessor, StoreProcessor, DEFAULT_RELAY_PORT, REPORT_ENDPOINT_PATH,
};
