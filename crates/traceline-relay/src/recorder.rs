// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, error};
use ustr::{ustr, Ustr};

use traceline_telemetry::{Layer, ReportingPeriod};

use crate::message::ReportMessage;
use crate::relay::REPORT_ENDPOINT_PATH;

/// Sub-second bound on every send. A slow or absent relay costs the host
/// request at most this long, never a hang.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Client side of the relay: encodes finished trees and periods and posts
/// them to the agent on loopback. Every failure is logged and the message
/// dropped; nothing here ever surfaces into the instrumented request.
pub struct Recorder {
    endpoint: String,
    client: reqwest::Client,
    reportable_kinds: Option<HashSet<Ustr>>,
}

impl Recorder {
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self::with_timeout(relay_addr, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_timeout(relay_addr: SocketAddr, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build recorder client: {e}, using defaults");
                reqwest::Client::new()
            });
        Self {
            endpoint: format!("http://{relay_addr}{REPORT_ENDPOINT_PATH}"),
            client,
            reportable_kinds: None,
        }
    }

    /// Restricts sends to trees whose root kind appears in `kinds`. Filtered
    /// trees are dropped here, before any bytes hit the wire.
    pub fn reportable_kinds(mut self, kinds: &[&str]) -> Self {
        self.reportable_kinds = Some(kinds.iter().map(|kind| ustr(kind)).collect());
        self
    }

    pub async fn send_tree(&self, tree: &Layer) {
        if let Some(kinds) = &self.reportable_kinds {
            if !kinds.contains(&tree.kind) {
                debug!(
                    "Not relaying {}/{}: root kind is not reportable",
                    tree.kind, tree.name
                );
                return;
            }
        }
        match ReportMessage::record_tree(tree) {
            Ok(message) => self.post(message, "tree").await,
            Err(e) => error!("Failed to encode tree for relay: {e}; dropped"),
        }
    }

    pub async fn send_period(&self, period: &ReportingPeriod) {
        match ReportMessage::deliver_period(period) {
            Ok(message) => self.post(message, "period").await,
            Err(e) => error!("Failed to encode period for relay: {e}; dropped"),
        }
    }

    async fn post(&self, message: ReportMessage, what: &str) {
        let body = message.encode();
        let sent = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {
                debug!("Relayed {what} to {}", self.endpoint);
            }
            Ok(response) => {
                error!(
                    "Relay rejected {what} with status {}; dropped",
                    response.status()
                );
            }
            Err(e) => {
                // Routine when no agent is running; the host must not care.
                debug!("Failed to relay {what}: {e}; dropped");
            }
        }
    }
}
