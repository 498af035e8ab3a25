// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error};

use crate::aggregator::{PeriodPayload, ReportingPeriod};
use crate::errors::ShipError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ATTEMPTS: u32 = 3;
const COMPRESSION_LEVEL: i32 = 6;

/// Envelope shipped to the intake: one period plus enough identity for the
/// collector to attribute it.
#[derive(Debug, Serialize)]
struct IntakeEnvelope<'a> {
    hostname: &'a str,
    agent_version: &'a str,
    period: PeriodPayload,
}

#[derive(Clone, Debug)]
pub struct IntakeConfig {
    pub url: Option<String>,
    pub key: Option<String>,
    pub hostname: String,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
}

impl IntakeConfig {
    pub fn disabled(hostname: impl Into<String>) -> Self {
        Self {
            url: None,
            key: None,
            hostname: hostname.into(),
            https_proxy: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Authenticated HTTP client for the remote intake. Periods are serialized
/// to json, zstd compressed, and posted; a 2xx is delivery, anything else is
/// the caller's problem to park in spillover.
pub struct IntakeClient {
    config: IntakeConfig,
    client: reqwest::Client,
}

impl IntakeClient {
    pub fn new(config: IntakeConfig) -> Self {
        let client = build_client(config.https_proxy.as_deref(), config.timeout).unwrap_or_else(|e| {
            error!("Unable to apply proxy configuration: {e}, no proxy will be used");
            reqwest::Client::new()
        });
        Self { config, client }
    }

    /// False when url or key is missing; nothing will ever ship.
    pub fn is_enabled(&self) -> bool {
        self.config.url.is_some() && self.config.key.is_some()
    }

    /// Delivers one period. Transient failures (network errors, 5xx) retry
    /// in-call with exponential backoff; a 4xx is permanent and returns at
    /// once. The period itself is untouched either way, so the caller can
    /// spill it on error.
    pub async fn ship(&self, period: &ReportingPeriod) -> Result<(), ShipError> {
        let (Some(url), Some(key)) = (self.config.url.as_deref(), self.config.key.as_deref())
        else {
            return Err(ShipError::Disabled);
        };

        let envelope = IntakeEnvelope {
            hostname: &self.config.hostname,
            agent_version: env!("CARGO_PKG_VERSION"),
            period: period.to_payload(),
        };
        let body = serde_json::to_vec(&envelope)?;
        let body = zstd::encode_all(body.as_slice(), COMPRESSION_LEVEL).map_err(ShipError::Compression)?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            let response = self
                .client
                .post(url)
                .header("X-Traceline-Key", key)
                .header("X-Agent-Hostname", self.config.hostname.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::CONTENT_ENCODING, "zstd")
                .body(body.clone())
                .send()
                .await;

            let last_error = match response {
                Ok(resp) if resp.status().is_success() => {
                    debug!(
                        "Shipped period {} ({} metrics) in {}ms",
                        period.period_start(),
                        period.len(),
                        started.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    error!(
                        "Intake rejected period {} with status {status}",
                        period.period_start()
                    );
                    if status.is_client_error() {
                        // The payload will never get better; retrying burns
                        // the backoff budget for nothing.
                        return Err(ShipError::Status(status));
                    }
                    ShipError::Status(status)
                }
                Err(e) => {
                    error!(
                        "Network error shipping period {} (attempt {attempts}): {e}",
                        period.period_start()
                    );
                    ShipError::Request(e)
                }
            };

            if attempts >= MAX_ATTEMPTS {
                return Err(last_error);
            }
            let backoff_ms = 100 * (2_u64.pow(attempts - 1));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

fn build_client(proxy_url: Option<&str>, timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy_url)?);
    }
    builder.build()
}
