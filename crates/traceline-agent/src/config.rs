// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServicesError;

pub const DEFAULT_REPORTING_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SPILLOVER_MAX_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_SPILLOVER_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SPILLOVER_PATH: &str = "traceline-spillover.db";

#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub ingest_url: Option<String>,
    pub ingest_key: Option<String>,
    pub hostname: String,
    pub reporting_interval: Duration,
    pub relay_port: u16,
    pub spillover_path: PathBuf,
    pub spillover_max_bytes: u64,
    pub spillover_max_attempts: u32,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ingest_url: None,
            ingest_key: None,
            hostname: default_hostname(),
            reporting_interval: Duration::from_secs(DEFAULT_REPORTING_INTERVAL_SECS),
            relay_port: traceline_relay::DEFAULT_RELAY_PORT,
            spillover_path: PathBuf::from(DEFAULT_SPILLOVER_PATH),
            spillover_max_bytes: DEFAULT_SPILLOVER_MAX_BYTES,
            spillover_max_attempts: DEFAULT_SPILLOVER_MAX_ATTEMPTS,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Reads configuration from TRACELINE_* environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Result<Self, ServicesError> {
        let defaults = AgentConfig::default();
        let config = Self {
            ingest_url: env::var("TRACELINE_INGEST_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            ingest_key: env::var("TRACELINE_INGEST_KEY")
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            hostname: env::var("TRACELINE_HOSTNAME").unwrap_or(defaults.hostname),
            reporting_interval: env::var("TRACELINE_REPORTING_INTERVAL_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reporting_interval),
            relay_port: env::var("TRACELINE_RELAY_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(defaults.relay_port),
            spillover_path: env::var("TRACELINE_SPILLOVER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.spillover_path),
            spillover_max_bytes: env::var("TRACELINE_SPILLOVER_MAX_BYTES")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(defaults.spillover_max_bytes),
            spillover_max_attempts: env::var("TRACELINE_SPILLOVER_MAX_ATTEMPTS")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(defaults.spillover_max_attempts),
            https_proxy: env::var("TRACELINE_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            log_level: env::var("TRACELINE_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServicesError> {
        if self.reporting_interval.is_zero() {
            return Err(ServicesError::InvalidConfig(
                "reporting interval must be greater than zero".to_string(),
            ));
        }
        if self.spillover_max_bytes == 0 {
            return Err(ServicesError::InvalidConfig(
                "spillover size cap must be greater than zero".to_string(),
            ));
        }
        if self.ingest_key.is_some() && self.ingest_url.is_none() {
            return Err(ServicesError::InvalidConfig(
                "TRACELINE_INGEST_URL must be set when TRACELINE_INGEST_KEY is".to_string(),
            ));
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ServicesError::InvalidConfig(format!(
                "Invalid log level '{}', must be one of {valid_log_levels:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn default_hostname() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
