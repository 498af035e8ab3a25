// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use traceline_agent::config::AgentConfig;
use traceline_agent::services::AgentServices;

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("traceline-agent: {e}");
            process::exit(1);
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut handle = match AgentServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start agent services: {e}");
            process::exit(1);
        }
    };
    info!(
        "traceline-agent {} started, relay on {}",
        env!("CARGO_PKG_VERSION"),
        handle.relay_addr()
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }

    if let Err(e) = handle.stop().await {
        error!("Shutdown did not complete cleanly: {e}");
        process::exit(1);
    }
}
