// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::http::StatusCode;
use hyper::service::service_fn;
use hyper::{http, Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use traceline_telemetry::aggregator::lock_store;
use traceline_telemetry::{AggregationStore, Layer, ReportingPeriod};

use crate::errors::RelayError;
use crate::http_utils::{
    log_and_create_http_response, verify_request_content_length, HttpResponse,
};
use crate::message::{Command, ReportMessage};

pub const REPORT_ENDPOINT_PATH: &str = "/v1/report";
pub const DEFAULT_RELAY_PORT: u16 = 7721;

const MAX_REPORT_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Receives decoded report messages. The relay owns the wire format;
/// implementations own what a message means.
#[async_trait]
pub trait ReportProcessor {
    async fn record_tree(&self, tree: Layer);
    async fn deliver_period(&self, period: ReportingPeriod);
}

/// Feeds relayed reports into the shared aggregation store.
pub struct StoreProcessor {
    store: Arc<Mutex<AggregationStore>>,
}

impl StoreProcessor {
    pub fn new(store: Arc<Mutex<AggregationStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReportProcessor for StoreProcessor {
    async fn record_tree(&self, tree: Layer) {
        lock_store(&self.store).record(&tree);
    }

    async fn deliver_period(&self, period: ReportingPeriod) {
        lock_store(&self.store).absorb_period(period);
    }
}

/// Loopback HTTP listener that accepts framed reports from instrumented
/// processes on the same host and hands them to a processor.
pub struct Relay {
    port: u16,
    processor: Arc<dyn ReportProcessor + Send + Sync>,
}

impl Relay {
    pub fn new(port: u16, processor: Arc<dyn ReportProcessor + Send + Sync>) -> Self {
        Self { port, processor }
    }

    /// Binds 127.0.0.1 and spawns the accept loop. Returns the bound address
    /// (port 0 picks a free one) and the loop's handle. Cancelling the token
    /// stops the loop and releases the socket.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<()>), RelayError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let processor = Arc::clone(&self.processor);
        let handle = tokio::spawn(async move {
            Relay::serve(listener, processor, cancel).await;
        });
        debug!("Relay listening on {local_addr}");
        Ok((local_addr, handle))
    }

    async fn serve(
        listener: TcpListener,
        processor: Arc<dyn ReportProcessor + Send + Sync>,
        cancel: CancellationToken,
    ) {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, _)) => conn,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Relay accept failed: {e}");
                        break;
                    }
                },
                // Reap finished connection tasks so the set stays bounded.
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Relay connection handler panicked: {e}");
                        }
                    }
                    continue;
                }
            };

            let io = TokioIo::new(conn);
            let server = server.clone();
            let processor = Arc::clone(&processor);
            joinset.spawn(async move {
                let service = service_fn(move |req| {
                    Relay::report_endpoint_handler(req, Arc::clone(&processor))
                });
                if let Err(e) = server.serve_connection(io, service).await {
                    debug!("Relay connection ended with error: {e}");
                }
            });
        }
        joinset.abort_all();
        debug!("Relay stopped");
    }

    async fn report_endpoint_handler(
        req: Request<Incoming>,
        processor: Arc<dyn ReportProcessor + Send + Sync>,
    ) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, REPORT_ENDPOINT_PATH) => Self::handle_report(req, processor).await,
            _ => log_and_create_http_response("No such endpoint", StatusCode::NOT_FOUND),
        }
    }

    async fn handle_report(
        req: Request<Incoming>,
        processor: Arc<dyn ReportProcessor + Send + Sync>,
    ) -> http::Result<HttpResponse> {
        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            MAX_REPORT_CONTENT_LENGTH,
            "Error processing report",
        ) {
            return response;
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading report body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let message = match ReportMessage::decode(&body_bytes) {
            Ok(message) => message,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error decoding report: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        match message.command {
            Command::RecordTree => match message.decode_tree() {
                Ok(tree) => {
                    processor.record_tree(tree).await;
                    log_and_create_http_response("Recorded tree", StatusCode::OK)
                }
                Err(e) => log_and_create_http_response(
                    &format!("Error decoding tree payload: {e}"),
                    StatusCode::BAD_REQUEST,
                ),
            },
            Command::DeliverPeriod => match message.decode_period() {
                Ok(period) => {
                    processor.deliver_period(period).await;
                    log_and_create_http_response("Absorbed period", StatusCode::OK)
                }
                Err(e) => log_and_create_http_response(
                    &format!("Error decoding period payload: {e}"),
                    StatusCode::BAD_REQUEST,
                ),
            },
        }
    }
}
