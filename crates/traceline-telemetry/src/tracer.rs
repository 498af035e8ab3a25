// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};
use ustr::{ustr, Ustr};

use crate::errors::TraceError;
use crate::layer::Layer;

/// Capability handed to instrumentation adapters: bracket arbitrary code with
/// start and stop calls. Implementations must treat unmatched stops as
/// harmless so a buggy adapter can never take the application down.
pub trait Instrument {
    fn start_layer(&mut self, kind: &str, name: &str);
    fn stop_layer(&mut self);
}

struct OpenFrame {
    kind: Ustr,
    name: Ustr,
    started: Instant,
    children: Vec<Layer>,
    annotations: HashMap<String, Value>,
}

/// Builds one layer tree per logical request. Owned by exactly one request
/// or worker at a time, never shared across threads.
///
/// The tracer measures durations on the monotonic clock; callers that need
/// wall-clock attribution get it when the finished tree reaches the
/// aggregation store.
#[derive(Default)]
pub struct RequestTracer {
    origin: Option<Instant>,
    stack: Vec<OpenFrame>,
    root: Option<Layer>,
    context: HashMap<String, Value>,
    ignoring: usize,
    // Stack depth at which each suppressed open happened, innermost last. A
    // suppressed stop is only consumed once the real stack is back at that
    // depth, so layers opened after an early un-ignore close first.
    suppressed: Vec<usize>,
}

impl RequestTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a layer as a child of whatever layer is currently open, or as
    /// the tree root when none is.
    pub fn start_layer(&mut self, kind: &str, name: &str) {
        if self.ignoring > 0 {
            self.suppressed.push(self.stack.len());
            return;
        }
        let now = Instant::now();
        if self.stack.is_empty() && self.root.is_some() {
            // A second root cannot attach anywhere; the finished tree that
            // was never collected is gone.
            warn!("start_layer after the trace completed, dropping the unfetched root");
            self.root = None;
            self.origin = None;
        }
        if self.origin.is_none() {
            self.origin = Some(now);
        }
        self.stack.push(OpenFrame {
            kind: ustr(kind),
            name: ustr(name),
            started: now,
            children: Vec::new(),
            annotations: HashMap::new(),
        });
    }

    /// Closes the most recently opened layer. A stop with nothing open is a
    /// logged no-op.
    pub fn stop_layer(&mut self) {
        if self.suppressed.last() == Some(&self.stack.len()) {
            self.suppressed.pop();
            return;
        }
        let Some(frame) = self.stack.pop() else {
            debug!("stop_layer called with no open layer, ignoring");
            return;
        };
        let duration = frame.started.elapsed();
        let start_offset = self
            .origin
            .map(|origin| frame.started.duration_since(origin))
            .unwrap_or(Duration::ZERO);
        let layer = Layer {
            kind: frame.kind,
            name: frame.name,
            start_offset,
            duration,
            children: frame.children,
            annotations: frame.annotations,
        };
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(layer),
            None => self.root = Some(layer),
        }
    }

    /// Runs `f` inside a layer, closing it when `f` returns or unwinds.
    pub fn instrument<F, R>(&mut self, kind: &str, name: &str, f: F) -> R
    where
        F: FnOnce(&mut RequestTracer) -> R,
    {
        self.start_layer(kind, name);
        let mut guard = StopGuard(self);
        let result = f(&mut *guard.0);
        drop(guard);
        result
    }

    /// Attaches a key/value detail to the currently open layer, replacing
    /// any previous value for the key.
    pub fn annotate_layer(&mut self, key: &str, value: Value) {
        match self.stack.last_mut() {
            Some(frame) => {
                frame.annotations.insert(key.to_string(), value);
            }
            None => debug!("annotate_layer with no open layer, ignoring"),
        }
    }

    /// Attaches request-level context, delivered on the root when the trace
    /// finishes. Layer annotations with the same key win.
    pub fn annotate(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value);
    }

    /// Suppresses child layers until the matching stop. Used around code
    /// that is already measured by an enclosing layer, like a database
    /// driver invoked through an instrumented ORM call.
    pub fn start_ignoring_children(&mut self) {
        self.ignoring += 1;
    }

    pub fn stop_ignoring_children(&mut self) {
        self.ignoring = self.ignoring.saturating_sub(1);
    }

    pub fn is_tracing(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Ends the trace. Returns the completed root when every start had its
    /// stop; an unbalanced trace is logged, discarded, and the tracer reset
    /// for the next request either way.
    pub fn finish(&mut self) -> Option<Layer> {
        if !self.stack.is_empty() {
            let err = TraceError::Unbalanced {
                open: self.stack.len(),
            };
            warn!("discarding trace: {err}");
            self.reset();
            return None;
        }
        let mut root = self.root.take();
        if let Some(root) = root.as_mut() {
            for (key, value) in self.context.drain() {
                root.annotations.entry(key).or_insert(value);
            }
        }
        self.reset();
        root
    }

    fn reset(&mut self) {
        self.origin = None;
        self.stack.clear();
        self.root = None;
        self.context.clear();
        self.ignoring = 0;
        self.suppressed.clear();
    }
}

impl Instrument for RequestTracer {
    fn start_layer(&mut self, kind: &str, name: &str) {
        RequestTracer::start_layer(self, kind, name);
    }

    fn stop_layer(&mut self) {
        RequestTracer::stop_layer(self);
    }
}

struct StopGuard<'a>(&'a mut RequestTracer);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.stop_layer();
    }
}
