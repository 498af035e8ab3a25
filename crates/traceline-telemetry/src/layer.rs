// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ustr::{ustr, Ustr};

/// One completed span of work inside a request: a database call, a template
/// render, a controller action.
///
/// `start_offset` is measured from the instant the tree's root opened, so
/// sibling ordering survives serialization without carrying wall-clock
/// timestamps per node. Durations are non-negative by construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub kind: Ustr,
    pub name: Ustr,
    pub start_offset: Duration,
    pub duration: Duration,
    pub children: Vec<Layer>,
    pub annotations: HashMap<String, Value>,
}

impl Layer {
    pub fn stop_offset(&self) -> Duration {
        self.start_offset + self.duration
    }

    /// Total time spent in direct children.
    pub fn child_time(&self) -> Duration {
        self.children.iter().map(|c| c.duration).sum()
    }

    /// Time spent in this layer alone, with child time subtracted out.
    pub fn self_time(&self) -> Duration {
        self.duration.saturating_sub(self.child_time())
    }

    /// Depth-first walk over the whole tree, parents before children.
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(&Layer),
    {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }
}

/// Wire form of a layer tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerPayload {
    pub kind: String,
    pub name: String,
    pub start_offset: Duration,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LayerPayload>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, Value>,
}

impl From<&Layer> for LayerPayload {
    fn from(layer: &Layer) -> Self {
        Self {
            kind: layer.kind.to_string(),
            name: layer.name.to_string(),
            start_offset: layer.start_offset,
            duration: layer.duration,
            children: layer.children.iter().map(LayerPayload::from).collect(),
            annotations: layer.annotations.clone(),
        }
    }
}

impl From<LayerPayload> for Layer {
    fn from(payload: LayerPayload) -> Self {
        Self {
            kind: ustr(&payload.kind),
            name: ustr(&payload.name),
            start_offset: payload.start_offset,
            duration: payload.duration,
            children: payload.children.into_iter().map(Layer::from).collect(),
            annotations: payload.annotations,
        }
    }
}
