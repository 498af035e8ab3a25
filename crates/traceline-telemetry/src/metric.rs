// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use ustr::{ustr, Ustr};

/// Identifies one measured quantity: a layer kind, a name within that kind,
/// and an optional scope naming the request root the observation ran under.
///
/// Uses interned strings so identities are cheap to copy, hash, and compare
/// on the hot aggregation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricIdentity {
    pub kind: Ustr,
    pub name: Ustr,
    pub scope: Option<Ustr>,
}

impl MetricIdentity {
    pub fn unscoped(kind: &str, name: &str) -> Self {
        Self {
            kind: ustr(kind),
            name: ustr(name),
            scope: None,
        }
    }

    pub fn scoped(kind: &str, name: &str, scope: Ustr) -> Self {
        Self {
            kind: ustr(kind),
            name: ustr(name),
            scope: Some(scope),
        }
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Running summary of every observation recorded against one identity.
/// Observations are durations in seconds.
///
/// An empty summary holds zeroes everywhere; `min` and `max` only become
/// meaningful once `count` is nonzero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricStats {
    pub count: u64,
    pub sum: f64,
    pub sum_of_squares: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for MetricStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }
}

impl MetricStats {
    pub fn observe(&mut self, seconds: f64) {
        if self.count == 0 {
            self.min = seconds;
            self.max = seconds;
        } else {
            if seconds < self.min {
                self.min = seconds;
            }
            if seconds > self.max {
                self.max = seconds;
            }
        }
        self.count += 1;
        self.sum += seconds;
        self.sum_of_squares += seconds * seconds;
    }

    /// Folds `other` into `self`. An empty side contributes nothing, so the
    /// merged extremes always come from real observations.
    pub fn merge(&mut self, other: &MetricStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Wire form of one aggregated metric. Owned strings instead of interned
/// ones so the type round-trips through serde without touching the intern
/// table on the serialization path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub count: u64,
    pub sum: f64,
    pub sum_of_squares: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricPayload {
    pub fn new(identity: &MetricIdentity, stats: &MetricStats) -> Self {
        Self {
            kind: identity.kind.to_string(),
            name: identity.name.to_string(),
            scope: identity.scope.map(|s| s.to_string()),
            count: stats.count,
            sum: stats.sum,
            sum_of_squares: stats.sum_of_squares,
            min: stats.min,
            max: stats.max,
        }
    }

    pub fn identity(&self) -> MetricIdentity {
        MetricIdentity {
            kind: ustr(&self.kind),
            name: ustr(&self.name),
            scope: self.scope.as_deref().map(ustr),
        }
    }

    pub fn stats(&self) -> MetricStats {
        MetricStats {
            count: self.count,
            sum: self.sum,
            sum_of_squares: self.sum_of_squares,
            min: self.min,
            max: self.max,
        }
    }
}
