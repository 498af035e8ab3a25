// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ustr::{ustr, Ustr};

use crate::layer::Layer;
use crate::metric::{MetricIdentity, MetricPayload, MetricStats};
use crate::util::unix_now;

/// Most distinct identities one period will hold. Past this the period stops
/// growing and counts the overflow instead, which keeps a pathological
/// cardinality explosion from eating the host's memory.
pub const MAX_METRICS_PER_PERIOD: usize = 1_000;

pub const DEFAULT_PERIOD_LENGTH: Duration = Duration::from_secs(60);

/// Per-kind rollup name, so `SQL/all` aggregates every query under a scope.
const ROLLUP_NAME: &str = "all";

/// One wall-clock window of aggregated metrics, keyed by identity.
#[derive(Clone, Debug)]
pub struct ReportingPeriod {
    period_start: u64,
    period_length: Duration,
    metrics: FnvHashMap<MetricIdentity, MetricStats>,
    dropped: u64,
}

impl ReportingPeriod {
    pub fn new(period_start: u64, period_length: Duration) -> Self {
        Self {
            period_start,
            period_length,
            metrics: FnvHashMap::default(),
            dropped: 0,
        }
    }

    /// The period containing `now_unix`, aligned to period-length boundaries
    /// so every process agrees on window edges.
    pub fn aligned(now_unix: u64, period_length: Duration) -> Self {
        let len = period_length.as_secs().max(1);
        Self::new(now_unix - (now_unix % len), period_length)
    }

    pub fn period_start(&self) -> u64 {
        self.period_start
    }

    pub fn period_length(&self) -> Duration {
        self.period_length
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Identities that arrived after the period hit its cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn get(&self, identity: &MetricIdentity) -> Option<&MetricStats> {
        self.metrics.get(identity)
    }

    /// True once `now_unix` has moved past this period's window.
    pub fn expired(&self, now_unix: u64) -> bool {
        now_unix >= self.period_start + self.period_length.as_secs().max(1)
    }

    pub fn observe(&mut self, identity: MetricIdentity, seconds: f64) {
        if let Some(stats) = self.metrics.get_mut(&identity) {
            stats.observe(seconds);
            return;
        }
        if self.metrics.len() >= MAX_METRICS_PER_PERIOD {
            self.dropped += 1;
            return;
        }
        let mut stats = MetricStats::default();
        stats.observe(seconds);
        self.metrics.insert(identity, stats);
    }

    /// Folds another period's metrics into this one. Identity overlap merges
    /// statistically; the cap still applies to identities new to `self`.
    pub fn merge(&mut self, other: ReportingPeriod) {
        for (identity, stats) in other.metrics {
            if let Some(existing) = self.metrics.get_mut(&identity) {
                existing.merge(&stats);
            } else if self.metrics.len() < MAX_METRICS_PER_PERIOD {
                self.metrics.insert(identity, stats);
            } else {
                self.dropped += 1;
            }
        }
        self.dropped += other.dropped;
    }

    pub fn to_payload(&self) -> PeriodPayload {
        let mut metrics: Vec<MetricPayload> = self
            .metrics
            .iter()
            .map(|(identity, stats)| MetricPayload::new(identity, stats))
            .collect();
        metrics.sort_by(|a, b| {
            (&a.kind, &a.name, &a.scope).cmp(&(&b.kind, &b.name, &b.scope))
        });
        PeriodPayload {
            period_start: self.period_start,
            period_length: self.period_length,
            metrics,
            dropped: self.dropped,
        }
    }

    pub fn from_payload(payload: PeriodPayload) -> Self {
        let mut period = ReportingPeriod::new(payload.period_start, payload.period_length);
        for metric in &payload.metrics {
            let identity = metric.identity();
            let stats = metric.stats();
            if let Some(existing) = period.metrics.get_mut(&identity) {
                existing.merge(&stats);
            } else if period.metrics.len() < MAX_METRICS_PER_PERIOD {
                period.metrics.insert(identity, stats);
            } else {
                period.dropped += 1;
            }
        }
        period.dropped += payload.dropped;
        period
    }
}

/// Wire form of a reporting period. Metrics are sorted by identity so equal
/// periods serialize to identical bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodPayload {
    pub period_start: u64,
    pub period_length: Duration,
    #[serde(default)]
    pub metrics: Vec<MetricPayload>,
    #[serde(default)]
    pub dropped: u64,
}

/// Aggregates finished layer trees into reporting periods. One store per
/// agent, shared behind a mutex; every public operation takes one short
/// critical section and never blocks on io.
#[derive(Debug)]
pub struct AggregationStore {
    period_length: Duration,
    current: ReportingPeriod,
    ready: FnvHashMap<u64, ReportingPeriod>,
}

impl AggregationStore {
    pub fn new(period_length: Duration) -> Self {
        Self {
            period_length,
            current: ReportingPeriod::aligned(unix_now(), period_length),
            ready: FnvHashMap::default(),
        }
    }

    pub fn period_length(&self) -> Duration {
        self.period_length
    }

    /// Flattens a finished tree into the current period: the root becomes an
    /// unscoped metric, every descendant a scoped one, plus a per-kind
    /// rollup under the same scope. Scoped totals let self time be derived
    /// against the root later without shipping the tree itself.
    pub fn record(&mut self, tree: &Layer) {
        self.record_at(unix_now(), tree);
    }

    fn record_at(&mut self, now_unix: u64, tree: &Layer) {
        self.rotate_if_needed(now_unix);
        let scope = scope_label(tree);
        self.current.observe(
            MetricIdentity {
                kind: tree.kind,
                name: tree.name,
                scope: None,
            },
            tree.duration.as_secs_f64(),
        );
        let rollup = ustr(ROLLUP_NAME);
        for child in &tree.children {
            child.walk(&mut |layer| {
                let seconds = layer.duration.as_secs_f64();
                self.current.observe(
                    MetricIdentity {
                        kind: layer.kind,
                        name: layer.name,
                        scope: Some(scope),
                    },
                    seconds,
                );
                self.current.observe(
                    MetricIdentity {
                        kind: layer.kind,
                        name: rollup,
                        scope: Some(scope),
                    },
                    seconds,
                );
            });
        }
    }

    /// Records a single standalone observation, for instruments that measure
    /// something directly instead of through a layer tree.
    pub fn track_one(&mut self, kind: &str, name: &str, seconds: f64) {
        self.track_one_at(unix_now(), kind, name, seconds);
    }

    fn track_one_at(&mut self, now_unix: u64, kind: &str, name: &str, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            debug!("ignoring non-finite or negative observation for {kind}/{name}");
            return;
        }
        self.rotate_if_needed(now_unix);
        self.current
            .observe(MetricIdentity::unscoped(kind, name), seconds);
    }

    /// Merges a period aggregated elsewhere, usually one relayed from
    /// another process. Same-window periods combine; anything else waits in
    /// the ready set for the next delivery pass.
    pub fn absorb_period(&mut self, period: ReportingPeriod) {
        self.absorb_period_at(unix_now(), period);
    }

    fn absorb_period_at(&mut self, now_unix: u64, period: ReportingPeriod) {
        self.rotate_if_needed(now_unix);
        if period.period_start() == self.current.period_start() {
            self.current.merge(period);
        } else {
            self.push_ready(period);
        }
    }

    /// The period observations are currently landing in. Rotates first, so
    /// the answer is never an expired window.
    pub fn current_period(&mut self) -> &ReportingPeriod {
        self.rotate_if_needed(unix_now());
        &self.current
    }

    /// Removes and returns every completed period, oldest first. The current
    /// period stays put until its window closes.
    pub fn drain_ready(&mut self) -> Vec<ReportingPeriod> {
        self.drain_ready_at(unix_now())
    }

    fn drain_ready_at(&mut self, now_unix: u64) -> Vec<ReportingPeriod> {
        self.rotate_if_needed(now_unix);
        let mut periods: Vec<ReportingPeriod> =
            self.ready.drain().map(|(_, period)| period).collect();
        periods.sort_by_key(ReportingPeriod::period_start);
        periods
    }

    /// Drains everything including the still-open current period. Shutdown
    /// path only; a fresh empty window takes the current period's place.
    pub fn drain_all(&mut self) -> Vec<ReportingPeriod> {
        let mut periods = self.drain_ready();
        if !self.current.is_empty() {
            let start = self.current.period_start();
            let closed = std::mem::replace(
                &mut self.current,
                ReportingPeriod::new(start, self.period_length),
            );
            periods.push(closed);
        }
        periods
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn rotate_if_needed(&mut self, now_unix: u64) {
        if !self.current.expired(now_unix) {
            return;
        }
        let next = ReportingPeriod::aligned(now_unix, self.period_length);
        let closed = std::mem::replace(&mut self.current, next);
        if closed.dropped() > 0 {
            warn!(
                "reporting period {} dropped {} metric identities over the cap",
                closed.period_start(),
                closed.dropped()
            );
        }
        if !closed.is_empty() {
            self.push_ready(closed);
        }
    }

    fn push_ready(&mut self, period: ReportingPeriod) {
        match self.ready.entry(period.period_start()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(period),
            Entry::Vacant(slot) => {
                slot.insert(period);
            }
        }
    }
}

fn scope_label(root: &Layer) -> Ustr {
    ustr(&format!("{}/{}", root.kind, root.name))
}

/// Locks the store, recovering the data from a poisoned mutex rather than
/// propagating another holder's panic into the caller.
pub fn lock_store(store: &Mutex<AggregationStore>) -> MutexGuard<'_, AggregationStore> {
    match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn layer(kind: &str, name: &str, start_ms: u64, duration_ms: u64) -> Layer {
        Layer {
            kind: ustr(kind),
            name: ustr(name),
            start_offset: Duration::from_millis(start_ms),
            duration: Duration::from_millis(duration_ms),
            children: Vec::new(),
            annotations: HashMap::new(),
        }
    }

    fn sample_tree() -> Layer {
        let mut root = layer("Controller", "users/show", 0, 100);
        root.children.push(layer("SQL", "User/find", 10, 20));
        root.children.push(layer("SQL", "Avatar/find", 35, 10));
        let mut view = layer("View", "users/show.html", 50, 40);
        view.children.push(layer("SQL", "Setting/find", 60, 5));
        root.children.push(view);
        root
    }

    fn stats(store: &AggregationStore, identity: &MetricIdentity) -> MetricStats {
        *store
            .current
            .get(identity)
            .unwrap_or_else(|| panic!("missing identity {identity}"))
    }

    #[test]
    fn test_record_flattens_whole_tree() {
        let mut store = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        store.record_at(NOW, &sample_tree());

        let scope = ustr("Controller/users/show");

        let root = stats(&store, &MetricIdentity::unscoped("Controller", "users/show"));
        assert_eq!(root.count, 1);
        assert!((root.sum - 0.1).abs() < 1e-9);

        // Descendants carry the root as scope, including grandchildren.
        let user_find = stats(&store, &MetricIdentity::scoped("SQL", "User/find", scope));
        assert_eq!(user_find.count, 1);
        let setting = stats(&store, &MetricIdentity::scoped("SQL", "Setting/find", scope));
        assert_eq!(setting.count, 1);

        // The rollup sums every SQL layer under the scope.
        let sql_all = stats(&store, &MetricIdentity::scoped("SQL", "all", scope));
        assert_eq!(sql_all.count, 3);
        assert!((sql_all.sum - 0.035).abs() < 1e-9);

        // Scoped totals plus the root total let self time fall out.
        let view_all = stats(&store, &MetricIdentity::scoped("View", "all", scope));
        let derived_self = root.sum - user_find.sum - view_all.sum
            - stats(&store, &MetricIdentity::scoped("SQL", "Avatar/find", scope)).sum;
        assert!((derived_self - 0.025).abs() < 1e-9);
    }

    #[test]
    fn test_repeat_requests_merge_into_one_identity() {
        let mut store = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        let tree = sample_tree();
        store.record_at(NOW, &tree);
        store.record_at(NOW + 1, &tree);

        let root = stats(&store, &MetricIdentity::unscoped("Controller", "users/show"));
        assert_eq!(root.count, 2);
        assert!((root.sum - 0.2).abs() < 1e-9);
        assert!(root.min <= root.mean() && root.mean() <= root.max);
    }

    #[test]
    fn test_rotation_moves_closed_period_to_ready() {
        let len = Duration::from_secs(60);
        let mut store = AggregationStore::new(len);
        let aligned = NOW - (NOW % 60);
        store.record_at(aligned + 59, &sample_tree());
        assert!(store.drain_ready_at(aligned + 59).is_empty());

        // Crossing the boundary closes the old window on the next touch.
        store.record_at(aligned + 60, &sample_tree());
        let drained = store.drain_ready_at(aligned + 61);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].period_start(), aligned);
        assert!(!drained[0].is_empty());

        // The straddling record landed in the new window, not the drained one.
        let root = stats(&store, &MetricIdentity::unscoped("Controller", "users/show"));
        assert_eq!(root.count, 1);
    }

    #[test]
    fn test_drain_ready_returns_oldest_first() {
        let len = Duration::from_secs(60);
        let mut store = AggregationStore::new(len);
        let aligned = NOW - (NOW % 60);
        store.record_at(aligned, &sample_tree());
        store.record_at(aligned + 60, &sample_tree());
        store.record_at(aligned + 120, &sample_tree());

        let drained = store.drain_ready_at(aligned + 180);
        let starts: Vec<u64> = drained.iter().map(ReportingPeriod::period_start).collect();
        assert_eq!(starts, vec![aligned, aligned + 60, aligned + 120]);
    }

    #[test]
    fn test_period_cap_counts_dropped_identities() {
        let mut period = ReportingPeriod::new(NOW, DEFAULT_PERIOD_LENGTH);
        for i in 0..MAX_METRICS_PER_PERIOD + 10 {
            period.observe(MetricIdentity::unscoped("Custom", &format!("metric-{i}")), 0.01);
        }
        assert_eq!(period.len(), MAX_METRICS_PER_PERIOD);
        assert_eq!(period.dropped(), 10);

        // Existing identities still aggregate once the cap is hit.
        period.observe(MetricIdentity::unscoped("Custom", "metric-0"), 0.01);
        assert_eq!(
            period.get(&MetricIdentity::unscoped("Custom", "metric-0")).map(|s| s.count),
            Some(2)
        );
    }

    #[test]
    fn test_absorb_period_merges_same_window() {
        let len = Duration::from_secs(60);
        let mut store = AggregationStore::new(len);
        let aligned = NOW - (NOW % 60);
        store.record_at(aligned + 5, &sample_tree());

        let mut remote = ReportingPeriod::aligned(aligned + 10, len);
        remote.observe(MetricIdentity::unscoped("Controller", "users/show"), 0.3);
        store.absorb_period_at(aligned + 11, remote);

        let root = stats(&store, &MetricIdentity::unscoped("Controller", "users/show"));
        assert_eq!(root.count, 2);
        assert!((root.sum - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_absorb_period_parks_other_windows() {
        let len = Duration::from_secs(60);
        let mut store = AggregationStore::new(len);
        let aligned = NOW - (NOW % 60);

        let mut old = ReportingPeriod::aligned(aligned - 60, len);
        old.observe(MetricIdentity::unscoped("Job", "Mailer"), 1.5);
        store.absorb_period_at(aligned + 1, old);

        let drained = store.drain_ready_at(aligned + 1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].period_start(), aligned - 60);
    }

    #[test]
    fn test_drain_all_includes_current_period() {
        let mut store = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        store.record(&sample_tree());

        let drained = store.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(store.current_period().is_empty());
    }

    #[test]
    fn test_track_one_rejects_garbage() {
        let mut store = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        store.track_one_at(NOW, "Custom", "latency", f64::NAN);
        store.track_one_at(NOW, "Custom", "latency", -1.0);
        store.track_one_at(NOW, "Custom", "latency", 0.25);

        let tracked = stats(&store, &MetricIdentity::unscoped("Custom", "latency"));
        assert_eq!(tracked.count, 1);
        assert!((tracked.sum - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_payload_round_trip_is_lossless() {
        let mut store = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        store.record_at(NOW, &sample_tree());
        store.record_at(NOW + 1, &sample_tree());

        let payload = store.current.to_payload();
        let bytes = serde_json::to_vec(&payload).unwrap();
        let decoded: PeriodPayload = serde_json::from_slice(&bytes).unwrap();
        let rebuilt = ReportingPeriod::from_payload(decoded);

        assert_eq!(rebuilt.len(), store.current.len());
        for (identity, stats) in &store.current.metrics {
            assert_eq!(rebuilt.get(identity), Some(stats));
        }
    }

    #[test]
    fn test_payload_bytes_are_deterministic() {
        let mut a = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        let mut b = AggregationStore::new(DEFAULT_PERIOD_LENGTH);
        a.record_at(NOW, &sample_tree());
        b.record_at(NOW, &sample_tree());

        let left = serde_json::to_vec(&a.current.to_payload()).unwrap();
        let right = serde_json::to_vec(&b.current.to_payload()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_concurrent_records_lose_nothing() {
        let store = Arc::new(Mutex::new(AggregationStore::new(DEFAULT_PERIOD_LENGTH)));
        let threads = 8;
        let per_thread = 125;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        let tree = layer("Controller", "users/show", 0, 5);
                        lock_store(&store).record_at(NOW, &tree);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut guard = lock_store(&store);
        let root = guard
            .current_period()
            .get(&MetricIdentity::unscoped("Controller", "users/show"))
            .copied()
            .unwrap();
        assert_eq!(root.count, (threads * per_thread) as u64);
        assert!((root.sum - 0.005 * (threads * per_thread) as f64).abs() < 1e-6);
    }
}
