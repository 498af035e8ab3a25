// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregator::{PeriodPayload, ReportingPeriod};
use crate::errors::SpilloverError;
use crate::util::unix_now;

pub const DEFAULT_MAX_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Length prefix on every record: a little-endian u32 byte count.
const RECORD_PREFIX_LEN: usize = 4;

/// One parked reporting period awaiting redelivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpilloverEntry {
    pub seq: u64,
    pub attempts: u32,
    pub first_failure: u64,
    pub period: PeriodPayload,
}

#[derive(Clone, Debug)]
pub struct SpilloverConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_attempts: u32,
}

impl SpilloverConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Durable overflow for undelivered periods, stored as length-prefixed json
/// records in a single file.
///
/// There is exactly one writer per file: the delivery worker that owns this
/// handle. Acknowledge and attempt bookkeeping rewrite the whole file, which
/// stays cheap because the size cap bounds it.
pub struct SpilloverFile {
    config: SpilloverConfig,
    next_seq: u64,
}

impl SpilloverFile {
    /// Opens (or creates) the file at `config.path`. A torn write from an
    /// earlier crash leaves an unreadable tail; the readable prefix is kept
    /// and the tail truncated away.
    pub fn open(config: SpilloverConfig) -> Result<Self, SpilloverError> {
        let (entries, valid_len) = read_entries(&config.path)?;
        let disk_len = std::fs::metadata(&config.path).map(|m| m.len()).unwrap_or(0);
        if valid_len < disk_len {
            warn!(
                "spillover {}: {}, truncating {} trailing byte(s)",
                config.path.display(),
                SpilloverError::Corrupt { offset: valid_len },
                disk_len - valid_len
            );
            let file = OpenOptions::new().write(true).open(&config.path)?;
            file.set_len(valid_len)?;
        }
        let next_seq = entries.iter().map(|e| e.seq).max().map_or(0, |s| s + 1);
        Ok(Self { config, next_seq })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Appends a period as a fresh entry. When the file would exceed its
    /// size cap, the oldest entries are evicted first; an entry bigger than
    /// the whole cap is refused outright.
    pub fn append(&mut self, period: &ReportingPeriod) -> Result<(), SpilloverError> {
        let entry = SpilloverEntry {
            seq: self.next_seq,
            attempts: 0,
            first_failure: unix_now(),
            period: period.to_payload(),
        };
        let record = encode_record(&entry)?;
        let record_len = record.len() as u64;
        if record_len > self.config.max_bytes {
            return Err(SpilloverError::Oversize {
                size: record_len,
                capacity: self.config.max_bytes,
            });
        }

        let current_len = std::fs::metadata(&self.config.path).map(|m| m.len()).unwrap_or(0);
        if current_len + record_len > self.config.max_bytes {
            self.evict_for(record_len)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        file.write_all(&record)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Reads every parked entry without removing anything. Callers ship each
    /// entry's period and then either `acknowledge` or `record_attempt` it.
    pub fn drain(&self) -> Result<Vec<SpilloverEntry>, SpilloverError> {
        let (entries, _) = read_entries(&self.config.path)?;
        Ok(entries)
    }

    /// Removes a delivered (or abandoned) entry by sequence number.
    pub fn acknowledge(&mut self, seq: u64) -> Result<(), SpilloverError> {
        let (mut entries, _) = read_entries(&self.config.path)?;
        let before = entries.len();
        entries.retain(|e| e.seq != seq);
        if entries.len() == before {
            debug!("acknowledge for unknown spillover entry {seq}, ignoring");
            return Ok(());
        }
        self.rewrite(&entries)
    }

    /// Bumps the attempt counter on a still-undeliverable entry.
    pub fn record_attempt(&mut self, seq: u64) -> Result<(), SpilloverError> {
        let (mut entries, _) = read_entries(&self.config.path)?;
        let Some(entry) = entries.iter_mut().find(|e| e.seq == seq) else {
            debug!("attempt recorded for unknown spillover entry {seq}, ignoring");
            return Ok(());
        };
        entry.attempts += 1;
        self.rewrite(&entries)
    }

    fn evict_for(&mut self, needed: u64) -> Result<(), SpilloverError> {
        let (entries, _) = read_entries(&self.config.path)?;
        let mut records: VecDeque<(SpilloverEntry, Vec<u8>)> = VecDeque::with_capacity(entries.len());
        for entry in entries {
            let record = encode_record(&entry)?;
            records.push_back((entry, record));
        }
        let mut total: u64 = records.iter().map(|(_, r)| r.len() as u64).sum();

        let mut evicted = 0usize;
        while total + needed > self.config.max_bytes {
            let Some((entry, record)) = records.pop_front() else {
                break;
            };
            total -= record.len() as u64;
            evicted += 1;
            debug!(
                "evicting spillover entry {} for period {}",
                entry.seq, entry.period.period_start
            );
        }
        if evicted > 0 {
            warn!(
                "spillover at its {} byte cap, dropped {} oldest entr{}; data lost",
                self.config.max_bytes,
                evicted,
                if evicted == 1 { "y" } else { "ies" }
            );
        }

        let mut buf = Vec::with_capacity(total as usize);
        for (_, record) in &records {
            buf.extend_from_slice(record);
        }
        std::fs::write(&self.config.path, &buf)?;
        Ok(())
    }

    fn rewrite(&self, entries: &[SpilloverEntry]) -> Result<(), SpilloverError> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_record(entry)?);
        }
        std::fs::write(&self.config.path, &buf)?;
        Ok(())
    }
}

fn encode_record(entry: &SpilloverEntry) -> Result<Vec<u8>, SpilloverError> {
    let body = serde_json::to_vec(entry)?;
    let mut record = Vec::with_capacity(RECORD_PREFIX_LEN + body.len());
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Parses records up to the first unreadable byte. Returns the entries plus
/// the byte length of the valid prefix, so callers can truncate the rest.
fn read_entries(path: &Path) -> Result<(Vec<SpilloverEntry>, u64), SpilloverError> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(SpilloverError::Io(e)),
    };

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + RECORD_PREFIX_LEN <= buf.len() {
        let len = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        let body_start = offset + RECORD_PREFIX_LEN;
        let Some(body) = buf.get(body_start..body_start + len) else {
            break;
        };
        match serde_json::from_slice::<SpilloverEntry>(body) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset = body_start + len;
    }
    Ok((entries, offset as u64))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::metric::MetricIdentity;

    use super::*;

    fn sample_period(start: u64, seconds: f64) -> ReportingPeriod {
        let mut period = ReportingPeriod::new(start, Duration::from_secs(60));
        period.observe(MetricIdentity::unscoped("Controller", "users/show"), seconds);
        period
    }

    fn open_at(dir: &tempfile::TempDir, max_bytes: u64) -> SpilloverFile {
        let mut config = SpilloverConfig::new(dir.path().join("spillover.db"));
        config.max_bytes = max_bytes;
        SpilloverFile::open(config).unwrap()
    }

    #[test]
    fn test_append_then_drain_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut spillover = open_at(&dir, DEFAULT_MAX_BYTES);

        spillover.append(&sample_period(600, 0.25)).unwrap();
        spillover.append(&sample_period(660, 0.50)).unwrap();

        let entries = spillover.drain().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(entries[0].period.period_start, 600);
        assert_eq!(entries[0].attempts, 0);

        let rebuilt = ReportingPeriod::from_payload(entries[1].period.clone());
        let stats = rebuilt
            .get(&MetricIdentity::unscoped("Controller", "users/show"))
            .copied()
            .unwrap();
        assert!((stats.sum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spillover.db");

        {
            let mut spillover = SpilloverFile::open(SpilloverConfig::new(&path)).unwrap();
            spillover.append(&sample_period(600, 0.25)).unwrap();
        }

        let mut reopened = SpilloverFile::open(SpilloverConfig::new(&path)).unwrap();
        assert_eq!(reopened.drain().unwrap().len(), 1);

        // Sequence numbers keep counting up across restarts.
        reopened.append(&sample_period(660, 0.5)).unwrap();
        let entries = reopened.drain().unwrap();
        assert_eq!(entries[1].seq, 1);
    }

    #[test]
    fn test_acknowledge_removes_exactly_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut spillover = open_at(&dir, DEFAULT_MAX_BYTES);
        spillover.append(&sample_period(600, 0.25)).unwrap();
        spillover.append(&sample_period(660, 0.50)).unwrap();

        spillover.acknowledge(0).unwrap();
        let entries = spillover.drain().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);

        // Unknown sequence numbers are a no-op, not an error.
        spillover.acknowledge(99).unwrap();
        assert_eq!(spillover.drain().unwrap().len(), 1);
    }

    #[test]
    fn test_record_attempt_increments_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut spillover = open_at(&dir, DEFAULT_MAX_BYTES);
        spillover.append(&sample_period(600, 0.25)).unwrap();

        spillover.record_attempt(0).unwrap();
        spillover.record_attempt(0).unwrap();

        let entries = spillover.drain().unwrap();
        assert_eq!(entries[0].attempts, 2);
    }

    #[test]
    fn test_size_cap_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // Room for roughly two entries of this shape.
        let one_record = encode_record(&SpilloverEntry {
            seq: 0,
            attempts: 0,
            first_failure: 0,
            period: sample_period(600, 0.25).to_payload(),
        })
        .unwrap();
        let mut spillover = open_at(&dir, (one_record.len() as u64) * 2 + 8);

        spillover.append(&sample_period(600, 0.25)).unwrap();
        spillover.append(&sample_period(660, 0.25)).unwrap();
        spillover.append(&sample_period(720, 0.25)).unwrap();

        let entries = spillover.drain().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].period.period_start, 660);
        assert_eq!(entries[1].period.period_start, 720);
    }

    #[test]
    fn test_oversize_entry_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut spillover = open_at(&dir, 16);
        let err = spillover.append(&sample_period(600, 0.25)).unwrap_err();
        assert!(matches!(err, SpilloverError::Oversize { .. }));
        assert!(spillover.drain().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spillover.db");

        {
            let mut spillover = SpilloverFile::open(SpilloverConfig::new(&path)).unwrap();
            spillover.append(&sample_period(600, 0.25)).unwrap();
        }
        // Simulate a torn append: a length prefix promising more bytes than
        // the file holds.
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[200, 0, 0, 0, b'{', b'x']).unwrap();
        }

        let before = std::fs::metadata(&path).unwrap().len();
        let spillover = SpilloverFile::open(SpilloverConfig::new(&path)).unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);
        assert_eq!(spillover.drain().unwrap().len(), 1);
    }
}
