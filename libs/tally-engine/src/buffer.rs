//! In-memory write buffer: one text accumulator per (date, name).
//!
//! Appends only touch memory. Persisting happens through [`Drain`],
//! which takes the accumulated text out of the live map, appends it to
//! `<file_dir>/<date>/<name>.csv`, and puts anything that failed to
//! write back in front of whatever was appended in the meantime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::fsutil;

/// Record terminator in the per-key files.
pub const LINE_TERMINATOR: &str = "\r\n";

/// (date label, metric name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey {
    pub date: String,
    pub name: String,
}

impl BufferKey {
    pub fn new(date: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.date, self.name)
    }
}

struct BufferEntry {
    text: String,
    path: PathBuf,
    /// Creation order, used to pick eviction victims.
    seq: u64,
}

/// Text captured from one entry by a drain.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: BufferKey,
    pub path: PathBuf,
    pub text: String,
    seq: u64,
}

/// Outcome of a flush or eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries written to disk.
    pub flushed: usize,
    /// Entries put back for the next pass.
    pub failed: usize,
    pub bytes: u64,
}

/// Observability snapshot of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

// ═══════════════════════════════════════════════════════════════
//  WriteBuffer
// ═══════════════════════════════════════════════════════════════

pub struct WriteBuffer {
    file_dir: PathBuf,
    entries: DashMap<BufferKey, BufferEntry>,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    max_size: usize,
    eviction_fraction: f64,
    /// Held for the whole take → write → requeue cycle.
    drain_lock: Mutex<()>,
    /// Signalled when the live key count goes over `max_size`.
    pressure: Notify,
}

impl WriteBuffer {
    pub fn new(file_dir: impl Into<PathBuf>, max_size: usize, eviction_fraction: f64) -> Self {
        Self {
            file_dir: file_dir.into(),
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_size,
            eviction_fraction,
            drain_lock: Mutex::new(()),
            pressure: Notify::new(),
        }
    }

    pub fn file_dir(&self) -> &Path {
        &self.file_dir
    }

    /// Destination file for a key.
    pub fn path_for(&self, date: &str, name: &str) -> PathBuf {
        self.file_dir.join(date).join(format!("{name}.csv"))
    }

    /// Append one record. Never touches the disk.
    pub fn append(&self, date: &str, name: &str, value: &str) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::validation("name is empty"));
        }
        if value.is_empty() {
            return Err(EngineError::validation("value is empty"));
        }
        if value.contains(['\r', '\n']) {
            return Err(EngineError::validation("value contains a line break"));
        }
        fsutil::validate_segment(date, "date")?;
        fsutil::validate_segment(name, "name")?;

        match self.entries.entry(BufferKey::new(date, name)) {
            Entry::Occupied(mut e) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                push_record(&mut e.get_mut().text, value);
            }
            Entry::Vacant(v) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut text = String::with_capacity(value.len() + LINE_TERMINATOR.len());
                push_record(&mut text, value);
                v.insert(BufferEntry {
                    text,
                    path: self.path_for(date, name),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
            }
        }

        if self.entries.len() > self.max_size {
            self.pressure.notify_one();
        }
        Ok(())
    }

    /// Live key count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.entries.len() > self.max_size
    }

    /// Currently buffered text for a key.
    pub fn peek(&self, date: &str, name: &str) -> Option<String> {
        self.entries
            .get(&BufferKey::new(date, name))
            .map(|e| e.text.clone())
    }

    /// True while any key for `date` is still buffered, including text
    /// requeued after a failed write. Waits for an in-flight drain so
    /// text taken but not yet written is not missed.
    pub fn holds_date(&self, date: &str) -> bool {
        let _guard = self.drain_lock.lock();
        self.entries.iter().any(|e| e.key().date == date)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.entries.len(),
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Resolves once an append has pushed the buffer over `max_size`.
    pub async fn over_capacity(&self) {
        self.pressure.notified().await;
    }

    // ── Drain ──

    /// Take every live entry. Blocks while another drain is in flight.
    ///
    /// Appends arriving after an entry was taken start a fresh
    /// accumulator for that key.
    pub fn drain_all(&self) -> Drain<'_> {
        let guard = self.drain_lock.lock();
        let keys: Vec<BufferKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let snapshots = self.take(keys);
        Drain {
            buffer: self,
            snapshots,
            _guard: guard,
        }
    }

    /// Drain and persist everything.
    pub fn flush_all(&self) -> FlushReport {
        self.drain_all().persist()
    }

    /// Size-bound eviction: persist the oldest `fraction` of keys when the
    /// buffer is over `max_size`. Returns `None` when under the bound or
    /// when a drain is already running (that drain covers it).
    pub fn evict(&self) -> Option<FlushReport> {
        if !self.is_over_capacity() {
            return None;
        }
        let guard = self.drain_lock.try_lock()?;

        let mut candidates: Vec<(u64, BufferKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        candidates.sort_unstable();
        let count = eviction_count(candidates.len(), self.eviction_fraction);
        let keys = candidates.into_iter().take(count).map(|(_, k)| k).collect();

        let drain = Drain {
            buffer: self,
            snapshots: self.take(keys),
            _guard: guard,
        };
        let report = drain.persist();
        tracing::info!(
            flushed = report.flushed,
            failed = report.failed,
            remaining = self.len(),
            "size-bound eviction"
        );
        Some(report)
    }

    fn take(&self, keys: Vec<BufferKey>) -> Vec<Snapshot> {
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|(key, entry)| Snapshot {
                key,
                path: entry.path,
                text: entry.text,
                seq: entry.seq,
            })
            .collect()
    }

    /// Put a snapshot that failed to persist back in front of anything
    /// appended to the same key since it was taken.
    fn requeue(&self, snapshot: Snapshot) {
        match self.entries.entry(snapshot.key) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.text.insert_str(0, &snapshot.text);
                entry.seq = entry.seq.min(snapshot.seq);
            }
            Entry::Vacant(v) => {
                v.insert(BufferEntry {
                    text: snapshot.text,
                    path: snapshot.path,
                    seq: snapshot.seq,
                });
            }
        }
    }
}

fn push_record(text: &mut String, value: &str) {
    text.push_str(value);
    text.push_str(LINE_TERMINATOR);
}

fn eviction_count(len: usize, fraction: f64) -> usize {
    ((len as f64 * fraction).ceil() as usize).clamp(1, len.max(1))
}

// ═══════════════════════════════════════════════════════════════
//  Drain
// ═══════════════════════════════════════════════════════════════

/// Snapshots taken out of the buffer, holding the drain lock until they
/// are persisted. Dropping a `Drain` without persisting puts everything
/// back.
pub struct Drain<'a> {
    buffer: &'a WriteBuffer,
    snapshots: Vec<Snapshot>,
    _guard: MutexGuard<'a, ()>,
}

impl Drain<'_> {
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Append each snapshot to its file; failed ones go back to the buffer.
    pub fn persist(mut self) -> FlushReport {
        let mut report = FlushReport::default();
        for snapshot in std::mem::take(&mut self.snapshots) {
            match fsutil::append_text(&snapshot.path, &snapshot.text) {
                Ok(()) => {
                    report.flushed += 1;
                    report.bytes += snapshot.text.len() as u64;
                    tracing::debug!(key = %snapshot.key, bytes = snapshot.text.len(), "flushed");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        key = %snapshot.key,
                        path = %snapshot.path.display(),
                        error = %e,
                        "write failed, requeued for next flush"
                    );
                    self.buffer.requeue(snapshot);
                }
            }
        }
        report
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        for snapshot in std::mem::take(&mut self.snapshots) {
            self.buffer.requeue(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn buffer(dir: &TempDir) -> WriteBuffer {
        WriteBuffer::new(dir.path(), 1_000, 0.25)
    }

    #[test]
    fn append_then_flush_writes_crlf_lines() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        buf.append("20240101", "metricA", "v1").unwrap();
        buf.append("20240101", "metricA", "v2").unwrap();

        let report = buf.flush_all();
        assert_eq!(report.flushed, 1);
        assert_eq!(report.failed, 0);
        assert!(buf.is_empty());

        let content = fs::read_to_string(dir.path().join("20240101/metricA.csv")).unwrap();
        assert_eq!(content, "v1\r\nv2\r\n");
    }

    #[test]
    fn interleaved_flushes_keep_order() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        buf.append("d", "m", "1").unwrap();
        buf.flush_all();
        buf.append("d", "m", "2").unwrap();
        buf.append("d", "m", "3").unwrap();
        buf.flush_all();
        buf.flush_all();
        buf.append("d", "m", "4").unwrap();
        buf.flush_all();

        let content = fs::read_to_string(dir.path().join("d/m.csv")).unwrap();
        assert_eq!(content, "1\r\n2\r\n3\r\n4\r\n");
    }

    #[test]
    fn rejects_empty_and_unsafe_input() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        assert!(buf.append("20240101", "", "v").unwrap_err().is_validation());
        assert!(buf.append("20240101", "m", "").unwrap_err().is_validation());
        assert!(buf.append("20240101", "../m", "v").unwrap_err().is_validation());
        assert!(buf.append("..", "m", "v").unwrap_err().is_validation());
        assert!(buf.append("d", "m", "a\r\nb").unwrap_err().is_validation());
        assert!(buf.append("d", "m", "a\nb").unwrap_err().is_validation());
        assert!(buf.is_empty());
        assert_eq!(buf.stats().misses, 0);
    }

    #[test]
    fn failed_write_is_requeued_before_newer_data() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        let target = dir.path().join("20240103/m1.csv");
        // A directory where the file should be makes the append fail.
        fs::create_dir_all(&target).unwrap();

        buf.append("20240103", "m1", "x").unwrap();
        let report = buf.flush_all();
        assert_eq!(report.failed, 1);
        assert_eq!(buf.peek("20240103", "m1").as_deref(), Some("x\r\n"));

        buf.append("20240103", "m1", "y").unwrap();
        fs::remove_dir(&target).unwrap();
        let report = buf.flush_all();
        assert_eq!(report.flushed, 1);

        assert_eq!(fs::read_to_string(&target).unwrap(), "x\r\ny\r\n");
    }

    #[test]
    fn holds_date_sees_requeued_text() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        assert!(!buf.holds_date("20240101"));

        buf.append("20240101", "m", "v").unwrap();
        buf.append("20240102", "m", "v").unwrap();
        assert!(buf.holds_date("20240101"));

        fs::create_dir_all(dir.path().join("20240101/m.csv")).unwrap();
        buf.flush_all();
        assert!(buf.holds_date("20240101"));
        assert!(!buf.holds_date("20240102"));
    }

    #[test]
    fn dropped_drain_puts_data_back() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        buf.append("d", "m", "a").unwrap();
        {
            let drain = buf.drain_all();
            assert_eq!(drain.snapshots().len(), 1);
            assert!(buf.is_empty());
        }
        assert_eq!(buf.peek("d", "m").as_deref(), Some("a\r\n"));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let buf = buffer(&dir);
        assert_eq!(buf.stats().hit_ratio, 0.0);

        buf.append("d", "a", "1").unwrap();
        buf.append("d", "a", "2").unwrap();
        buf.append("d", "a", "3").unwrap();
        buf.append("d", "b", "1").unwrap();

        let stats = buf.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn eviction_takes_oldest_keys_first() {
        let dir = TempDir::new().unwrap();
        let buf = WriteBuffer::new(dir.path(), 4, 0.25);
        for i in 0..4 {
            buf.append("d", &format!("m{i}"), "v").unwrap();
        }
        assert!(buf.evict().is_none());

        buf.append("d", "m4", "v").unwrap();
        assert!(buf.is_over_capacity());

        // ceil(5 * 0.25) = 2 oldest: m0, m1
        let report = buf.evict().unwrap();
        assert_eq!(report.flushed, 2);
        assert!(dir.path().join("d/m0.csv").exists());
        assert!(dir.path().join("d/m1.csv").exists());
        assert!(!dir.path().join("d/m2.csv").exists());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn evicted_key_reenters_as_newest() {
        let dir = TempDir::new().unwrap();
        let buf = WriteBuffer::new(dir.path(), 2, 0.1);
        buf.append("d", "a", "1").unwrap();
        buf.append("d", "b", "1").unwrap();
        buf.append("d", "c", "1").unwrap();
        buf.evict().unwrap(); // a
        buf.append("d", "a", "2").unwrap();
        buf.evict().unwrap(); // b, not a again

        assert!(buf.peek("d", "b").is_none());
        assert_eq!(buf.peek("d", "a").as_deref(), Some("2\r\n"));
    }

    #[test]
    fn eviction_count_bounds() {
        assert_eq!(eviction_count(0, 0.25), 1);
        assert_eq!(eviction_count(1, 0.25), 1);
        assert_eq!(eviction_count(8, 0.25), 2);
        assert_eq!(eviction_count(9, 0.25), 3);
        assert_eq!(eviction_count(4, 1.0), 4);
    }

    #[test]
    fn concurrent_appends_to_one_key_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let buf = Arc::new(buffer(&dir));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buf.append("d", "shared", &format!("{t}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(buf.len(), 1);
        buf.flush_all();

        let content = fs::read_to_string(dir.path().join("d/shared.csv")).unwrap();
        let lines: Vec<&str> = content.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 8 * 250);
        // Per-writer order is preserved.
        for t in 0..8 {
            let prefix = format!("{t}-");
            let seen: Vec<usize> = lines
                .iter()
                .filter_map(|l| l.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn concurrent_appends_with_flushes_in_between() {
        let dir = TempDir::new().unwrap();
        let buf = Arc::new(buffer(&dir));
        let writer = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    buf.append("d", "m", &i.to_string()).unwrap();
                }
            })
        };
        for _ in 0..50 {
            buf.flush_all();
        }
        writer.join().unwrap();
        buf.flush_all();

        let content = fs::read_to_string(dir.path().join("d/m.csv")).unwrap();
        let values: Vec<usize> = content
            .split_terminator("\r\n")
            .map(|l| l.parse().unwrap())
            .collect();
        assert_eq!(values, (0..2_000).collect::<Vec<_>>());
    }
}
