//! Periodic flush, date rollover and archive dispatch.
//!
//! Each tick drains the write buffer to disk and then compares the
//! clock's date label with the active one. A changed label queues the
//! previous day for archival; an unchanged one hands due pending labels
//! to the archive pipeline on blocking workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::archive::{ActiveDate, ArchivePipeline, ArchiveStatus};
use crate::buffer::{FlushReport, WriteBuffer};
use crate::clock::{Clock, date_label};
use crate::config::TallyConfig;

/// Cap for the backoff exponent: the delay stops growing at 64x the base.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Retry bookkeeping for one pending label.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub failures: u32,
    next_attempt: Option<Instant>,
    in_flight: bool,
}

impl RetryState {
    fn is_due(&self, now: Instant) -> bool {
        !self.in_flight && self.next_attempt.is_none_or(|at| at <= now)
    }
}

pub struct FlushScheduler {
    buffer: Arc<WriteBuffer>,
    archiver: Arc<ArchivePipeline>,
    clock: Arc<dyn Clock>,
    date_format: String,
    active: ActiveDate,
    pending: Mutex<BTreeMap<String, RetryState>>,
    interval: Duration,
    shutdown_timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<WriteBuffer>,
        archiver: Arc<ArchivePipeline>,
        clock: Arc<dyn Clock>,
        config: &TallyConfig,
    ) -> Self {
        let active = archiver.active_date().clone();
        active.set(date_label(&clock.now(), &config.storage.date_format));
        Self {
            buffer,
            archiver,
            clock,
            date_format: config.storage.date_format.clone(),
            active,
            pending: Mutex::new(BTreeMap::new()),
            interval: config.cache.flush_interval(),
            shutdown_timeout: config.cache.shutdown_timeout(),
            max_attempts: config.archive.max_attempts,
            retry_backoff: config.archive.retry_backoff(),
        }
    }

    pub fn active_date(&self) -> String {
        self.active.get()
    }

    /// Labels waiting for archival, oldest first.
    pub fn pending_archives(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn retry_state(&self, label: &str) -> Option<RetryState> {
        self.pending.lock().get(label).cloned()
    }

    // ═══════════════════════════════════════════════════════════════
    //  Loop
    // ═══════════════════════════════════════════════════════════════

    /// Tick until `shutdown` fires, then run a bounded final drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            active = %self.active.get(),
            "flush scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.buffer.over_capacity() => {
                    self.evict().await;
                }
            }
        }

        self.final_drain().await;
        tracing::info!("flush scheduler stopped");
    }

    /// One tick: drain everything, then the rollover check. Returns the
    /// handles of archive tasks dispatched by this tick.
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let buffer = self.buffer.clone();
        match tokio::task::spawn_blocking(move || buffer.flush_all()).await {
            Ok(report) if report.flushed + report.failed > 0 => {
                tracing::debug!(
                    flushed = report.flushed,
                    failed = report.failed,
                    bytes = report.bytes,
                    "flush tick"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "flush task panicked"),
        }

        if self.check_rollover() {
            Vec::new()
        } else {
            self.dispatch_pending()
        }
    }

    /// Move to today's label if the date changed, queueing the previous
    /// one. Returns true on a transition.
    pub fn check_rollover(&self) -> bool {
        let today = date_label(&self.clock.now(), &self.date_format);
        let previous = self.active.get();
        if today == previous {
            return false;
        }

        {
            let mut pending = self.pending.lock();
            pending.entry(previous.clone()).or_default();
            pending.remove(&today);
        }
        self.active.set(today.clone());
        tracing::info!(from = %previous, to = %today, "date rollover");
        true
    }

    fn dispatch_pending(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let now = Instant::now();
        let due: Vec<String> = {
            let mut pending = self.pending.lock();
            pending
                .iter_mut()
                .filter(|(_, state)| state.is_due(now))
                .map(|(label, state)| {
                    state.in_flight = true;
                    label.clone()
                })
                .collect()
        };

        due.into_iter()
            .map(|label| {
                let this = Arc::clone(self);
                tokio::task::spawn_blocking(move || {
                    if this.buffer.holds_date(&label) {
                        this.defer(&label);
                        return;
                    }
                    let status = this.archiver.archive(&label);
                    this.settle(&label, status);
                })
            })
            .collect()
    }

    /// The day still has buffered text that must reach disk first. Not
    /// counted as a failure.
    fn defer(&self, label: &str) {
        if let Some(state) = self.pending.lock().get_mut(label) {
            state.in_flight = false;
        }
        tracing::debug!(label = %label, "day still buffered, archive deferred");
    }

    fn settle(&self, label: &str, status: ArchiveStatus) {
        let mut pending = self.pending.lock();
        let Some(state) = pending.get_mut(label) else {
            return;
        };
        state.in_flight = false;

        if status.is_settled() {
            pending.remove(label);
            return;
        }
        let ArchiveStatus::Failed(err) = status else {
            // In progress elsewhere or the label became active again.
            return;
        };

        state.failures += 1;
        let failures = state.failures;
        if self.max_attempts > 0 && failures >= self.max_attempts {
            pending.remove(label);
            tracing::error!(
                label = %label,
                failures,
                error = %err,
                "giving up on archive, day directory left in place"
            );
        } else {
            let delay = backoff_delay(self.retry_backoff, failures);
            state.next_attempt = Some(Instant::now() + delay);
            tracing::warn!(
                label = %label,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                "archive will be retried"
            );
        }
    }

    /// Archive on request. A label that ends up settled also leaves the
    /// pending set.
    pub fn archive(&self, label: &str) -> ArchiveStatus {
        let status = self.archiver.archive(label);
        if status.is_settled() {
            let mut pending = self.pending.lock();
            if pending.get(label).is_some_and(|s| !s.in_flight) {
                pending.remove(label);
            }
        }
        status
    }

    async fn evict(&self) {
        let buffer = self.buffer.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut total = FlushReport::default();
            while let Some(report) = buffer.evict() {
                total.flushed += report.flushed;
                total.failed += report.failed;
                total.bytes += report.bytes;
                if report.flushed == 0 {
                    break;
                }
            }
            total
        })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "eviction task panicked");
        }
    }

    async fn final_drain(&self) {
        let buffer = self.buffer.clone();
        let task = tokio::task::spawn_blocking(move || buffer.flush_all());
        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(report)) => tracing::info!(
                flushed = report.flushed,
                failed = report.failed,
                "final drain complete"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "final drain panicked"),
            Err(_) => tracing::warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "final drain timed out, buffered data may be lost"
            ),
        }
    }
}

/// `base * 2^min(failures - 1, 6)`.
pub fn backoff_delay(base: Duration, failures: u32) -> Duration {
    base * (1u32 << failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::{Local, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: std::path::PathBuf,
        clock: Arc<MockClock>,
        buffer: Arc<WriteBuffer>,
        scheduler: Arc<FlushScheduler>,
    }

    fn fixture(configure: impl FnOnce(&mut TallyConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = TallyConfig::default();
        config.storage.file_dir = dir.path().to_path_buf();
        configure(&mut config);

        let clock = Arc::new(MockClock::with_time(
            Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let buffer = Arc::new(WriteBuffer::new(
            dir.path(),
            config.cache.max_size,
            config.cache.eviction_fraction,
        ));
        let archiver = Arc::new(ArchivePipeline::new(dir.path(), ActiveDate::new("")));
        let scheduler = Arc::new(FlushScheduler::new(
            buffer.clone(),
            archiver,
            clock.clone(),
            &config,
        ));
        Fixture {
            root: dir.path().to_path_buf(),
            _dir: dir,
            clock,
            buffer,
            scheduler,
        }
    }

    async fn tick_and_wait(scheduler: &Arc<FlushScheduler>) {
        for handle in scheduler.tick().await {
            handle.await.unwrap();
        }
    }

    fn next_day(clock: &MockClock) {
        clock.advance(Duration::from_secs(24 * 3600));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 7), Duration::from_secs(64));
        assert_eq!(backoff_delay(base, 30), Duration::from_secs(64));
    }

    #[tokio::test]
    async fn starts_on_todays_label() {
        let f = fixture(|_| {});
        assert_eq!(f.scheduler.active_date(), "20240101");
        assert!(f.scheduler.pending_archives().is_empty());
    }

    #[tokio::test]
    async fn rollover_queues_previous_day_once() {
        let f = fixture(|_| {});
        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());

        next_day(&f.clock);
        assert!(f.scheduler.check_rollover());
        assert_eq!(f.scheduler.active_date(), "20240102");
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);

        assert!(!f.scheduler.check_rollover());
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);
    }

    #[tokio::test]
    async fn flush_runs_before_rollover() {
        let f = fixture(|_| {});
        f.buffer.append("20240101", "m", "late").unwrap();

        next_day(&f.clock);
        let dispatched = f.scheduler.tick().await;
        // Rollover tick only queues; archival starts on the following tick.
        assert!(dispatched.is_empty());
        assert_eq!(
            fs::read_to_string(f.root.join("20240101/m.csv")).unwrap(),
            "late\r\n"
        );

        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());
        assert!(f.root.join("20240101.zip").exists());
    }

    #[tokio::test]
    async fn missing_day_directory_is_dropped() {
        let f = fixture(|_| {});
        next_day(&f.clock);
        f.scheduler.tick().await;
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);

        // No day directory was ever written.
        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());
    }

    #[tokio::test]
    async fn failed_archive_backs_off() {
        let f = fixture(|c| {
            c.archive.retry_backoff_ms = 60_000;
            c.archive.max_attempts = 0;
        });
        f.buffer.append("20240101", "m", "v").unwrap();
        fs::create_dir_all(f.root.join("20240101.zip.tmp")).unwrap();

        next_day(&f.clock);
        f.scheduler.tick().await;
        tick_and_wait(&f.scheduler).await;

        let state = f.scheduler.retry_state("20240101").unwrap();
        assert_eq!(state.failures, 1);

        // Not due again for a minute.
        assert!(f.scheduler.tick().await.is_empty());
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let f = fixture(|c| {
            c.archive.retry_backoff_ms = 0;
            c.archive.max_attempts = 2;
        });
        f.buffer.append("20240101", "m", "v").unwrap();
        fs::create_dir_all(f.root.join("20240101.zip.tmp")).unwrap();

        next_day(&f.clock);
        f.scheduler.tick().await;
        tick_and_wait(&f.scheduler).await;
        assert_eq!(f.scheduler.retry_state("20240101").unwrap().failures, 1);

        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());
        // Day directory is left for a manual archive.
        assert!(f.root.join("20240101/m.csv").exists());
    }

    #[tokio::test]
    async fn retry_succeeds_once_the_fault_clears() {
        let f = fixture(|c| c.archive.retry_backoff_ms = 0);
        f.buffer.append("20240101", "m", "v").unwrap();
        let blocker = f.root.join("20240101.zip.tmp");
        fs::create_dir_all(&blocker).unwrap();

        next_day(&f.clock);
        f.scheduler.tick().await;
        tick_and_wait(&f.scheduler).await;
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);

        fs::remove_dir(&blocker).unwrap();
        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());
        assert!(f.root.join("20240101.zip").exists());
    }

    #[tokio::test]
    async fn archive_waits_for_requeued_writes() {
        let f = fixture(|_| {});
        f.buffer.append("20240101", "ok", "a").unwrap();
        f.buffer.append("20240101", "m", "late").unwrap();
        let blocker = f.root.join("20240101/m.csv");
        fs::create_dir_all(&blocker).unwrap();

        next_day(&f.clock);
        f.scheduler.tick().await;
        assert_eq!(f.buffer.peek("20240101", "m").as_deref(), Some("late\r\n"));

        tick_and_wait(&f.scheduler).await;
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);
        assert_eq!(f.scheduler.retry_state("20240101").unwrap().failures, 0);
        assert!(!f.root.join("20240101.zip").exists());

        fs::remove_dir(&blocker).unwrap();
        tick_and_wait(&f.scheduler).await;
        assert!(f.scheduler.pending_archives().is_empty());
        assert!(!f.buffer.holds_date("20240101"));

        let mut archive =
            zip::ZipArchive::new(fs::File::open(f.root.join("20240101.zip")).unwrap()).unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("20240101/m.csv").unwrap(),
            &mut content,
        )
        .unwrap();
        assert_eq!(content, "late\r\n");
    }

    #[tokio::test]
    async fn manual_archive_clears_pending() {
        let f = fixture(|_| {});
        f.buffer.append("20240101", "m", "v").unwrap();
        next_day(&f.clock);
        f.scheduler.tick().await;
        assert_eq!(f.scheduler.pending_archives(), ["20240101"]);

        assert!(f.scheduler.archive("20240101").is_success());
        assert!(f.scheduler.pending_archives().is_empty());
        assert_eq!(
            f.scheduler.archive("20240102"),
            ArchiveStatus::ActiveDate
        );
    }

    #[tokio::test]
    async fn run_drains_on_shutdown() {
        let f = fixture(|c| c.cache.flush_interval_ms = 3_600_000);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.scheduler.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.buffer.append("20240101", "m", "bye").unwrap();
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            fs::read_to_string(f.root.join("20240101/m.csv")).unwrap(),
            "bye\r\n"
        );
    }

    #[tokio::test]
    async fn run_evicts_when_over_capacity() {
        let f = fixture(|c| {
            c.cache.flush_interval_ms = 3_600_000;
            c.cache.max_size = 2;
            c.cache.eviction_fraction = 0.5;
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.scheduler.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for name in ["a", "b", "c"] {
            f.buffer.append("20240101", name, "v").unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.buffer.len() > 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.buffer.len() <= 2);
        assert!(f.root.join("20240101/a.csv").exists());

        shutdown.cancel();
        task.await.unwrap();
    }
}
