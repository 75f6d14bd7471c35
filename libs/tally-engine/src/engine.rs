use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{ActiveDate, ArchivePipeline, ArchiveStatus};
use crate::buffer::{CacheStats, FlushReport, WriteBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::TallyConfig;
use crate::error::EngineError;
use crate::fsutil::{self, DirEntryInfo};
use crate::guard::{AccessDecision, AccessGuard, HeaderSource};
use crate::scheduler::FlushScheduler;

/// The running statistics engine: buffer, scheduler, archiver and guard.
pub struct Engine {
    config: TallyConfig,
    buffer: Arc<WriteBuffer>,
    scheduler: Arc<FlushScheduler>,
    guard: Arc<AccessGuard>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("file_dir", &self.config.storage.file_dir)
            .field("active_date", &self.scheduler.active_date())
            .field("buffered_keys", &self.buffer.len())
            .finish()
    }
}

impl Engine {
    pub fn new(config: TallyConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the engine around an explicit clock. Background tasks are not
    /// running until [`Engine::start`].
    pub fn with_clock(config: TallyConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        config.validate()?;
        let file_dir = config.storage.file_dir.clone();
        fs::create_dir_all(&file_dir)
            .map_err(|e| EngineError::from(e).with_context(file_dir.display()))?;

        let buffer = Arc::new(WriteBuffer::new(
            &file_dir,
            config.cache.max_size,
            config.cache.eviction_fraction,
        ));
        let archiver = Arc::new(ArchivePipeline::new(&file_dir, ActiveDate::new("")));
        let scheduler = Arc::new(FlushScheduler::new(
            buffer.clone(),
            archiver,
            clock,
            &config,
        ));
        let guard = Arc::new(AccessGuard::new(&config.access));

        tracing::info!(
            file_dir = %file_dir.display(),
            active = %scheduler.active_date(),
            "engine created"
        );
        Ok(Self {
            config,
            buffer,
            scheduler,
            guard,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn file_dir(&self) -> &Path {
        &self.config.storage.file_dir
    }

    // ═══════════════════════════════════════════════════════════════
    //  Lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Spawn the flush scheduler and the allowlist poller on the current
    /// tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("engine already started");
            return;
        }
        tasks.push(tokio::spawn(
            self.scheduler.clone().run(self.shutdown.child_token()),
        ));
        if self.guard.is_enabled() {
            tasks.push(tokio::spawn(
                self.guard.clone().run_poller(self.shutdown.child_token()),
            ));
        }
        tracing::info!(tasks = tasks.len(), "engine started");
    }

    /// Stop background tasks. The scheduler runs its final drain before
    /// this returns.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
        tracing::info!("engine shut down");
    }

    // ═══════════════════════════════════════════════════════════════
    //  Operations
    // ═══════════════════════════════════════════════════════════════

    pub fn append(&self, date: &str, name: &str, value: &str) -> Result<(), EngineError> {
        self.buffer.append(date, name, value)
    }

    /// Append under the active date label.
    pub fn log(&self, name: &str, value: &str) -> Result<(), EngineError> {
        self.buffer.append(&self.scheduler.active_date(), name, value)
    }

    /// Drain and persist everything now. Returns the number of entries
    /// written.
    pub fn flush(&self) -> usize {
        self.flush_report().flushed
    }

    pub fn flush_report(&self) -> FlushReport {
        let report = self.buffer.flush_all();
        tracing::info!(
            flushed = report.flushed,
            failed = report.failed,
            bytes = report.bytes,
            "manual flush"
        );
        report
    }

    /// Archive a day directory. Blocking.
    pub fn archive(&self, label: &str) -> ArchiveStatus {
        self.scheduler.archive(label)
    }

    pub fn list_directory(&self, relative: &str) -> Result<Vec<DirEntryInfo>, EngineError> {
        fsutil::list_directory(self.file_dir(), relative)
    }

    /// Resolve a stored, non-hidden file below the storage directory.
    pub fn resolve_file(&self, relative: &str) -> Result<PathBuf, EngineError> {
        let path = fsutil::resolve_under(self.file_dir(), relative)?;
        match fs::metadata(&path) {
            Ok(m) if m.is_file() && !fsutil::is_hidden(&path, &m) => Ok(path),
            _ => Err(EngineError::NotFound(relative.to_string())),
        }
    }

    pub fn check_ip(&self, headers: &(impl HeaderSource + ?Sized), remote: &str) -> AccessDecision {
        self.guard.check_ip(headers, remote)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.buffer.stats()
    }

    pub fn active_date(&self) -> String {
        self.scheduler.active_date()
    }

    pub fn pending_archives(&self) -> Vec<String> {
        self.scheduler.pending_archives()
    }

    pub fn scheduler(&self) -> &Arc<FlushScheduler> {
        &self.scheduler
    }

    pub fn guard(&self) -> &Arc<AccessGuard> {
        &self.guard
    }
}
