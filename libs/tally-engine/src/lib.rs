pub mod archive;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod guard;
pub mod scheduler;

pub use archive::{ActiveDate, ArchivePipeline, ArchiveStatus};
pub use buffer::{BufferKey, CacheStats, FlushReport, WriteBuffer};
pub use clock::{Clock, MockClock, SystemClock, date_label};
pub use config::TallyConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use fsutil::DirEntryInfo;
pub use guard::{AccessDecision, AccessGuard, AllowedIpSnapshot, DenyPayload, HeaderSource};
pub use scheduler::FlushScheduler;
