//! filegrid-core: shared types, configuration, and file-stats collaborators.
//!
//! Everything the scheduler consumes from the outside world lives here as a
//! narrow trait: [`FileStatsProvider`] answers "how big is this file, and is
//! its watch root still crawling?", [`ProjectConfigProvider`] answers "what
//! is the size limit for this path?".

pub mod config;
pub mod project;
pub mod stats;
pub mod types;

pub use config::{FilegridConfig, HealthSettings, SchedulerSettings};
pub use project::{ProjectConfigProvider, StaticProjectConfig};
pub use stats::{CrawledFileStats, FileStatsProvider, MemoryFileStats};
pub use types::*;
