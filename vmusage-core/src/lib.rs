//! vmusage core library
//!
//! Per-VM usage telemetry for virtualization hosts: a drift-free scheduler,
//! the usage cycle with its per-VM cache, durable hourly NDJSON logs and
//! crash-safe gzip compaction of closed hours.

pub mod bucket;
pub mod compactor;
pub mod config;
pub mod error;
mod gate;
pub mod host;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod reader;
pub mod record;
pub mod scheduler;
pub mod writer;

// Re-export commonly used items
pub use bucket::{hour_bucket, HourBucket};
pub use compactor::{compact_pass, CompactionReport, CompactionService};
pub use config::Config;
pub use error::{FatalSignal, Result, UsageError};
pub use observability::init as init_observability;
pub use orchestrator::UsageService;
pub use record::{HostIdentity, Summary, UsageRecord, VmUsage};
pub use scheduler::{ScheduledTask, Scheduler, TickPlan, TimeMatch, Trigger};
pub use writer::UsageFileWriter;
