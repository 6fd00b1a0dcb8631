//! Reconciliation engine, batch scheduling and progress reporting for rowsync.

pub mod config;
pub mod driver;
pub mod export;
pub mod progress;
pub mod reconcile;
pub mod scheduler;

pub use config::{parse_delays_ms, SyncConfig, Thresholds, DEFAULT_BACKFILL_DELAYS_MS};
pub use driver::{build_cron_driver, drive_until_idle};
pub use export::{export_pages, ExportChunk, ExportOptions};
pub use progress::{
    percent_of, progress_channel, LogLevel, ProgressFrame, ProgressSender, DEFAULT_STREAM_CAPACITY,
};
pub use reconcile::{
    BackfillOutcome, KeyCache, ReconcileOptions, ReconcileReport, Reconciler,
};
pub use scheduler::{
    BatchScheduler, JobEstimate, JobRequest, NextJobOutcome, SchedulerError, SchedulerSettings,
    StartOutcome,
};

pub const CRATE_NAME: &str = "rowsync-sync";
