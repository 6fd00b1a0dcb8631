//! Remote API plumbing and job-state persistence for rowsync.

pub mod client;
pub mod pagination;
pub mod paths;
pub mod state;

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use client::{
    parse_retry_after, with_retry, ApiClient, ApiClientConfig, ApiError, ApiProblem,
    RateLimitState, RetryPolicy,
};
pub use pagination::{EndpointPages, Page, PageFetcher, PageStyle, Paginator, DEFAULT_MAX_PAGES};
pub use paths::{with_query, with_segments};
pub use state::{
    load_typed, save_typed, FileStateStore, MemoryStateStore, PgStateStore, StateStore,
    StateStoreError,
};

pub const CRATE_NAME: &str = "rowsync-storage";

/// Single-slot key holding the active batch job.
pub const JOB_SLOT_KEY: &str = "rowsync:active-job";
/// Prefix of the key/id cache a job builds on its first chunk.
pub const JOB_CACHE_KEY: &str = "rowsync:active-job:key-cache";

/// Cache key owned by one job, so a cancelled job's cache is never read by the next.
pub fn job_cache_key(job_id: Uuid) -> String {
    format!("{JOB_CACHE_KEY}:{job_id}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
