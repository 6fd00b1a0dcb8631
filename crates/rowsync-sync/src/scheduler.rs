//! Chunked, resumable batch jobs over a single persisted job slot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rowsync_adapters::{
    read_headers, read_rows_from, strategy_for, CsvExportWriter, FieldMapping, InMemoryRemote,
    RemoteGateway, ResourceStrategy,
};
use rowsync_core::{
    ChunkRange, InputRow, Job, JobParams, JobType, MatchAction, PageCursor, ResourceType, RowError,
    RunStatus, SyncSummary,
};
use rowsync_storage::{
    job_cache_key, load_typed, save_typed, sha256_hex, StateStore, DEFAULT_MAX_PAGES, JOB_SLOT_KEY,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Thresholds;
use crate::export::{export_pages, ExportChunk, ExportOptions};
use crate::progress::ProgressSender;
use crate::reconcile::{KeyCache, ReconcileOptions, ReconcileReport, Reconciler};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no job is active")]
    NoActiveJob,
    #[error("job {0} is already active; cancel it or let it finish first")]
    JobAlreadyActive(Uuid),
    #[error("another chunk is already running")]
    Busy,
    #[error("{path} changed since job {job_id} was created")]
    InputChanged { path: PathBuf, job_id: Uuid },
    #[error("input needs {needed} chunks; at most {limit} are allowed")]
    TooManyChunks { needed: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub chunk_size: usize,
    pub max_chunks: usize,
    pub max_pages: usize,
    pub export_pages_per_chunk: usize,
    pub thresholds: Thresholds,
    pub reconcile: ReconcileOptions,
    pub relationship_concurrency: usize,
    pub relationship_pause: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_chunks: 500,
            max_pages: DEFAULT_MAX_PAGES,
            export_pages_per_chunk: 10,
            thresholds: Thresholds::default(),
            reconcile: ReconcileOptions::default(),
            relationship_concurrency: 5,
            relationship_pause: Duration::from_millis(200),
        }
    }
}

impl SchedulerSettings {
    fn export_options(&self) -> ExportOptions {
        ExportOptions {
            pages_per_chunk: self.export_pages_per_chunk,
            max_pages: self.max_pages,
            relationship_concurrency: self.relationship_concurrency,
            relationship_pause: self.relationship_pause,
        }
    }
}

/// Operator request to start a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_type: JobType,
    pub resource: ResourceType,
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    /// Header -> field mapping; suggested from the headers when absent.
    #[serde(default)]
    pub mapping: Option<FieldMapping>,
    /// Export destination, or the per-row results file of an import.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEstimate {
    pub rows: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    BatchStarted { job_id: Uuid, estimate: JobEstimate },
    Completed(SyncSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextJobOutcome {
    pub has_more: bool,
    pub job_id: Uuid,
    pub chunk_index: Option<usize>,
    pub chunk_summary: Option<SyncSummary>,
    /// Set exactly once, by the call that finishes the job.
    pub job_summary: Option<SyncSummary>,
    pub status: RunStatus,
}

struct ChunkRun {
    summary: SyncSummary,
    /// Rows started before cancellation, for row chunks that stopped early.
    stopped_after: Option<usize>,
    next_page: Option<ChunkRange>,
}

struct LoadedInput {
    rows: Vec<InputRow>,
    total_rows: usize,
    sha256: String,
    mapping: FieldMapping,
}

pub struct BatchScheduler {
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn RemoteGateway>,
    settings: SchedulerSettings,
    busy: Mutex<()>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn RemoteGateway>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            busy: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub async fn current_job(&self) -> Result<Option<Job>> {
        Ok(load_typed(self.store.as_ref(), JOB_SLOT_KEY).await?)
    }

    /// Whether `job_id` still owns the slot, i.e. was neither cancelled nor replaced.
    async fn holds_slot(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.current_job().await?.is_some_and(|j| j.id == job_id))
    }

    /// Persist a job in the slot. Fails when another job already holds it.
    pub async fn create_job(
        &self,
        job_type: JobType,
        resource: ResourceType,
        params: JobParams,
        ranges: Vec<ChunkRange>,
    ) -> Result<Job> {
        if let Some(active) = self.current_job().await? {
            return Err(SchedulerError::JobAlreadyActive(active.id).into());
        }
        let job = Job::new(job_type, resource, params, ranges);
        save_typed(self.store.as_ref(), JOB_SLOT_KEY, &job).await?;
        info!(
            job_id = %job.id,
            job_type = %job_type,
            %resource,
            chunks = job.chunks.len(),
            "job created"
        );
        Ok(job)
    }

    /// Run small jobs synchronously; split large ones into a persisted batch.
    /// The progress stream always ends with exactly one terminal frame.
    pub async fn start_job(
        &self,
        request: JobRequest,
        progress: ProgressSender,
    ) -> Result<StartOutcome> {
        let span = info_span!(
            "start_job",
            job_type = %request.job_type,
            resource = %request.resource
        );
        let result = self.start_inner(request, &progress).instrument(span).await;
        match &result {
            Ok(StartOutcome::Completed(summary)) => progress.complete(summary.clone()).await,
            Ok(StartOutcome::BatchStarted { job_id, estimate }) => {
                progress
                    .info(format!(
                        "batch job {job_id} started: {} rows in {} chunks",
                        estimate.rows, estimate.chunks
                    ))
                    .await;
                let summary = self
                    .current_job()
                    .await
                    .ok()
                    .flatten()
                    .map(|job| job.summary)
                    .unwrap_or_default();
                progress.complete(summary).await;
            }
            Err(err) => progress.fail(format!("{err:#}")).await,
        }
        result
    }

    async fn start_inner(
        &self,
        request: JobRequest,
        progress: &ProgressSender,
    ) -> Result<StartOutcome> {
        if let Some(active) = self.current_job().await? {
            return Err(SchedulerError::JobAlreadyActive(active.id).into());
        }
        let strategy = strategy_for(request.resource);
        let dry_remote = InMemoryRemote::new();
        let gateway: &dyn RemoteGateway = if request.dry_run {
            &dry_remote
        } else {
            self.gateway.as_ref()
        };

        let outcome = match request.job_type {
            JobType::Import | JobType::Delete => {
                self.start_rows_job(&request, strategy, gateway, progress).await?
            }
            JobType::Export => self.start_export_job(&request, strategy, gateway, progress).await?,
        };
        Ok(match outcome {
            StartOutcome::Completed(mut summary) if request.dry_run => {
                summary.record_warning("dry run: nothing was written to the remote service");
                StartOutcome::Completed(summary)
            }
            other => other,
        })
    }

    async fn start_rows_job(
        &self,
        request: &JobRequest,
        strategy: Box<dyn ResourceStrategy>,
        gateway: &dyn RemoteGateway,
        progress: &ProgressSender,
    ) -> Result<StartOutcome> {
        let path = request
            .input_path
            .as_deref()
            .context("import and delete jobs need an input file")?;
        let input = load_input(path, request.mapping.clone(), strategy.as_ref()).await?;
        let threshold = self.settings.thresholds.for_resource(request.resource);

        if request.dry_run || input.total_rows <= threshold {
            progress
                .info(format!("processing {} rows in one pass", input.total_rows))
                .await;
            let reconciler = Reconciler::new(gateway, strategy, self.settings.reconcile.clone());
            let mut cache = KeyCache::default();
            let report = match request.job_type {
                JobType::Delete => reconciler.delete_rows(&input.rows, &mut cache, progress).await,
                _ => reconciler.reconcile(&input.rows, &mut cache, progress).await,
            };
            if let Some(output) = &request.output_path {
                write_results(output, false, reconciler.strategy(), &report)?;
            }
            return Ok(StartOutcome::Completed(report.summary));
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let needed = input.total_rows.div_ceil(chunk_size);
        if needed > self.settings.max_chunks {
            return Err(SchedulerError::TooManyChunks {
                needed,
                limit: self.settings.max_chunks,
            }
            .into());
        }
        let ranges = (0..needed)
            .map(|n| ChunkRange::Rows {
                start: n * chunk_size,
                end: ((n + 1) * chunk_size).min(input.total_rows),
            })
            .collect();
        let params = JobParams {
            input_path: Some(path.to_path_buf()),
            input_sha256: Some(input.sha256),
            mapping: input.mapping.columns,
            output_path: request.output_path.clone(),
            total_rows: Some(input.total_rows),
            dry_run: false,
        };
        let job = self
            .create_job(request.job_type, request.resource, params, ranges)
            .await?;
        Ok(StartOutcome::BatchStarted {
            job_id: job.id,
            estimate: JobEstimate {
                rows: input.total_rows,
                chunks: needed,
            },
        })
    }

    /// Exports run their first chunk inline; a continuation turns the rest into a batch.
    async fn start_export_job(
        &self,
        request: &JobRequest,
        strategy: Box<dyn ResourceStrategy>,
        gateway: &dyn RemoteGateway,
        progress: &ProgressSender,
    ) -> Result<StartOutcome> {
        let output = request
            .output_path
            .as_deref()
            .context("export jobs need an output path")?;
        let options = self.settings.export_options();
        let first =
            export_into(gateway, strategy.as_ref(), output, None, false, &options, progress)
                .await?;
        let Some(cursor) = first.continuation.clone() else {
            return Ok(StartOutcome::Completed(first.summary));
        };
        if request.dry_run {
            return Ok(StartOutcome::Completed(first.summary));
        }

        let params = JobParams {
            output_path: Some(output.to_path_buf()),
            ..JobParams::default()
        };
        let mut job = Job::new(
            JobType::Export,
            request.resource,
            params,
            vec![ChunkRange::Page { cursor: None }],
        );
        let now = Utc::now();
        if let Some(chunk) = job.chunks.first_mut() {
            chunk.status = RunStatus::Completed;
            chunk.result = Some(first.summary.clone());
            chunk.started_at = Some(now);
            chunk.finished_at = Some(now);
        }
        job.summary.absorb(&first.summary);
        job.status = RunStatus::Running;
        job.push_chunk(ChunkRange::Page { cursor: Some(cursor) });

        if let Some(active) = self.current_job().await? {
            return Err(SchedulerError::JobAlreadyActive(active.id).into());
        }
        save_typed(self.store.as_ref(), JOB_SLOT_KEY, &job).await?;
        info!(
            job_id = %job.id,
            exported = first.summary.exported,
            "export continues as a batch job"
        );
        Ok(StartOutcome::BatchStarted {
            job_id: job.id,
            estimate: JobEstimate {
                rows: first.summary.exported,
                chunks: job.chunks.len(),
            },
        })
    }

    /// Run the next pending chunk of the active job. Safe to call repeatedly
    /// until `has_more` is false; the progress stream is always terminated.
    pub async fn process_next_job(&self, progress: ProgressSender) -> Result<NextJobOutcome> {
        let result = self.process_next_inner(&progress).await;
        match &result {
            Ok(outcome) => {
                let summary = outcome
                    .job_summary
                    .clone()
                    .or_else(|| outcome.chunk_summary.clone())
                    .unwrap_or_default();
                progress.complete(summary).await;
            }
            Err(err) => progress.fail(format!("{err:#}")).await,
        }
        result
    }

    async fn process_next_inner(&self, progress: &ProgressSender) -> Result<NextJobOutcome> {
        let _running = self.busy.try_lock().map_err(|_| SchedulerError::Busy)?;
        let mut job = self.current_job().await?.ok_or(SchedulerError::NoActiveJob)?;

        for chunk in job.chunks.iter_mut().filter(|c| c.status == RunStatus::Running) {
            warn!(
                job_id = %job.id,
                chunk = chunk.index,
                "chunk left running by an earlier execution; requeued"
            );
            chunk.status = RunStatus::Pending;
            chunk.started_at = None;
        }

        let Some(index) = job.next_pending() else {
            return self.finish(job, None, None).await;
        };

        job.status = RunStatus::Running;
        job.chunks[index].status = RunStatus::Running;
        job.chunks[index].started_at = Some(Utc::now());
        job.touch();
        save_typed(self.store.as_ref(), JOB_SLOT_KEY, &job).await?;
        self.gateway.reset_rate_limit().await;

        let span = info_span!("chunk", job_id = %job.id, chunk = index, of = job.chunks.len());
        let result = self.run_chunk(&job, index, progress).instrument(span).await;

        if !self.holds_slot(job.id).await? {
            info!(job_id = %job.id, chunk = index, "job was cancelled while a chunk ran");
            let chunk_summary = result.ok().map(|run| run.summary);
            return Ok(NextJobOutcome {
                has_more: false,
                job_id: job.id,
                chunk_index: Some(index),
                chunk_summary,
                job_summary: None,
                status: RunStatus::Failed,
            });
        }

        let chunk_summary = match result {
            Ok(run) => {
                let chunk = &mut job.chunks[index];
                chunk.status = RunStatus::Completed;
                chunk.finished_at = Some(Utc::now());
                let mut summary = run.summary;
                if let Some(range) = run.next_page {
                    if job.chunks.len() < self.settings.max_chunks {
                        job.push_chunk(range);
                    } else {
                        let message = format!(
                            "export stopped at the {}-chunk limit; output is truncated",
                            self.settings.max_chunks
                        );
                        warn!(job_id = %job.id, "{message}");
                        progress.warn(message.clone()).await;
                        summary.record_warning(message);
                    }
                }
                if let Some(processed) = run.stopped_after {
                    if let Some(next) = job.split_rows_chunk(index, processed) {
                        info!(
                            job_id = %job.id,
                            chunk = index,
                            requeued = next,
                            "chunk cancelled; remaining rows requeued"
                        );
                    }
                }
                job.chunks[index].result = Some(summary.clone());
                job.summary.absorb(&summary);
                summary
            }
            Err(err) => {
                let message = format!("chunk {index} failed: {err:#}");
                warn!(job_id = %job.id, "{message}");
                progress.error(message.clone(), None).await;
                let chunk = &mut job.chunks[index];
                chunk.status = RunStatus::Failed;
                chunk.error = Some(format!("{err:#}"));
                chunk.finished_at = Some(Utc::now());
                let mut summary = SyncSummary::default();
                summary.record_error(RowError::general(message));
                job.summary.absorb(&summary);
                summary
            }
        };

        if job.all_chunks_terminal() {
            return self.finish(job, Some(index), Some(chunk_summary)).await;
        }
        job.touch();
        save_typed(self.store.as_ref(), JOB_SLOT_KEY, &job).await?;
        Ok(NextJobOutcome {
            has_more: true,
            job_id: job.id,
            chunk_index: Some(index),
            chunk_summary: Some(chunk_summary),
            job_summary: None,
            status: job.status,
        })
    }

    async fn finish(
        &self,
        mut job: Job,
        chunk_index: Option<usize>,
        chunk_summary: Option<SyncSummary>,
    ) -> Result<NextJobOutcome> {
        job.status = job.terminal_status();
        job.touch();
        self.store.delete(JOB_SLOT_KEY).await?;
        self.store.delete(&job_cache_key(job.id)).await?;
        info!(job_id = %job.id, status = ?job.status, "job finished: {}", job.summary.headline());
        Ok(NextJobOutcome {
            has_more: false,
            job_id: job.id,
            chunk_index,
            chunk_summary,
            job_summary: Some(job.summary),
            status: job.status,
        })
    }

    async fn run_chunk(
        &self,
        job: &Job,
        index: usize,
        progress: &ProgressSender,
    ) -> Result<ChunkRun> {
        let strategy = strategy_for(job.resource);
        let range = job.chunks[index].range.clone();
        match (job.job_type, range) {
            (JobType::Import | JobType::Delete, ChunkRange::Rows { start, end }) => {
                self.run_rows_chunk(job, index, strategy, start, end, progress).await
            }
            (JobType::Export, ChunkRange::Page { cursor }) => {
                let output = job
                    .params
                    .output_path
                    .as_deref()
                    .context("export job has no output path")?;
                let resumed_from = cursor.clone();
                let chunk = export_into(
                    self.gateway.as_ref(),
                    strategy.as_ref(),
                    output,
                    cursor,
                    true,
                    &self.settings.export_options(),
                    progress,
                )
                .await?;
                let next_page = match (&chunk.continuation, chunk.cancelled && chunk.pages == 0) {
                    (_, true) => Some(ChunkRange::Page { cursor: resumed_from }),
                    (Some(next), false) => Some(ChunkRange::Page {
                        cursor: Some(next.clone()),
                    }),
                    (None, false) => None,
                };
                Ok(ChunkRun {
                    summary: chunk.summary,
                    stopped_after: None,
                    next_page,
                })
            }
            (job_type, range) => bail!("{job_type} job cannot run a chunk over {range:?}"),
        }
    }

    async fn run_rows_chunk(
        &self,
        job: &Job,
        index: usize,
        strategy: Box<dyn ResourceStrategy>,
        start: usize,
        end: usize,
        progress: &ProgressSender,
    ) -> Result<ChunkRun> {
        let path = job
            .params
            .input_path
            .as_deref()
            .context("job has no input file")?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if job
            .params
            .input_sha256
            .as_deref()
            .is_some_and(|expected| expected != sha256_hex(&bytes))
        {
            return Err(SchedulerError::InputChanged {
                path: path.to_path_buf(),
                job_id: job.id,
            }
            .into());
        }
        let mapping = FieldMapping {
            columns: job.params.mapping.clone(),
        };
        let input = read_rows_from(bytes.as_slice(), &mapping, Some((start, end)))?;

        let mut summary = SyncSummary::default();
        let cache_key = job_cache_key(job.id);
        let mut cache = match load_typed::<KeyCache>(self.store.as_ref(), &cache_key).await? {
            Some(cache) => cache,
            None => {
                progress.info("building key cache from the remote listing").await;
                let (mut cache, warnings) = KeyCache::build(
                    self.gateway.as_ref(),
                    strategy.as_ref(),
                    self.settings.max_pages,
                )
                .await
                .context("building key cache")?;
                let all_rows = read_rows_from(bytes.as_slice(), &mapping, None)?;
                cache.seed(&all_rows.rows);
                for warning in warnings {
                    progress.warn(warning.clone()).await;
                    summary.record_warning(warning);
                }
                cache
            }
        };

        let reconciler =
            Reconciler::new(self.gateway.as_ref(), strategy, self.settings.reconcile.clone());
        let report = match job.job_type {
            JobType::Delete => reconciler.delete_rows(&input.rows, &mut cache, progress).await,
            _ => reconciler.reconcile(&input.rows, &mut cache, progress).await,
        };
        summary.absorb(&report.summary);

        // A cancelled job keeps neither its cache nor its results rows.
        if self.holds_slot(job.id).await? {
            save_typed(self.store.as_ref(), &cache_key, &cache).await?;
            if let Some(output) = &job.params.output_path {
                write_results(output, index > 0, reconciler.strategy(), &report)?;
            }
        }
        Ok(ChunkRun {
            summary,
            stopped_after: report.cancelled.then_some(report.rows_processed),
            next_page: None,
        })
    }

    /// Clear the active job and its cache. A chunk already running still
    /// finishes, but keeps neither its cache, results rows nor summary.
    pub async fn cancel_job(&self) -> Result<Job> {
        let job = self.current_job().await?.ok_or(SchedulerError::NoActiveJob)?;
        self.store.delete(JOB_SLOT_KEY).await?;
        self.store.delete(&job_cache_key(job.id)).await?;
        info!(
            job_id = %job.id,
            completed = job.completed_chunks(),
            of = job.chunks.len(),
            "job cancelled"
        );
        Ok(job)
    }
}

async fn load_input(
    path: &Path,
    mapping: Option<FieldMapping>,
    strategy: &dyn ResourceStrategy,
) -> Result<LoadedInput> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let headers = read_headers(path)?;
    let mapping = mapping.unwrap_or_else(|| FieldMapping::suggest(&headers, strategy));
    mapping.check(strategy, &headers)?;
    let input = read_rows_from(bytes.as_slice(), &mapping, None)?;
    Ok(LoadedInput {
        rows: input.rows,
        total_rows: input.total_rows,
        sha256: sha256_hex(&bytes),
        mapping,
    })
}

async fn export_into(
    gateway: &dyn RemoteGateway,
    strategy: &dyn ResourceStrategy,
    output: &Path,
    cursor: Option<PageCursor>,
    append: bool,
    options: &ExportOptions,
    progress: &ProgressSender,
) -> Result<ExportChunk> {
    let columns = strategy.export_columns();
    let mut writer = if append {
        CsvExportWriter::append(output, &columns)?
    } else {
        CsvExportWriter::create(output, &columns)?
    };
    let chunk = export_pages(gateway, strategy, cursor, options, &mut writer, progress).await?;
    writer.finish()?;
    Ok(chunk)
}

/// Per-row results: the resolved row, its action and any error.
fn write_results(
    path: &Path,
    append: bool,
    strategy: &dyn ResourceStrategy,
    report: &ReconcileReport,
) -> Result<()> {
    let mut columns = vec!["row_num", "action", "error"];
    columns.extend(strategy.fields().iter().map(|f| f.name));
    let mut writer = if append {
        CsvExportWriter::append(path, &columns)?
    } else {
        CsvExportWriter::create(path, &columns)?
    };
    for (row, outcome) in report.resolved_rows.iter().zip(&report.outcomes) {
        let mut cells: BTreeMap<String, String> = row.raw_fields().clone();
        cells.insert("row_num".to_string(), row.row_num.to_string());
        let action = match outcome.matched.as_ref().map(|m| m.action) {
            _ if outcome.remote_id.is_none() => "",
            Some(MatchAction::Create) if !outcome.is_error() => "create",
            Some(MatchAction::Update) if !outcome.is_error() => "update",
            _ => "",
        };
        cells.insert("action".to_string(), action.to_string());
        cells.insert("error".to_string(), outcome.error.clone().unwrap_or_default());
        writer.write_row(&cells)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{progress_channel, ProgressFrame};
    use rowsync_storage::{MemoryStateStore, StateStoreError, JOB_CACHE_KEY};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Clears the job slot the first time a chunk reads its key cache, the
    /// way a `cancel_job` from another caller would.
    #[derive(Default)]
    struct CancelOnCacheRead {
        inner: MemoryStateStore,
        fired: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateStore for CancelOnCacheRead {
        async fn get(&self, key: &str) -> Result<Option<JsonValue>, StateStoreError> {
            if key.starts_with(JOB_CACHE_KEY) && !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.delete(JOB_SLOT_KEY).await?;
                self.inner.delete(key).await?;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &JsonValue) -> Result<(), StateStoreError> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
            self.inner.delete(key).await
        }
    }

    fn write_csv(dir: &Path, rows: usize) -> PathBuf {
        let path = dir.join("companies.csv");
        let mut text = String::from("Name,Source Record ID\n");
        for n in 0..rows {
            text.push_str(&format!("Company {n},crm-{n}\n"));
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    fn scheduler(
        remote: Arc<InMemoryRemote>,
        store: Arc<dyn StateStore>,
        threshold: usize,
    ) -> BatchScheduler {
        BatchScheduler::new(
            store,
            remote,
            SchedulerSettings {
                chunk_size: 10,
                thresholds: Thresholds {
                    company: threshold,
                    note: threshold,
                    entity: threshold,
                },
                ..SchedulerSettings::default()
            },
        )
    }

    fn fresh_scheduler(threshold: usize) -> BatchScheduler {
        scheduler(
            Arc::new(InMemoryRemote::new()),
            Arc::new(MemoryStateStore::new()),
            threshold,
        )
    }

    fn import(path: &Path) -> JobRequest {
        JobRequest {
            job_type: JobType::Import,
            resource: ResourceType::Company,
            input_path: Some(path.to_path_buf()),
            mapping: None,
            output_path: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn small_jobs_run_synchronously_and_close_the_stream() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 3);
        let remote = Arc::new(InMemoryRemote::new());
        let sched = scheduler(remote.clone(), Arc::new(MemoryStateStore::new()), 100);
        let (tx, mut rx) = progress_channel(64);

        let outcome = sched.start_job(import(&path), tx).await.unwrap();
        let StartOutcome::Completed(summary) = outcome else {
            panic!("expected a synchronous result");
        };
        assert_eq!(summary.created, 3);
        assert!(sched.current_job().await.unwrap().is_none());

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(matches!(frames.last(), Some(ProgressFrame::Complete { .. })));
        assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn second_job_is_refused_while_one_is_active() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 25);
        let sched = fresh_scheduler(5);

        let first = sched.start_job(import(&path), ProgressSender::detached()).await.unwrap();
        assert!(matches!(
            first,
            StartOutcome::BatchStarted {
                estimate: JobEstimate { rows: 25, chunks: 3 },
                ..
            }
        ));
        let err = sched
            .start_job(import(&path), ProgressSender::detached())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::JobAlreadyActive(_))
        ));

        let cancelled = sched.cancel_job().await.unwrap();
        assert_eq!(cancelled.chunks.len(), 3);
        let err = sched.process_next_job(ProgressSender::detached()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::NoActiveJob)
        ));
    }

    #[tokio::test]
    async fn cancelled_chunk_requeues_its_remaining_rows() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 25);
        let remote = Arc::new(InMemoryRemote::new());
        let sched = scheduler(remote.clone(), Arc::new(MemoryStateStore::new()), 5);
        sched.start_job(import(&path), ProgressSender::detached()).await.unwrap();

        let stopped = ProgressSender::detached();
        stopped.cancellation_token().cancel();
        let first = sched.process_next_job(stopped).await.unwrap();
        assert!(first.has_more);
        assert_eq!(remote.count(ResourceType::Company).await, 0);
        let job = sched.current_job().await.unwrap().unwrap();
        assert_eq!(job.chunks.len(), 4);
        assert_eq!(job.chunks[1].range, ChunkRange::Rows { start: 0, end: 10 });

        let mut last = None;
        while let Ok(outcome) = sched.process_next_job(ProgressSender::detached()).await {
            let done = !outcome.has_more;
            last = Some(outcome);
            if done {
                break;
            }
        }
        let summary = last.and_then(|o| o.job_summary).unwrap();
        assert_eq!(summary.created, 25);
        assert_eq!(remote.count(ResourceType::Company).await, 25);
    }

    #[tokio::test]
    async fn changed_input_fails_the_remaining_chunks() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 12);
        let sched = fresh_scheduler(5);
        sched.start_job(import(&path), ProgressSender::detached()).await.unwrap();
        write_csv(dir.path(), 13);

        let first = sched.process_next_job(ProgressSender::detached()).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.chunk_summary.as_ref().map(|s| s.errors), Some(1));
        let last = sched.process_next_job(ProgressSender::detached()).await.unwrap();
        assert!(!last.has_more);
        assert_eq!(last.status, RunStatus::Failed);
        assert_eq!(last.job_summary.map(|s| s.errors), Some(2));
    }

    #[tokio::test]
    async fn dry_run_leaves_the_remote_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 30);
        let remote = Arc::new(InMemoryRemote::new());
        remote
            .insert(
                ResourceType::Company,
                json!({ "name": "Existing", "source": { "recordId": "crm-0" } }),
            )
            .await;
        let sched = scheduler(remote.clone(), Arc::new(MemoryStateStore::new()), 5);

        let mut request = import(&path);
        request.dry_run = true;
        let outcome = sched.start_job(request, ProgressSender::detached()).await.unwrap();
        let StartOutcome::Completed(summary) = outcome else {
            panic!("dry runs are synchronous");
        };
        assert_eq!(summary.created, 30);
        assert_eq!(summary.warnings, 1);
        assert_eq!(remote.count(ResourceType::Company).await, 1);
        assert!(sched.current_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_file_carries_written_back_ids() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 2);
        let sched = fresh_scheduler(100);
        let results = dir.path().join("results.csv");
        let mut request = import(&path);
        request.output_path = Some(results.clone());

        sched.start_job(request, ProgressSender::detached()).await.unwrap();

        let text = std::fs::read_to_string(&results).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("row_num,action,error,id,source_record_id,name,domain,website,email,phone,owner")
        );
        assert_eq!(lines.next(), Some("2,create,,company-1,crm-0,Company 0,,,,,"));
    }

    #[tokio::test]
    async fn job_cancelled_mid_chunk_leaves_no_cache_or_results_behind() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), 20);
        let results = dir.path().join("results.csv");
        let store = Arc::new(CancelOnCacheRead::default());
        let sched = scheduler(Arc::new(InMemoryRemote::new()), store.clone(), 5);

        let mut request = import(&path);
        request.output_path = Some(results.clone());
        let StartOutcome::BatchStarted { job_id, .. } =
            sched.start_job(request, ProgressSender::detached()).await.unwrap()
        else {
            panic!("expected a batch job");
        };

        let outcome = sched.process_next_job(ProgressSender::detached()).await.unwrap();
        assert!(!outcome.has_more);
        assert!(outcome.job_summary.is_none());
        assert!(sched.current_job().await.unwrap().is_none());
        assert!(store.get(&job_cache_key(job_id)).await.unwrap().is_none());
        assert!(!results.exists());

        // The next job runs against a remote that never saw the first one's records.
        let fresh = scheduler(Arc::new(InMemoryRemote::new()), store.clone(), 5);
        fresh.start_job(import(&path), ProgressSender::detached()).await.unwrap();
        let chunk = fresh.process_next_job(ProgressSender::detached()).await.unwrap();
        let summary = chunk.chunk_summary.unwrap();
        assert_eq!(summary.created, 10);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.errors, 0);
    }
}
