//! Row-to-record reconciliation: match, sparse two-phase write, backfill.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rowsync_adapters::resources::get_path;
use rowsync_adapters::{
    created_id, DeleteOutcome, FieldTarget, LinkOutcome, RemoteGateway, ResourceStrategy, WritePlan,
};
use rowsync_core::{
    BackfillTask, InputRow, MatchAction, MatchResult, RowError, RowOutcome, SyncSummary,
    SECONDARY_KEY_FIELD,
};
use rowsync_storage::{ApiError, Paginator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DEFAULT_BACKFILL_DELAYS_MS;
use crate::progress::{percent_of, ProgressSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Pause before each retry of a backfill that hit a not-yet-propagated record.
    pub backfill_delays: Vec<Duration>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            backfill_delays: DEFAULT_BACKFILL_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

/// Lookup cache shared by every chunk of one job.
///
/// When `complete` is set the cache was built from an untruncated listing, so
/// a miss means the key is unknown remotely and no lookup call is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCache {
    secondary: BTreeMap<String, String>,
    known_ids: BTreeSet<String>,
    complete: bool,
}

fn secondary_key_path(strategy: &dyn ResourceStrategy) -> Option<&'static str> {
    match strategy.field(SECONDARY_KEY_FIELD)?.target {
        FieldTarget::Primary(path) => Some(path),
        _ => None,
    }
}

impl KeyCache {
    /// Read the full remote listing once. Returns the cache plus any pagination warnings.
    pub async fn build(
        gateway: &dyn RemoteGateway,
        strategy: &dyn ResourceStrategy,
        max_pages: usize,
    ) -> Result<(Self, Vec<String>), ApiError> {
        let paginator = Paginator::new(gateway.listing(strategy), max_pages);
        let (items, warnings) = paginator.collect_all().await?;
        let key_path = secondary_key_path(strategy);
        let mut cache = KeyCache {
            complete: warnings.is_empty(),
            ..KeyCache::default()
        };
        for item in &items {
            let Some(id) = created_id(item) else {
                continue;
            };
            let attributes = item.get("attributes").unwrap_or(item);
            if let Some(key) = key_path
                .and_then(|path| get_path(attributes, path))
                .and_then(|v| v.as_str())
                .filter(|k| !k.is_empty())
            {
                cache.secondary.insert(key.to_string(), id.clone());
            }
            cache.known_ids.insert(id);
        }
        debug!(
            records = cache.known_ids.len(),
            keyed = cache.secondary.len(),
            complete = cache.complete,
            "key cache built"
        );
        Ok((cache, warnings))
    }

    /// Add secondary->primary pairs from rows that already carry both keys.
    pub fn seed(&mut self, rows: &[InputRow]) {
        for row in rows {
            if let (Some(id), Some(key)) = (row.primary_key(), row.secondary_key()) {
                if self.known_ids.contains(id) {
                    self.secondary
                        .entry(key.to_string())
                        .or_insert_with(|| id.to_string());
                }
            }
        }
    }

    pub fn secondary(&self, key: &str) -> Option<&str> {
        self.secondary.get(key).map(String::as_str)
    }

    pub fn knows_id(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.known_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_ids.is_empty()
    }

    pub fn remember(&mut self, secondary: Option<&str>, id: &str) {
        if let Some(key) = secondary {
            self.secondary.insert(key.to_string(), id.to_string());
        }
        self.known_ids.insert(id.to_string());
    }

    pub fn forget(&mut self, id: &str) {
        self.known_ids.remove(id);
        self.secondary.retain(|_, v| v != id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOutcome {
    pub remote_id: String,
    pub row_num: usize,
    pub succeeded: bool,
    pub attempts: u32,
    /// Pauses taken before each retry, in order.
    pub delays: Vec<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub summary: SyncSummary,
    pub outcomes: Vec<RowOutcome>,
    pub backfill_queue: Vec<BackfillTask>,
    pub backfill: Vec<BackfillOutcome>,
    /// Input rows with the resolved remote id in the primary-key slot.
    pub resolved_rows: Vec<InputRow>,
    /// Rows started before the run stopped; equals the input length unless cancelled.
    pub rows_processed: usize,
    pub cancelled: bool,
}

pub struct Reconciler<'a> {
    gateway: &'a dyn RemoteGateway,
    strategy: Box<dyn ResourceStrategy>,
    options: ReconcileOptions,
}

fn payload_is_empty(plan: &WritePlan) -> bool {
    plan.payload.as_object().map_or(true, |o| o.is_empty())
}

impl<'a> Reconciler<'a> {
    pub fn new(
        gateway: &'a dyn RemoteGateway,
        strategy: Box<dyn ResourceStrategy>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            gateway,
            strategy,
            options,
        }
    }

    pub fn strategy(&self) -> &dyn ResourceStrategy {
        self.strategy.as_ref()
    }

    /// Resolve a row: secondary key first, then primary key, else create.
    pub async fn resolve(
        &self,
        row: &InputRow,
        cache: &mut KeyCache,
    ) -> Result<MatchResult, ApiError> {
        let strategy = self.strategy.as_ref();
        let rules = strategy.match_strategy();

        if rules.use_secondary_key {
            if let Some(key) = row.secondary_key() {
                if let Some(id) = cache.secondary(key) {
                    return Ok(MatchResult::by_secondary_key(id));
                }
                if !cache.is_complete() {
                    if let Some(id) = self.gateway.find_by_secondary(strategy, key).await? {
                        cache.remember(Some(key), &id);
                        return Ok(MatchResult::by_secondary_key(id));
                    }
                }
            }
        }

        if rules.use_primary_key {
            if let Some(id) = row.primary_key() {
                let exists = cache.knows_id(id)
                    || (!cache.is_complete() && self.gateway.primary_exists(strategy, id).await?);
                if exists {
                    cache.remember(None, id);
                    return Ok(MatchResult::by_primary_key(id));
                }
            }
        }

        Ok(MatchResult::create())
    }

    pub async fn reconcile(
        &self,
        rows: &[InputRow],
        cache: &mut KeyCache,
        progress: &ProgressSender,
    ) -> ReconcileReport {
        let span = info_span!(
            "reconcile",
            resource = %self.strategy.resource(),
            rows = rows.len()
        );
        self.reconcile_inner(rows, cache, progress)
            .instrument(span)
            .await
    }

    async fn reconcile_inner(
        &self,
        rows: &[InputRow],
        cache: &mut KeyCache,
        progress: &ProgressSender,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let total = rows.len();

        for (index, row) in rows.iter().enumerate() {
            if progress.is_cancelled() {
                info!(row = row.row_num, "cancellation observed; stopping before row");
                report.cancelled = true;
                break;
            }
            let outcome = self
                .process_row(row, cache, &mut report.backfill_queue, &mut report.summary, progress)
                .await;
            let resolved = match &outcome.remote_id {
                Some(id) if !outcome.is_error() => row.with_primary_key(id),
                _ => row.clone(),
            };
            report.resolved_rows.push(resolved);
            report.outcomes.push(outcome);
            report.rows_processed = index + 1;
            progress
                .progress(
                    format!("{} of {total} rows", index + 1),
                    percent_of(index + 1, total),
                )
                .await;
        }

        // Tasks belong to rows already written, so the pass runs even after cancellation.
        if !report.backfill_queue.is_empty() {
            progress
                .info(format!("backfilling {} records", report.backfill_queue.len()))
                .await;
            report.backfill = self
                .run_backfill(&report.backfill_queue, &mut report.summary, progress)
                .await;
        }

        info!(
            processed = report.rows_processed,
            cancelled = report.cancelled,
            "{}",
            report.summary.headline()
        );
        report
    }

    async fn process_row(
        &self,
        row: &InputRow,
        cache: &mut KeyCache,
        queue: &mut Vec<BackfillTask>,
        summary: &mut SyncSummary,
        progress: &ProgressSender,
    ) -> RowOutcome {
        let strategy = self.strategy.as_ref();

        let shape_errors = strategy.validate(row, MatchAction::Update);
        if !shape_errors.is_empty() {
            return Self::reject(row, None, shape_errors, summary, progress).await;
        }

        let matched = match self.resolve(row, cache).await {
            Ok(matched) => matched,
            Err(err) => {
                let error = RowError::row(row.row_num, format!("lookup failed: {}", err.summary()));
                return Self::reject(row, None, vec![error], summary, progress).await;
            }
        };

        if matched.action == MatchAction::Create {
            let missing = strategy.validate(row, MatchAction::Create);
            if !missing.is_empty() {
                return Self::reject(row, Some(matched), missing, summary, progress).await;
            }
        }

        let built = match matched.action {
            MatchAction::Create => strategy.build_create_payload(row),
            MatchAction::Update => strategy.build_update_payload(row),
        };
        let mut plan = match built {
            Ok(plan) => plan,
            Err(err) => {
                let error = RowError::row(row.row_num, err.to_string());
                return Self::reject(row, Some(matched), vec![error], summary, progress).await;
            }
        };

        let (remote_id, stripped) = match self.primary_write(&matched, &mut plan).await {
            Ok(written) => written,
            Err(err) => {
                warn!(row = row.row_num, error = %err, "primary write failed");
                let error = RowError::row(row.row_num, err.summary());
                return Self::reject(row, Some(matched), vec![error], summary, progress).await;
            }
        };

        cache.remember(row.secondary_key(), &remote_id);
        match matched.action {
            MatchAction::Create => summary.created += 1,
            MatchAction::Update => summary.updated += 1,
        }
        for name in &stripped {
            let message = format!(
                "row {}: `{name}` rejected by the remote; queued for backfill",
                row.row_num
            );
            progress.warn(message.clone()).await;
            summary.record_warning(message);
        }

        for target in &plan.links {
            match self.gateway.link(strategy, &remote_id, target).await {
                Ok(LinkOutcome::Linked) => {}
                Ok(LinkOutcome::AlreadyLinked) => {
                    let message = format!("row {}: already linked to {target}", row.row_num);
                    progress.warn(message.clone()).await;
                    summary.record_warning(message);
                }
                Err(err) => {
                    let error = RowError::field(
                        row.row_num,
                        "linked_entity_ids",
                        format!("linking {target}: {}", err.summary()),
                    );
                    progress.error(error.to_string(), None).await;
                    summary.record_error(error);
                }
            }
        }

        if !plan.backfill.is_empty() {
            queue.push(BackfillTask {
                remote_id: remote_id.clone(),
                row_num: row.row_num,
                fields: plan.backfill.clone(),
            });
        }

        let verb = match matched.action {
            MatchAction::Create => "created",
            MatchAction::Update => "updated",
        };
        progress
            .success(format!("row {}: {verb} {remote_id}", row.row_num))
            .await;

        let mut outcome = RowOutcome::written(row.row_num, matched, remote_id);
        outcome.stripped = stripped;
        outcome
    }

    /// Create or update once, stripping one rejected field and retrying a single time.
    async fn primary_write(
        &self,
        matched: &MatchResult,
        plan: &mut WritePlan,
    ) -> Result<(String, Vec<String>), ApiError> {
        let strategy = self.strategy.as_ref();
        let mut stripped = Vec::new();
        loop {
            let attempt = match &matched.remote_id {
                Some(id) if payload_is_empty(plan) => return Ok((id.clone(), stripped)),
                Some(id) => self
                    .gateway
                    .update(strategy, id, &plan.payload)
                    .await
                    .map(|()| id.clone()),
                None => self.gateway.create(strategy, &plan.payload).await,
            };
            let err = match attempt {
                Ok(id) => return Ok((id, stripped)),
                Err(err) => err,
            };
            if !stripped.is_empty() {
                return Err(err);
            }
            let Some(name) = strategy.unsettable_field(&err, plan) else {
                return Err(err);
            };
            debug!(field = name, "stripping rejected field and retrying");
            plan.strip(name);
            stripped.push(name.to_string());
        }
    }

    async fn reject(
        row: &InputRow,
        matched: Option<MatchResult>,
        errors: Vec<RowError>,
        summary: &mut SyncSummary,
        progress: &ProgressSender,
    ) -> RowOutcome {
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        for error in errors {
            progress.error(error.to_string(), None).await;
            summary.record_error(error);
        }
        RowOutcome::failed(row.row_num, matched, message)
    }

    async fn run_backfill(
        &self,
        queue: &[BackfillTask],
        summary: &mut SyncSummary,
        progress: &ProgressSender,
    ) -> Vec<BackfillOutcome> {
        let mut outcomes = Vec::with_capacity(queue.len());
        for task in queue {
            let mut delays = Vec::new();
            let mut attempts = 0;
            let result = loop {
                attempts += 1;
                match self.gateway.backfill(&task.remote_id, &task.fields).await {
                    Ok(()) => break Ok(()),
                    Err(err)
                        if err.is_not_found()
                            && delays.len() < self.options.backfill_delays.len() =>
                    {
                        let delay = self.options.backfill_delays[delays.len()];
                        debug!(
                            remote_id = %task.remote_id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "record not yet visible for backfill"
                        );
                        tokio::time::sleep(delay).await;
                        delays.push(delay);
                    }
                    Err(err) => break Err(err),
                }
            };
            let error = match result {
                Ok(()) => None,
                Err(err) => {
                    let error = RowError::row(
                        task.row_num,
                        format!("backfill of {} failed: {}", task.remote_id, err.summary()),
                    );
                    warn!(remote_id = %task.remote_id, attempts, "{error}");
                    progress.error(error.to_string(), None).await;
                    let message = error.message.clone();
                    summary.record_error(error);
                    Some(message)
                }
            };
            outcomes.push(BackfillOutcome {
                remote_id: task.remote_id.clone(),
                row_num: task.row_num,
                succeeded: error.is_none(),
                attempts,
                delays,
                error,
            });
        }
        outcomes
    }

    /// Delete the remote record each row resolves to.
    pub async fn delete_rows(
        &self,
        rows: &[InputRow],
        cache: &mut KeyCache,
        progress: &ProgressSender,
    ) -> ReconcileReport {
        let span = info_span!(
            "delete",
            resource = %self.strategy.resource(),
            rows = rows.len()
        );
        self.delete_inner(rows, cache, progress).instrument(span).await
    }

    async fn delete_inner(
        &self,
        rows: &[InputRow],
        cache: &mut KeyCache,
        progress: &ProgressSender,
    ) -> ReconcileReport {
        let strategy = self.strategy.as_ref();
        let mut report = ReconcileReport::default();
        let total = rows.len();

        for (index, row) in rows.iter().enumerate() {
            if progress.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = match self.resolve(row, cache).await {
                Ok(MatchResult {
                    remote_id: Some(id),
                    ..
                }) => match self.gateway.delete(strategy, &id).await {
                    Ok(DeleteOutcome::Deleted) => {
                        cache.forget(&id);
                        report.summary.deleted += 1;
                        progress
                            .success(format!("row {}: deleted {id}", row.row_num))
                            .await;
                        RowOutcome::written(row.row_num, MatchResult::by_primary_key(&id), id)
                    }
                    Ok(DeleteOutcome::AlreadyAbsent) => {
                        cache.forget(&id);
                        let message = format!("row {}: {id} was already deleted", row.row_num);
                        progress.warn(message.clone()).await;
                        report.summary.record_warning(message);
                        RowOutcome::written(row.row_num, MatchResult::by_primary_key(&id), id)
                    }
                    Err(err) => {
                        let error = RowError::row(
                            row.row_num,
                            format!("delete failed: {}", err.summary()),
                        );
                        Self::reject(row, None, vec![error], &mut report.summary, progress).await
                    }
                },
                Ok(_) => {
                    let message = format!("row {}: no remote record matches; skipped", row.row_num);
                    progress.warn(message.clone()).await;
                    report.summary.record_warning(message);
                    RowOutcome {
                        row_num: row.row_num,
                        matched: Some(MatchResult::create()),
                        remote_id: None,
                        error: None,
                        stripped: Vec::new(),
                    }
                }
                Err(err) => {
                    let error =
                        RowError::row(row.row_num, format!("lookup failed: {}", err.summary()));
                    Self::reject(row, None, vec![error], &mut report.summary, progress).await
                }
            };
            report.resolved_rows.push(row.clone());
            report.outcomes.push(outcome);
            report.rows_processed = index + 1;
            progress
                .progress(
                    format!("{} of {total} rows", index + 1),
                    percent_of(index + 1, total),
                )
                .await;
        }
        report
    }
}
