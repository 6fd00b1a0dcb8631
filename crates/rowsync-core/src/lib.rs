//! Core record, job and outcome model shared by the rowsync crates.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rowsync-core";

/// Mapped field carrying the remote primary key.
pub const PRIMARY_KEY_FIELD: &str = "id";

/// Mapped field carrying the caller-supplied secondary key.
pub const SECONDARY_KEY_FIELD: &str = "source_record_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Company,
    Note,
    Entity,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] =
        [ResourceType::Company, ResourceType::Note, ResourceType::Entity];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Company => "company",
            ResourceType::Note => "note",
            ResourceType::Entity => "entity",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "company" | "companies" => Ok(ResourceType::Company),
            "note" | "notes" => Ok(ResourceType::Note),
            "entity" | "entities" => Ok(ResourceType::Entity),
            other => Err(format!("unknown resource type `{other}`")),
        }
    }
}

/// A resource instance as seen at the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub external_id: Option<String>,
    pub attributes: JsonValue,
}

/// One CSV data row after header->field mapping. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub row_num: usize,
    fields: BTreeMap<String, String>,
}

impl InputRow {
    pub fn new(row_num: usize, fields: BTreeMap<String, String>) -> Self {
        Self { row_num, fields }
    }

    /// Trimmed value for `field`, `None` when absent or blank.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Non-empty fields in name order.
    pub fn present_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.trim()))
            .filter(|(_, v)| !v.is_empty())
    }

    pub fn raw_fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.get(PRIMARY_KEY_FIELD)
    }

    pub fn secondary_key(&self) -> Option<&str> {
        self.get(SECONDARY_KEY_FIELD)
    }

    /// Copy of this row with `remote_id` written into the primary-key slot.
    pub fn with_primary_key(&self, remote_id: &str) -> InputRow {
        let mut fields = self.fields.clone();
        fields.insert(PRIMARY_KEY_FIELD.to_string(), remote_id.to_string());
        InputRow {
            row_num: self.row_num,
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchAction {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchedBy {
    PrimaryKey,
    SecondaryKey,
    None,
}

/// Outcome of matching one row. `action` is `Update` iff a remote id was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub action: MatchAction,
    pub remote_id: Option<String>,
    pub matched_by: MatchedBy,
}

impl MatchResult {
    pub fn create() -> Self {
        Self {
            action: MatchAction::Create,
            remote_id: None,
            matched_by: MatchedBy::None,
        }
    }

    pub fn by_primary_key(remote_id: impl Into<String>) -> Self {
        Self {
            action: MatchAction::Update,
            remote_id: Some(remote_id.into()),
            matched_by: MatchedBy::PrimaryKey,
        }
    }

    pub fn by_secondary_key(remote_id: impl Into<String>) -> Self {
        Self {
            action: MatchAction::Update,
            remote_id: Some(remote_id.into()),
            matched_by: MatchedBy::SecondaryKey,
        }
    }
}

/// Follow-up write for fields the primary write path cannot carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillTask {
    pub remote_id: String,
    pub row_num: usize,
    pub fields: BTreeMap<String, JsonValue>,
}

/// What happened to a single row during a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    pub row_num: usize,
    pub matched: Option<MatchResult>,
    pub remote_id: Option<String>,
    pub error: Option<String>,
    /// Fields dropped from the primary write after a rejection and moved to backfill.
    #[serde(default)]
    pub stripped: Vec<String>,
}

impl RowOutcome {
    pub fn written(row_num: usize, matched: MatchResult, remote_id: impl Into<String>) -> Self {
        Self {
            row_num,
            matched: Some(matched),
            remote_id: Some(remote_id.into()),
            error: None,
            stripped: Vec::new(),
        }
    }

    pub fn failed(row_num: usize, matched: Option<MatchResult>, error: impl Into<String>) -> Self {
        Self {
            row_num,
            remote_id: matched.as_ref().and_then(|m| m.remote_id.clone()),
            matched,
            error: Some(error.into()),
            stripped: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Import,
    Export,
    Delete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::Export => "export",
            JobType::Delete => "delete",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resume position inside a paginated remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum PageCursor {
    Offset(u64),
    Token(String),
}

/// The slice of work a chunk covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChunkRange {
    /// Input rows `[start, end)` by zero-based data-row index.
    Rows { start: usize, end: usize },
    /// Listing position; `None` is the first page.
    Page { cursor: Option<PageCursor> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    pub range: ChunkRange,
    pub status: RunStatus,
    pub result: Option<SyncSummary>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn pending(index: usize, range: ChunkRange) -> Self {
        Self {
            index,
            range,
            status: RunStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub input_path: Option<PathBuf>,
    pub input_sha256: Option<String>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    pub output_path: Option<PathBuf>,
    pub total_rows: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

/// A resumable unit of operator work made of ordered chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub resource: ResourceType,
    pub status: RunStatus,
    pub params: JobParams,
    pub chunks: Vec<Chunk>,
    pub summary: SyncSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        resource: ResourceType,
        params: JobParams,
        ranges: Vec<ChunkRange>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            resource,
            status: RunStatus::Pending,
            params,
            chunks: ranges
                .into_iter()
                .enumerate()
                .map(|(index, range)| Chunk::pending(index, range))
                .collect(),
            summary: SyncSummary::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// First pending chunk in enqueue order.
    pub fn next_pending(&self) -> Option<usize> {
        self.chunks
            .iter()
            .position(|c| c.status == RunStatus::Pending)
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    pub fn all_chunks_terminal(&self) -> bool {
        self.chunks.iter().all(|c| c.status.is_terminal())
    }

    /// Append a chunk after every currently known chunk.
    pub fn push_chunk(&mut self, range: ChunkRange) -> usize {
        let index = self.chunks.len();
        self.chunks.push(Chunk::pending(index, range));
        index
    }

    /// Narrow a rows chunk to its first `processed` rows and queue the rest right after it.
    pub fn split_rows_chunk(&mut self, index: usize, processed: usize) -> Option<usize> {
        let chunk = self.chunks.get_mut(index)?;
        let (start, end) = match &chunk.range {
            ChunkRange::Rows { start, end } => (*start, *end),
            ChunkRange::Page { .. } => return None,
        };
        let cut = start + processed;
        if cut >= end {
            return None;
        }
        chunk.range = ChunkRange::Rows { start, end: cut };
        self.chunks.insert(
            index + 1,
            Chunk::pending(index + 1, ChunkRange::Rows { start: cut, end }),
        );
        for (position, chunk) in self.chunks.iter_mut().enumerate() {
            chunk.index = position;
        }
        Some(index + 1)
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.status.is_terminal()).count()
    }

    /// Terminal job status once every chunk is terminal: failed only when no chunk completed.
    pub fn terminal_status(&self) -> RunStatus {
        if self.chunks.iter().any(|c| c.status == RunStatus::Completed) || self.chunks.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A counted failure attributed to a source row where one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row_num: Option<usize>,
    pub field: Option<String>,
    pub message: String,
}

impl RowError {
    pub fn row(row_num: usize, message: impl Into<String>) -> Self {
        Self {
            row_num: Some(row_num),
            field: None,
            message: message.into(),
        }
    }

    pub fn field(row_num: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            row_num: Some(row_num),
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            row_num: None,
            field: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.row_num, &self.field) {
            (Some(row), Some(field)) => write!(f, "row {row} ({field}): {}", self.message),
            (Some(row), None) => write!(f, "row {row}: {}", self.message),
            (None, _) => f.write_str(&self.message),
        }
    }
}

/// Counted user-visible result of a chunk or a whole job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub exported: usize,
    pub errors: usize,
    pub warnings: usize,
    #[serde(default)]
    pub row_errors: Vec<RowError>,
    #[serde(default)]
    pub warning_messages: Vec<String>,
}

impl SyncSummary {
    pub fn record_error(&mut self, error: RowError) {
        self.errors += 1;
        self.row_errors.push(error);
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings += 1;
        self.warning_messages.push(message.into());
    }

    pub fn absorb(&mut self, other: &SyncSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.exported += other.exported;
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.row_errors.extend(other.row_errors.iter().cloned());
        self.warning_messages
            .extend(other.warning_messages.iter().cloned());
    }

    /// Same counters, ignoring message order and text.
    pub fn same_counts(&self, other: &SyncSummary) -> bool {
        let counts = |s: &SyncSummary| {
            (s.created, s.updated, s.deleted, s.exported, s.errors, s.warnings)
        };
        counts(self) == counts(other)
    }

    pub fn headline(&self) -> String {
        format!(
            "created={} updated={} deleted={} exported={} errors={} warnings={}",
            self.created, self.updated, self.deleted, self.exported, self.errors, self.warnings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> InputRow {
        InputRow::new(
            2,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn blank_values_read_as_absent() {
        let r = row(&[("name", "  Acme "), ("domain", "   "), ("id", "")]);
        assert_eq!(r.get("name"), Some("Acme"));
        assert_eq!(r.get("domain"), None);
        assert_eq!(r.primary_key(), None);
        assert_eq!(r.present_fields().count(), 1);
    }

    #[test]
    fn write_back_leaves_original_row_untouched() {
        let r = row(&[("name", "Acme")]);
        let resolved = r.with_primary_key("rec-1");
        assert_eq!(resolved.primary_key(), Some("rec-1"));
        assert_eq!(resolved.row_num, r.row_num);
        assert_eq!(r.primary_key(), None);
    }

    #[test]
    fn match_result_update_iff_remote_id() {
        assert_eq!(MatchResult::create().remote_id, None);
        let m = MatchResult::by_secondary_key("abc");
        assert_eq!(m.action, MatchAction::Update);
        assert_eq!(m.matched_by, MatchedBy::SecondaryKey);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["action"], "UPDATE");
        assert_eq!(json["matchedBy"], "secondaryKey");
    }

    #[test]
    fn job_picks_pending_chunks_in_enqueue_order() {
        let mut job = Job::new(
            JobType::Import,
            ResourceType::Company,
            JobParams::default(),
            vec![
                ChunkRange::Rows { start: 0, end: 50 },
                ChunkRange::Rows { start: 50, end: 100 },
            ],
        );
        assert_eq!(job.next_pending(), Some(0));
        job.chunks[0].status = RunStatus::Completed;
        assert_eq!(job.next_pending(), Some(1));
        job.chunks[1].status = RunStatus::Failed;
        assert!(job.all_chunks_terminal());
        assert_eq!(job.terminal_status(), RunStatus::Completed);
        let appended = job.push_chunk(ChunkRange::Page { cursor: None });
        assert_eq!(appended, 2);
        assert_eq!(job.next_pending(), Some(2));
    }

    #[test]
    fn split_keeps_row_order() {
        let mut job = Job::new(
            JobType::Import,
            ResourceType::Note,
            JobParams::default(),
            vec![
                ChunkRange::Rows { start: 0, end: 50 },
                ChunkRange::Rows { start: 50, end: 70 },
            ],
        );
        assert_eq!(job.split_rows_chunk(0, 12), Some(1));
        assert_eq!(job.chunks[0].range, ChunkRange::Rows { start: 0, end: 12 });
        assert_eq!(job.chunks[1].range, ChunkRange::Rows { start: 12, end: 50 });
        assert_eq!(job.chunks[2].index, 2);
        assert_eq!(job.split_rows_chunk(2, 20), None);
    }

    #[test]
    fn summaries_accumulate() {
        let mut total = SyncSummary::default();
        let mut chunk = SyncSummary {
            created: 2,
            updated: 1,
            ..Default::default()
        };
        chunk.record_error(RowError::field(7, "email", "invalid email"));
        total.absorb(&chunk);
        total.absorb(&chunk);
        assert_eq!(total.created, 4);
        assert_eq!(total.errors, 2);
        assert_eq!(total.row_errors[0].to_string(), "row 7 (email): invalid email");
    }

    #[test]
    fn failed_outcome_keeps_matched_remote_id() {
        let outcome = RowOutcome::failed(4, Some(MatchResult::by_primary_key("c-9")), "http 422");
        assert!(outcome.is_error());
        assert_eq!(outcome.remote_id.as_deref(), Some("c-9"));
        assert!(RowOutcome::failed(5, None, "invalid").remote_id.is_none());
    }

    #[test]
    fn resource_type_parses_plural_names() {
        assert_eq!("Companies".parse::<ResourceType>(), Ok(ResourceType::Company));
        assert!("widgets".parse::<ResourceType>().is_err());
    }
}
