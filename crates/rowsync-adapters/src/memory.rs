//! In-process remote used for dry runs and engine tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use rowsync_core::{PageCursor, ResourceType};
use rowsync_storage::{ApiError, Page, PageFetcher, PageStyle};
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::Mutex;

use crate::gateway::{DeleteOutcome, LinkOutcome, RemoteGateway, DEFAULT_PAGE_LIMIT};
use crate::resources::{get_path, ResourceStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub resource: ResourceType,
    pub attributes: JsonValue,
    /// Fields written through the query generation.
    pub fields: BTreeMap<String, JsonValue>,
    pub links: BTreeSet<String>,
}

/// Every call the remote received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    FindBySecondary { key: String },
    Exists { id: String },
    Create { id: String },
    Update { id: String },
    Backfill { id: String, found: bool },
    Link { id: String, target_id: String },
    Delete { id: String },
    Relationships { id: String },
    ListPage,
}

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<String, StoredRecord>,
    next_id: u64,
    calls: Vec<RemoteCall>,
    /// Backfill 404s left before a record becomes visible to the query generation.
    unpropagated: HashMap<String, u32>,
    propagation_lag: u32,
    known_owners: Option<BTreeSet<String>>,
    failing_creates: BTreeSet<String>,
}

/// Deterministic stand-in for the remote service with the same observable rules:
/// sparse merges, backfill 404s until propagation, 409 on duplicate links,
/// 404 on deleting a missing record, 422 on an unresolvable owner.
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    page_limit: u32,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(method: &str, path: &str) -> ApiError {
    ApiError::from_status(
        method,
        path,
        404,
        None,
        r#"{"errors":[{"code":"not_found","title":"Record not found"}]}"#,
    )
}

fn merge(target: &mut JsonValue, patch: &JsonValue) {
    match (target, patch) {
        (JsonValue::Object(existing), JsonValue::Object(incoming)) => {
            for (key, value) in incoming {
                merge(
                    existing.entry(key.clone()).or_insert(JsonValue::Null),
                    value,
                );
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    /// Newly created records answer the first `attempts` backfills with 404.
    pub async fn set_propagation_lag(&self, attempts: u32) {
        self.state.lock().await.propagation_lag = attempts;
    }

    /// Restrict `owner` to these principals; anything else is rejected with 422.
    pub async fn set_known_owners<I, S>(&self, owners: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().await.known_owners =
            Some(owners.into_iter().map(Into::into).collect());
    }

    /// Reject creates whose `name` or `title` equals `value`.
    pub async fn fail_creates_named(&self, value: impl Into<String>) {
        self.state.lock().await.failing_creates.insert(value.into());
    }

    pub async fn insert(&self, resource: ResourceType, attributes: JsonValue) -> String {
        let mut state = self.state.lock().await;
        let id = Self::allocate_id(&mut state, resource);
        state.records.insert(
            id.clone(),
            StoredRecord {
                resource,
                attributes,
                fields: BTreeMap::new(),
                links: BTreeSet::new(),
            },
        );
        id
    }

    pub async fn get(&self, id: &str) -> Option<StoredRecord> {
        self.state.lock().await.records.get(id).cloned()
    }

    pub async fn count(&self, resource: ResourceType) -> usize {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.resource == resource)
            .count()
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    fn allocate_id(state: &mut RemoteState, resource: ResourceType) -> String {
        state.next_id += 1;
        format!("{}-{}", resource.as_str(), state.next_id)
    }

    fn check_owner(
        state: &RemoteState,
        method: &str,
        path: &str,
        payload: &JsonValue,
    ) -> Result<(), ApiError> {
        let (Some(known), Some(owner)) = (
            state.known_owners.as_ref(),
            payload.get("owner").and_then(|o| o.as_str()),
        ) else {
            return Ok(());
        };
        if known.contains(owner) {
            return Ok(());
        }
        let body = json!({
            "errors": [{
                "code": "invalid_reference",
                "title": "Invalid owner",
                "detail": format!("owner `{owner}` must be an existing member"),
                "source": { "pointer": "/data/owner" }
            }]
        });
        Err(ApiError::from_status(method, path, 422, None, body.to_string()))
    }

    async fn page(
        &self,
        resource: ResourceType,
        style: PageStyle,
        cursor: Option<&PageCursor>,
    ) -> Page {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::ListPage);
        let records: Vec<JsonValue> = state
            .records
            .iter()
            .filter(|(_, r)| r.resource == resource)
            .map(|(id, r)| json!({ "id": id, "attributes": r.attributes }))
            .collect();
        let total = records.len() as u64;
        let (offset, limit) = match (style, cursor) {
            (PageStyle::Offset { limit }, Some(PageCursor::Offset(offset))) => (*offset, limit),
            (PageStyle::Offset { limit }, _) => (0, limit),
            (PageStyle::Cursor, Some(PageCursor::Token(token))) => {
                (token.trim_start_matches("after-").parse().unwrap_or(0), self.page_limit)
            }
            (PageStyle::Cursor, _) => (0, self.page_limit),
        };
        let end = (offset + u64::from(limit)).min(total);
        let items = records
            .into_iter()
            .skip(offset as usize)
            .take((end.saturating_sub(offset)) as usize)
            .collect();
        let next = (end < total).then(|| match style {
            PageStyle::Offset { .. } => PageCursor::Offset(end),
            PageStyle::Cursor => PageCursor::Token(format!("after-{end}")),
        });
        Page {
            items,
            next,
            total: Some(total),
        }
    }
}

#[async_trait]
impl RemoteGateway for InMemoryRemote {
    async fn find_by_secondary(
        &self,
        strategy: &dyn ResourceStrategy,
        key: &str,
    ) -> Result<Option<String>, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::FindBySecondary { key: key.to_string() });
        let resource = strategy.resource();
        Ok(state
            .records
            .iter()
            .find(|(_, r)| {
                r.resource == resource
                    && get_path(&r.attributes, "source.recordId").and_then(|v| v.as_str())
                        == Some(key)
            })
            .map(|(id, _)| id.clone()))
    }

    async fn primary_exists(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<bool, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Exists { id: id.to_string() });
        let resource = strategy.resource();
        Ok(state.records.get(id).is_some_and(|r| r.resource == resource))
    }

    async fn create(
        &self,
        strategy: &dyn ResourceStrategy,
        payload: &JsonValue,
    ) -> Result<String, ApiError> {
        let mut state = self.state.lock().await;
        let path = strategy.collection_path();
        Self::check_owner(&state, "POST", path, payload)?;
        let label = payload
            .get("name")
            .or_else(|| payload.get("title"))
            .and_then(|v| v.as_str());
        if label.is_some_and(|l| state.failing_creates.contains(l)) {
            return Err(ApiError::from_status(
                "POST",
                path,
                400,
                None,
                r#"{"errors":[{"code":"rejected","detail":"record rejected by remote rules"}]}"#,
            ));
        }
        let resource = strategy.resource();
        let id = Self::allocate_id(&mut state, resource);
        let lag = state.propagation_lag;
        if lag > 0 {
            state.unpropagated.insert(id.clone(), lag);
        }
        state.records.insert(
            id.clone(),
            StoredRecord {
                resource,
                attributes: payload.clone(),
                fields: BTreeMap::new(),
                links: BTreeSet::new(),
            },
        );
        state.calls.push(RemoteCall::Create { id: id.clone() });
        Ok(id)
    }

    async fn update(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        payload: &JsonValue,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let path = format!("{}/{id}", strategy.collection_path());
        Self::check_owner(&state, "PATCH", &path, payload)?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| not_found("PATCH", &path))?;
        if !record.attributes.is_object() {
            record.attributes = JsonValue::Object(Map::new());
        }
        merge(&mut record.attributes, payload);
        state.calls.push(RemoteCall::Update { id: id.to_string() });
        Ok(())
    }

    async fn backfill(
        &self,
        id: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let path = format!("/v2/entities/{id}");
        let pending = state.unpropagated.get(id).copied().unwrap_or(0);
        if pending > 0 || !state.records.contains_key(id) {
            if pending > 1 {
                state.unpropagated.insert(id.to_string(), pending - 1);
            } else {
                state.unpropagated.remove(id);
            }
            state.calls.push(RemoteCall::Backfill {
                id: id.to_string(),
                found: false,
            });
            return Err(not_found("PATCH", &path));
        }
        if let Some(record) = state.records.get_mut(id) {
            record.fields.extend(fields.clone());
        }
        state.calls.push(RemoteCall::Backfill {
            id: id.to_string(),
            found: true,
        });
        Ok(())
    }

    async fn link(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        target_id: &str,
    ) -> Result<LinkOutcome, ApiError> {
        let mut state = self.state.lock().await;
        let path = format!("{}/{id}/links/{target_id}", strategy.collection_path());
        state.calls.push(RemoteCall::Link {
            id: id.to_string(),
            target_id: target_id.to_string(),
        });
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| not_found("POST", &path))?;
        if record.links.insert(target_id.to_string()) {
            Ok(LinkOutcome::Linked)
        } else {
            Ok(LinkOutcome::AlreadyLinked)
        }
    }

    async fn delete(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<DeleteOutcome, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Delete { id: id.to_string() });
        let resource = strategy.resource();
        let present = state.records.get(id).is_some_and(|r| r.resource == resource);
        if present {
            state.records.remove(id);
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    async fn fetch_relationships(
        &self,
        _strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<Vec<String>, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Relationships { id: id.to_string() });
        Ok(state
            .records
            .get(id)
            .map(|r| r.links.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn listing<'a>(&'a self, strategy: &dyn ResourceStrategy) -> Box<dyn PageFetcher + 'a> {
        Box::new(MemoryPages {
            remote: self,
            resource: strategy.resource(),
            style: strategy.page_style(self.page_limit),
        })
    }

    async fn reset_rate_limit(&self) {}
}

struct MemoryPages<'a> {
    remote: &'a InMemoryRemote,
    resource: ResourceType,
    style: PageStyle,
}

#[async_trait]
impl PageFetcher for MemoryPages<'_> {
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page, ApiError> {
        Ok(self.remote.page(self.resource, self.style, cursor).await)
    }
}
