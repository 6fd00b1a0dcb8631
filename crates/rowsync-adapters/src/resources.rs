//! Per-resource field vocabularies and write rules.

use std::collections::BTreeMap;

use rowsync_core::{InputRow, MatchAction, ResourceType, RowError, PRIMARY_KEY_FIELD};
use rowsync_storage::{ApiError, PageStyle};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Mapped columns with this prefix are free-form custom fields.
pub const CUSTOM_FIELD_PREFIX: &str = "custom.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Email,
    Url,
    Bool,
    /// `;`- or `,`-separated values.
    List,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    /// Carried by the primary write at this dotted attribute path.
    Primary(&'static str),
    /// Only settable through the query generation, under this key.
    Backfill(&'static str),
    /// Ids linked to the record after the primary write.
    Link,
    /// Used for matching only.
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub target: FieldTarget,
    pub required_on_create: bool,
}

const fn field(name: &'static str, kind: FieldKind, target: FieldTarget) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        target,
        required_on_create: false,
    }
}

const fn required(name: &'static str, kind: FieldKind, target: FieldTarget) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        target,
        required_on_create: true,
    }
}

/// How a write body is wrapped for one particular call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Bare,
    Data,
}

impl Envelope {
    pub fn wrap(self, payload: &JsonValue) -> JsonValue {
        match self {
            Envelope::Bare => payload.clone(),
            Envelope::Data => serde_json::json!({ "data": payload }),
        }
    }
}

/// Which keys the engine consults, in priority order, to resolve a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStrategy {
    /// `type` filter for secondary-key queries against the query generation.
    pub query_type: &'static str,
    pub use_secondary_key: bool,
    pub use_primary_key: bool,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("field `{field}` has invalid value `{value}` ({kind:?} expected)")]
    InvalidValue {
        field: String,
        value: String,
        kind: FieldKind,
    },
}

/// Built request for one row: the primary-write attributes plus follow-up work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePlan {
    pub payload: JsonValue,
    pub backfill: BTreeMap<String, JsonValue>,
    pub links: Vec<String>,
    /// Field name -> (attribute path, value) for everything in `payload`.
    sent: BTreeMap<String, (String, JsonValue)>,
}

impl WritePlan {
    fn new() -> Self {
        Self {
            payload: JsonValue::Object(Map::new()),
            ..Default::default()
        }
    }

    fn set_primary(&mut self, name: &str, path: &str, value: JsonValue) {
        set_path(&mut self.payload, path, value.clone());
        self.sent.insert(name.to_string(), (path.to_string(), value));
    }

    pub fn carries(&self, name: &str) -> bool {
        self.sent.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.backfill.is_empty() && self.links.is_empty()
    }

    /// Drop `name` from the primary payload and queue it for backfill under
    /// its remote attribute path.
    pub fn strip(&mut self, name: &str) -> bool {
        let Some((path, value)) = self.sent.remove(name) else {
            return false;
        };
        remove_path(&mut self.payload, &path);
        self.backfill.insert(path, value);
        true
    }
}

fn set_path(target: &mut JsonValue, path: &str, value: JsonValue) {
    let mut cur = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !cur.is_object() {
            *cur = JsonValue::Object(Map::new());
        }
        let Some(obj) = cur.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            obj.insert(segment.to_string(), value);
            return;
        }
        cur = obj
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

fn remove_path(target: &mut JsonValue, path: &str) {
    let Some((head, rest)) = path.split_once('.') else {
        if let Some(obj) = target.as_object_mut() {
            obj.remove(path);
        }
        return;
    };
    let emptied = match target.get_mut(head) {
        Some(child) => {
            remove_path(child, rest);
            child.as_object().is_some_and(|o| o.is_empty())
        }
        None => false,
    };
    if emptied {
        if let Some(obj) = target.as_object_mut() {
            obj.remove(head);
        }
    }
}

/// Read a dotted attribute path.
pub fn get_path<'a>(source: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(source, |cur, segment| cur.get(segment))
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && domain.contains('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

fn looks_like_url(value: &str) -> bool {
    reqwest::Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Convert one raw cell into the JSON value sent remotely.
pub fn convert_value(spec: &FieldSpec, raw: &str) -> Result<JsonValue, StrategyError> {
    let invalid = || StrategyError::InvalidValue {
        field: spec.name.to_string(),
        value: raw.to_string(),
        kind: spec.kind,
    };
    match spec.kind {
        FieldKind::Text | FieldKind::Id => Ok(JsonValue::String(raw.to_string())),
        FieldKind::Email if looks_like_email(raw) => {
            Ok(JsonValue::String(raw.to_ascii_lowercase()))
        }
        FieldKind::Url if looks_like_url(raw) => Ok(JsonValue::String(raw.to_string())),
        FieldKind::Bool => parse_bool(raw).map(JsonValue::Bool).ok_or_else(invalid),
        FieldKind::List => Ok(JsonValue::Array(
            split_list(raw).into_iter().map(JsonValue::String).collect(),
        )),
        FieldKind::Email | FieldKind::Url => Err(invalid()),
    }
}

/// Resource-specific write rules selected by [`strategy_for`].
pub trait ResourceStrategy: Send + Sync {
    fn resource(&self) -> ResourceType;
    fn fields(&self) -> &'static [FieldSpec];
    fn collection_path(&self) -> &'static str;
    fn page_style(&self, page_limit: u32) -> PageStyle;
    fn create_envelope(&self) -> Envelope;
    fn update_envelope(&self) -> Envelope;

    fn match_strategy(&self) -> MatchStrategy {
        MatchStrategy {
            query_type: self.resource().as_str(),
            use_secondary_key: true,
            use_primary_key: true,
        }
    }

    /// Fields the remote may reject as unresolvable; stripped and backfilled once.
    fn strippable_fields(&self) -> &'static [&'static str] {
        &["owner"]
    }

    fn accepts_custom_fields(&self) -> bool {
        false
    }

    fn supports_links(&self) -> bool {
        self.fields().iter().any(|f| f.target == FieldTarget::Link)
    }

    fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    fn knows_field(&self, name: &str) -> bool {
        self.field(name).is_some()
            || (self.accepts_custom_fields() && name.starts_with(CUSTOM_FIELD_PREFIX))
    }

    /// Local shape checks; failing rows are never sent.
    fn validate(&self, row: &InputRow, action: MatchAction) -> Vec<RowError> {
        let mut errors = Vec::new();
        for spec in self.fields() {
            match row.get(spec.name) {
                Some(raw) => {
                    if let Err(err) = convert_value(spec, raw) {
                        errors.push(RowError::field(row.row_num, spec.name, err.to_string()));
                    }
                }
                None if spec.required_on_create && action == MatchAction::Create => {
                    errors.push(RowError::field(
                        row.row_num,
                        spec.name,
                        format!("`{}` is required to create a {}", spec.name, self.resource()),
                    ));
                }
                None => {}
            }
        }
        errors
    }

    /// Sparse write plan: only non-empty mapped values are carried.
    fn build_plan(&self, row: &InputRow) -> Result<WritePlan, StrategyError> {
        let mut plan = WritePlan::new();
        for (name, raw) in row.present_fields() {
            if let Some(spec) = self.field(name) {
                let value = convert_value(spec, raw)?;
                match spec.target {
                    FieldTarget::Primary(path) => plan.set_primary(name, path, value),
                    FieldTarget::Backfill(key) => {
                        plan.backfill.insert(key.to_string(), value);
                    }
                    FieldTarget::Link => plan.links.extend(split_list(raw)),
                    FieldTarget::Key => {}
                }
            } else if self.accepts_custom_fields() {
                if let Some(custom) = name.strip_prefix(CUSTOM_FIELD_PREFIX) {
                    plan.backfill
                        .insert(custom.to_string(), JsonValue::String(raw.to_string()));
                }
            }
        }
        Ok(plan)
    }

    fn build_create_payload(&self, row: &InputRow) -> Result<WritePlan, StrategyError> {
        self.build_plan(row)
    }

    fn build_update_payload(&self, row: &InputRow) -> Result<WritePlan, StrategyError> {
        self.build_plan(row)
    }

    /// The strippable field a structured rejection points at, if it is in `plan`.
    fn unsettable_field(&self, err: &ApiError, plan: &WritePlan) -> Option<&'static str> {
        let status = err.status()?;
        if !(400..500).contains(&status) || status == 404 || status == 429 {
            return None;
        }
        let problems = err.problems();
        self.strippable_fields()
            .iter()
            .copied()
            .filter(|name| plan.carries(name))
            .find(|name| {
                let remote = match self.field(name).map(|spec| spec.target) {
                    Some(FieldTarget::Primary(path)) => path.rsplit('.').next().unwrap_or(path),
                    _ => *name,
                };
                let remote_lower = remote.to_ascii_lowercase();
                problems.iter().any(|p| {
                    let pointer_hit = p
                        .source
                        .as_ref()
                        .and_then(|s| s.pointer.as_deref().or(s.parameter.as_deref()))
                        .and_then(|ptr| ptr.rsplit(['/', '.']).next())
                        .is_some_and(|last| last == *name || last == remote);
                    let text_hit = p
                        .detail
                        .as_deref()
                        .or(p.title.as_deref())
                        .map(str::to_ascii_lowercase)
                        .is_some_and(|text| text.contains(name) || text.contains(&remote_lower));
                    pointer_hit || text_hit
                })
            })
    }

    /// Columns written by an export, in order.
    fn export_columns(&self) -> Vec<&'static str> {
        self.fields()
            .iter()
            .filter(|f| !matches!(f.target, FieldTarget::Backfill(_)))
            .map(|f| f.name)
            .collect()
    }

    /// Flatten one listed record into export cells.
    fn export_row(&self, record: &JsonValue, links: &[String]) -> BTreeMap<String, String> {
        let attributes = record.get("attributes").unwrap_or(record);
        let mut out = BTreeMap::new();
        for spec in self.fields() {
            let value = match spec.target {
                FieldTarget::Key if spec.name == PRIMARY_KEY_FIELD => {
                    record.get("id").map(cell_text)
                }
                FieldTarget::Primary(path) => get_path(attributes, path).map(cell_text),
                FieldTarget::Link => Some(links.join(";")),
                FieldTarget::Key | FieldTarget::Backfill(_) => continue,
            };
            out.insert(spec.name.to_string(), value.unwrap_or_default());
        }
        out
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(cell_text).collect::<Vec<_>>().join(";"),
        other => other.to_string(),
    }
}

const COMPANY_FIELDS: &[FieldSpec] = &[
    field("id", FieldKind::Id, FieldTarget::Key),
    field("source_record_id", FieldKind::Text, FieldTarget::Primary("source.recordId")),
    required("name", FieldKind::Text, FieldTarget::Primary("name")),
    field("domain", FieldKind::Text, FieldTarget::Primary("domain")),
    field("website", FieldKind::Url, FieldTarget::Primary("website")),
    field("email", FieldKind::Email, FieldTarget::Primary("email")),
    field("phone", FieldKind::Text, FieldTarget::Primary("phone")),
    field("owner", FieldKind::Email, FieldTarget::Primary("owner")),
];

const NOTE_FIELDS: &[FieldSpec] = &[
    field("id", FieldKind::Id, FieldTarget::Key),
    field("source_record_id", FieldKind::Text, FieldTarget::Primary("source.recordId")),
    required("title", FieldKind::Text, FieldTarget::Primary("title")),
    field("content", FieldKind::Text, FieldTarget::Primary("content")),
    field("owner", FieldKind::Email, FieldTarget::Primary("owner")),
    field("processed", FieldKind::Bool, FieldTarget::Backfill("processed")),
    field("archived", FieldKind::Bool, FieldTarget::Backfill("archived")),
    field("creator_email", FieldKind::Email, FieldTarget::Backfill("creator")),
    field("linked_entity_ids", FieldKind::List, FieldTarget::Link),
];

const ENTITY_FIELDS: &[FieldSpec] = &[
    field("id", FieldKind::Id, FieldTarget::Key),
    field("source_record_id", FieldKind::Text, FieldTarget::Primary("source.recordId")),
    required("name", FieldKind::Text, FieldTarget::Primary("name")),
    required("kind", FieldKind::Text, FieldTarget::Primary("type")),
    field("parent_id", FieldKind::Id, FieldTarget::Primary("parentId")),
    field("description", FieldKind::Text, FieldTarget::Primary("description")),
    field("owner", FieldKind::Email, FieldTarget::Primary("owner")),
    field("status", FieldKind::Text, FieldTarget::Backfill("status")),
    field("archived", FieldKind::Bool, FieldTarget::Backfill("archived")),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct CompanyStrategy;

impl ResourceStrategy for CompanyStrategy {
    fn resource(&self) -> ResourceType {
        ResourceType::Company
    }

    fn fields(&self) -> &'static [FieldSpec] {
        COMPANY_FIELDS
    }

    fn collection_path(&self) -> &'static str {
        "/companies"
    }

    fn page_style(&self, page_limit: u32) -> PageStyle {
        PageStyle::Offset { limit: page_limit }
    }

    fn create_envelope(&self) -> Envelope {
        Envelope::Bare
    }

    fn update_envelope(&self) -> Envelope {
        Envelope::Data
    }

    fn accepts_custom_fields(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoteStrategy;

impl ResourceStrategy for NoteStrategy {
    fn resource(&self) -> ResourceType {
        ResourceType::Note
    }

    fn fields(&self) -> &'static [FieldSpec] {
        NOTE_FIELDS
    }

    fn collection_path(&self) -> &'static str {
        "/notes"
    }

    fn page_style(&self, _page_limit: u32) -> PageStyle {
        PageStyle::Cursor
    }

    fn create_envelope(&self) -> Envelope {
        Envelope::Bare
    }

    fn update_envelope(&self) -> Envelope {
        Envelope::Data
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityStrategy;

impl ResourceStrategy for EntityStrategy {
    fn resource(&self) -> ResourceType {
        ResourceType::Entity
    }

    fn fields(&self) -> &'static [FieldSpec] {
        ENTITY_FIELDS
    }

    fn collection_path(&self) -> &'static str {
        "/entities"
    }

    fn page_style(&self, _page_limit: u32) -> PageStyle {
        PageStyle::Cursor
    }

    fn create_envelope(&self) -> Envelope {
        Envelope::Data
    }

    fn update_envelope(&self) -> Envelope {
        Envelope::Data
    }

    fn strippable_fields(&self) -> &'static [&'static str] {
        &["owner", "parent_id"]
    }

    fn accepts_custom_fields(&self) -> bool {
        true
    }
}

pub fn strategy_for(resource: ResourceType) -> Box<dyn ResourceStrategy> {
    match resource {
        ResourceType::Company => Box::new(CompanyStrategy),
        ResourceType::Note => Box::new(NoteStrategy),
        ResourceType::Entity => Box::new(EntityStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> InputRow {
        InputRow::new(
            3,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn company_plan_is_sparse_and_routes_custom_fields_to_backfill() {
        let r = row(&[
            ("name", "Acme"),
            ("domain", ""),
            ("source_record_id", "crm-1"),
            ("custom.tier", "gold"),
        ]);
        let plan = CompanyStrategy.build_create_payload(&r).unwrap();
        assert_eq!(
            plan.payload,
            json!({ "name": "Acme", "source": { "recordId": "crm-1" } })
        );
        assert_eq!(plan.backfill.get("tier"), Some(&json!("gold")));
        assert!(plan.links.is_empty());
    }

    #[test]
    fn note_plan_splits_backfill_and_links() {
        let r = row(&[
            ("title", "Call notes"),
            ("processed", "yes"),
            ("creator_email", "Ana@Example.com"),
            ("linked_entity_ids", "e-1; e-2"),
        ]);
        let plan = NoteStrategy.build_update_payload(&r).unwrap();
        assert_eq!(plan.payload, json!({ "title": "Call notes" }));
        assert_eq!(plan.backfill.get("processed"), Some(&json!(true)));
        assert_eq!(plan.backfill.get("creator"), Some(&json!("ana@example.com")));
        assert_eq!(plan.links, vec!["e-1", "e-2"]);
    }

    #[test]
    fn validation_reports_row_and_field() {
        let r = row(&[("email", "not-an-email"), ("website", "ftp://x")]);
        let errors = CompanyStrategy.validate(&r, MatchAction::Create);
        let fields: Vec<_> = errors.iter().filter_map(|e| e.field.as_deref()).collect();
        assert_eq!(fields, vec!["name", "website", "email"]);
        assert!(errors.iter().all(|e| e.row_num == Some(3)));

        let update_only = CompanyStrategy.validate(&row(&[("phone", "555")]), MatchAction::Update);
        assert!(update_only.is_empty());
    }

    #[test]
    fn strip_moves_field_from_payload_to_backfill() {
        let r = row(&[("name", "Depot"), ("kind", "site"), ("owner", "ghost@example.com")]);
        let mut plan = EntityStrategy.build_create_payload(&r).unwrap();
        let body = r#"{"errors":[{"code":"invalid_reference","detail":"Owner does not resolve","source":{"pointer":"/data/owner"}}]}"#;
        let err = ApiError::from_status("POST", "/entities", 422, None, body);
        assert_eq!(EntityStrategy.unsettable_field(&err, &plan), Some("owner"));

        assert!(plan.strip("owner"));
        assert_eq!(plan.payload, json!({ "name": "Depot", "type": "site" }));
        assert_eq!(plan.backfill.get("owner"), Some(&json!("ghost@example.com")));
        assert_eq!(EntityStrategy.unsettable_field(&err, &plan), None);
    }

    #[test]
    fn stripped_field_is_backfilled_under_its_remote_path() {
        let r = row(&[("name", "Bay 4"), ("kind", "room"), ("parent_id", "e-404")]);
        let mut plan = EntityStrategy.build_update_payload(&r).unwrap();
        let body = r#"{"errors":[{"detail":"parent not found","source":{"pointer":"/data/parentId"}}]}"#;
        let err = ApiError::from_status("PATCH", "/entities/e-1", 422, None, body);
        assert_eq!(EntityStrategy.unsettable_field(&err, &plan), Some("parent_id"));

        assert!(plan.strip("parent_id"));
        assert_eq!(plan.payload, json!({ "name": "Bay 4", "type": "room" }));
        assert_eq!(plan.backfill.get("parentId"), Some(&json!("e-404")));
        assert!(!plan.backfill.contains_key("parent_id"));
    }

    #[test]
    fn unrelated_rejections_are_not_stripped() {
        let plan = CompanyStrategy
            .build_create_payload(&row(&[("name", "A"), ("owner", "a@b.co")]))
            .unwrap();
        let taken = r#"{"errors":[{"detail":"name is taken"}]}"#;
        let conflict = ApiError::from_status("POST", "/companies", 422, None, taken);
        assert_eq!(CompanyStrategy.unsettable_field(&conflict, &plan), None);
        let server = ApiError::from_status("POST", "/companies", 500, None, "owner exploded");
        assert_eq!(CompanyStrategy.unsettable_field(&server, &plan), None);
    }

    #[test]
    fn envelopes_differ_per_call() {
        let body = json!({ "name": "A" });
        assert_eq!(CompanyStrategy.create_envelope().wrap(&body), body);
        assert_eq!(CompanyStrategy.update_envelope().wrap(&body), json!({ "data": body }));
        assert_eq!(EntityStrategy.create_envelope(), Envelope::Data);
    }

    #[test]
    fn export_row_flattens_attributes_and_links() {
        let record = json!({
            "id": "n-1",
            "attributes": { "title": "Hi", "source": { "recordId": "s-1" } }
        });
        let cells = NoteStrategy.export_row(&record, &["e-1".to_string(), "e-2".to_string()]);
        assert_eq!(cells["id"], "n-1");
        assert_eq!(cells["source_record_id"], "s-1");
        assert_eq!(cells["content"], "");
        assert_eq!(cells["linked_entity_ids"], "e-1;e-2");
        assert!(!cells.contains_key("processed"));
        assert_eq!(
            NoteStrategy.export_columns(),
            vec!["id", "source_record_id", "title", "content", "owner", "linked_entity_ids"]
        );
    }

    #[test]
    fn registry_covers_every_resource() {
        for resource in ResourceType::ALL {
            assert_eq!(strategy_for(resource).resource(), resource);
        }
        assert!(strategy_for(ResourceType::Note).supports_links());
        assert!(!strategy_for(ResourceType::Company).supports_links());
    }
}
