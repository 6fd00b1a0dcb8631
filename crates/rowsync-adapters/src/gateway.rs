//! The remote service as the reconciliation engine sees it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use rowsync_storage::{
    with_query, with_segments, ApiClient, ApiError, EndpointPages, PageFetcher,
};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::resources::ResourceStrategy;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    AlreadyLinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Calls across both API generations. Write calls go through the older
/// generation; secondary-key queries and backfill patches through the newer one.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn find_by_secondary(
        &self,
        strategy: &dyn ResourceStrategy,
        key: &str,
    ) -> Result<Option<String>, ApiError>;

    async fn primary_exists(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<bool, ApiError>;

    /// Returns the id assigned by the remote service.
    async fn create(
        &self,
        strategy: &dyn ResourceStrategy,
        payload: &JsonValue,
    ) -> Result<String, ApiError>;

    async fn update(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        payload: &JsonValue,
    ) -> Result<(), ApiError>;

    async fn backfill(
        &self,
        id: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), ApiError>;

    async fn link(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        target_id: &str,
    ) -> Result<LinkOutcome, ApiError>;

    async fn delete(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<DeleteOutcome, ApiError>;

    async fn fetch_relationships(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<Vec<String>, ApiError>;

    fn listing<'a>(&'a self, strategy: &dyn ResourceStrategy) -> Box<dyn PageFetcher + 'a>;

    async fn reset_rate_limit(&self);
}

/// Record id from a create response: `data.id`, else `id`.
pub fn created_id(body: &JsonValue) -> Option<String> {
    body.pointer("/data/id")
        .or_else(|| body.get("id"))
        .and_then(|v| match v {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn ids_in(body: &JsonValue) -> Vec<String> {
    body.get("data")
        .and_then(|d| d.as_array())
        .map(|items| items.iter().filter_map(created_id).collect())
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct HttpGateway {
    client: ApiClient,
    page_limit: u32,
}

impl HttpGateway {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    fn record_path(
        strategy: &dyn ResourceStrategy,
        id: &str,
        rest: &[&str],
    ) -> Result<String, ApiError> {
        let mut segments = vec![id];
        segments.extend_from_slice(rest);
        with_segments(strategy.collection_path(), &segments)
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn find_by_secondary(
        &self,
        strategy: &dyn ResourceStrategy,
        key: &str,
    ) -> Result<Option<String>, ApiError> {
        let path = with_query(
            "/v2/entities",
            &[
                ("type", strategy.match_strategy().query_type.to_string()),
                ("sourceRecordId", key.to_string()),
            ],
        )?;
        let body = self.client.send(Method::GET, &path, None).await?;
        Ok(ids_in(&body).into_iter().next())
    }

    async fn primary_exists(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<bool, ApiError> {
        let path = Self::record_path(strategy, id, &[])?;
        match self.client.send(Method::GET, &path, None).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create(
        &self,
        strategy: &dyn ResourceStrategy,
        payload: &JsonValue,
    ) -> Result<String, ApiError> {
        let path = strategy.collection_path();
        let body = strategy.create_envelope().wrap(payload);
        let response = self.client.send(Method::POST, path, Some(&body)).await?;
        created_id(&response).ok_or_else(|| ApiError::Decode {
            method: Method::POST.to_string(),
            path: path.to_string(),
            message: "create response carried no record id".to_string(),
        })
    }

    async fn update(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        payload: &JsonValue,
    ) -> Result<(), ApiError> {
        let path = Self::record_path(strategy, id, &[])?;
        let body = strategy.update_envelope().wrap(payload);
        self.client.send(Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }

    async fn backfill(
        &self,
        id: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), ApiError> {
        let path = with_segments("/v2/entities", &[id])?;
        let body = json!({ "data": { "fields": fields } });
        self.client.send(Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }

    async fn link(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
        target_id: &str,
    ) -> Result<LinkOutcome, ApiError> {
        let path = Self::record_path(strategy, id, &["links", target_id])?;
        match self.client.send(Method::POST, &path, None).await {
            Ok(_) => Ok(LinkOutcome::Linked),
            Err(err) if err.is_conflict() => {
                debug!(remote_id = id, target_id, "link already present");
                Ok(LinkOutcome::AlreadyLinked)
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<DeleteOutcome, ApiError> {
        let path = Self::record_path(strategy, id, &[])?;
        match self.client.send(Method::DELETE, &path, None).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }

    async fn fetch_relationships(
        &self,
        strategy: &dyn ResourceStrategy,
        id: &str,
    ) -> Result<Vec<String>, ApiError> {
        if !strategy.supports_links() {
            return Ok(Vec::new());
        }
        let path = Self::record_path(strategy, id, &["links"])?;
        let body = self.client.send(Method::GET, &path, None).await?;
        Ok(ids_in(&body))
    }

    fn listing<'a>(&'a self, strategy: &dyn ResourceStrategy) -> Box<dyn PageFetcher + 'a> {
        Box::new(EndpointPages::new(
            &self.client,
            strategy.collection_path(),
            strategy.page_style(self.page_limit),
        ))
    }

    async fn reset_rate_limit(&self) {
        self.client.reset_rate_limit().await;
    }
}
