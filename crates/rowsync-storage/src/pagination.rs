//! Lazy page iteration over offset- and cursor-paginated listings.

use async_trait::async_trait;
use reqwest::Method;
use rowsync_core::PageCursor;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::client::{ApiClient, ApiError};
use crate::paths::{scratch_url, with_query};

pub const DEFAULT_MAX_PAGES: usize = 1000;

const CURSOR_PARAM: &str = "pageCursor";

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<JsonValue>,
    /// Where the following page starts; `None` on the last page.
    pub next: Option<PageCursor>,
    pub total: Option<u64>,
}

/// Fetches one page of a listing at a given position.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page, ApiError>;
}

#[async_trait]
impl<T: PageFetcher + ?Sized> PageFetcher for Box<T> {
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page, ApiError> {
        (**self).fetch_page(cursor).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStyle {
    Offset { limit: u32 },
    Cursor,
}

/// Offset continuation: by reported total when present, else while pages come back full.
pub fn offset_continuation(
    offset: u64,
    limit: u32,
    returned: usize,
    total: Option<u64>,
) -> Option<PageCursor> {
    let limit = u64::from(limit);
    let more = match total {
        Some(total) => offset + limit < total,
        None => limit > 0 && returned as u64 == limit,
    };
    more.then(|| PageCursor::Offset(offset + limit))
}

/// Opaque cursor token from a `links.next` URL, absolute or relative.
pub fn cursor_from_next_link(link: &str) -> Option<String> {
    let url = scratch_url(link).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == CURSOR_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn page_items(body: &JsonValue) -> Vec<JsonValue> {
    match body {
        JsonValue::Array(items) => items.clone(),
        _ => body
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default(),
    }
}

fn page_total(body: &JsonValue) -> Option<u64> {
    body.pointer("/meta/total")
        .or_else(|| body.get("totalResults"))
        .and_then(|v| v.as_u64())
}

/// A listing endpoint read through the rate-limited client.
#[derive(Debug, Clone)]
pub struct EndpointPages<'a> {
    client: &'a ApiClient,
    path: String,
    style: PageStyle,
}

impl<'a> EndpointPages<'a> {
    pub fn new(client: &'a ApiClient, path: impl Into<String>, style: PageStyle) -> Self {
        Self {
            client,
            path: path.into(),
            style,
        }
    }
}

#[async_trait]
impl PageFetcher for EndpointPages<'_> {
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page, ApiError> {
        match self.style {
            PageStyle::Offset { limit } => {
                let offset = match cursor {
                    Some(PageCursor::Offset(offset)) => *offset,
                    _ => 0,
                };
                let path = with_query(
                    &self.path,
                    &[("pageOffset", offset.to_string()), ("pageLimit", limit.to_string())],
                )?;
                let body = self.client.send(Method::GET, &path, None).await?;
                let items = page_items(&body);
                let total = page_total(&body);
                let next = offset_continuation(offset, limit, items.len(), total);
                Ok(Page { items, next, total })
            }
            PageStyle::Cursor => {
                let path = match cursor {
                    Some(PageCursor::Token(token)) => {
                        with_query(&self.path, &[(CURSOR_PARAM, token.clone())])?
                    }
                    _ => self.path.clone(),
                };
                let body = self.client.send(Method::GET, &path, None).await?;
                let next = body
                    .pointer("/links/next")
                    .and_then(|v| v.as_str())
                    .and_then(cursor_from_next_link)
                    .map(PageCursor::Token);
                Ok(Page {
                    items: page_items(&body),
                    next,
                    total: page_total(&body),
                })
            }
        }
    }
}

/// Finite, non-restartable page sequence with loop and runaway protection.
#[derive(Debug)]
pub struct Paginator<F> {
    fetcher: F,
    cursor: Option<PageCursor>,
    pages_fetched: usize,
    max_pages: usize,
    exhausted: bool,
    truncated: bool,
    warnings: Vec<String>,
}

impl<F: PageFetcher> Paginator<F> {
    pub fn new(fetcher: F, max_pages: usize) -> Self {
        Self::resume(fetcher, None, max_pages)
    }

    /// Continue a listing from a previously reported position.
    pub fn resume(fetcher: F, cursor: Option<PageCursor>, max_pages: usize) -> Self {
        Self {
            fetcher,
            cursor,
            pages_fetched: 0,
            max_pages: max_pages.max(1),
            exhausted: false,
            truncated: false,
            warnings: Vec::new(),
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Page>, ApiError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            self.stop_with_warning(format!(
                "pagination stopped after {} pages; listing truncated",
                self.max_pages
            ));
            return Ok(None);
        }

        let page = self.fetcher.fetch_page(self.cursor.as_ref()).await?;
        self.pages_fetched += 1;

        match &page.next {
            None => self.exhausted = true,
            Some(next) if self.cursor.as_ref() == Some(next) => {
                self.stop_with_warning(format!(
                    "remote returned the same page cursor twice ({next:?}); pagination stopped"
                ));
            }
            Some(next) => self.cursor = Some(next.clone()),
        }
        Ok(Some(page))
    }

    fn stop_with_warning(&mut self, message: String) {
        warn!(pages = self.pages_fetched, "{message}");
        self.exhausted = true;
        self.truncated = true;
        self.warnings.push(message);
    }

    /// Position of the next unread page, `None` once the listing is exhausted.
    pub fn continuation(&self) -> Option<&PageCursor> {
        if self.exhausted {
            None
        } else {
            self.cursor.as_ref()
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Drain every remaining page into one item list plus any safety warnings.
    pub async fn collect_all(mut self) -> Result<(Vec<JsonValue>, Vec<String>), ApiError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.items);
        }
        Ok((items, self.warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedPages {
        pages: Mutex<Vec<Page>>,
        seen: Mutex<Vec<Option<PageCursor>>>,
    }

    impl ScriptedPages {
        fn new(mut pages: Vec<Page>) -> Self {
            pages.reverse();
            Self {
                pages: Mutex::new(pages),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedPages {
        async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page, ApiError> {
            self.seen.lock().unwrap().push(cursor.cloned());
            Ok(self.pages.lock().unwrap().pop().expect("scripted page"))
        }
    }

    fn page(n: usize, next: Option<&str>) -> Page {
        Page {
            items: (0..n).map(|i| serde_json::json!({ "id": i })).collect(),
            next: next.map(|t| PageCursor::Token(t.to_string())),
            total: None,
        }
    }

    #[test]
    fn offset_rules_use_total_when_reported() {
        assert_eq!(
            offset_continuation(0, 100, 100, None),
            Some(PageCursor::Offset(100))
        );
        assert_eq!(offset_continuation(100, 100, 40, None), None);
        assert_eq!(offset_continuation(0, 100, 100, Some(100)), None);
        assert_eq!(
            offset_continuation(0, 100, 100, Some(250)),
            Some(PageCursor::Offset(100))
        );
    }

    #[test]
    fn next_link_cursor_extraction() {
        assert_eq!(
            cursor_from_next_link("https://api.example.test/notes?pageCursor=abc%3D%3D"),
            Some("abc==".to_string())
        );
        assert_eq!(
            cursor_from_next_link("/notes?pageLimit=10&pageCursor=xyz"),
            Some("xyz".to_string())
        );
        assert_eq!(cursor_from_next_link("/notes?pageCursor="), None);
    }

    #[tokio::test]
    async fn follows_cursors_until_absent() {
        let fetcher = ScriptedPages::new(vec![
            page(2, Some("c1")),
            page(2, Some("c2")),
            page(1, None),
        ]);
        let mut paginator = Paginator::new(fetcher, DEFAULT_MAX_PAGES);
        let mut total = 0;
        while let Some(p) = paginator.next_page().await.unwrap() {
            total += p.items.len();
        }
        assert_eq!(total, 5);
        assert!(paginator.is_exhausted());
        assert!(!paginator.truncated());
        assert!(paginator.next_page().await.unwrap().is_none());
        let seen = paginator.fetcher.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                None,
                Some(PageCursor::Token("c1".into())),
                Some(PageCursor::Token("c2".into()))
            ]
        );
    }

    #[tokio::test]
    async fn repeated_cursor_terminates_with_warning() {
        let fetcher = ScriptedPages::new(vec![
            page(2, Some("loop")),
            page(2, Some("loop")),
            page(2, Some("loop")),
        ]);
        let (items, warnings) = Paginator::new(fetcher, DEFAULT_MAX_PAGES)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("same page cursor"));
    }

    #[tokio::test]
    async fn page_ceiling_truncates() {
        let fetcher = ScriptedPages::new(vec![
            page(1, Some("a")),
            page(1, Some("b")),
            page(1, Some("c")),
        ]);
        let mut paginator = Paginator::new(fetcher, 2);
        assert!(paginator.next_page().await.unwrap().is_some());
        assert!(paginator.next_page().await.unwrap().is_some());
        assert!(paginator.next_page().await.unwrap().is_none());
        assert!(paginator.truncated());
        assert_eq!(paginator.warnings().len(), 1);
        assert_eq!(paginator.continuation(), None);
    }

    #[tokio::test]
    async fn resume_reports_continuation_between_pages() {
        let fetcher = ScriptedPages::new(vec![page(3, Some("p3")), page(3, None)]);
        let mut paginator =
            Paginator::resume(fetcher, Some(PageCursor::Token("p2".into())), DEFAULT_MAX_PAGES);
        paginator.next_page().await.unwrap();
        assert_eq!(paginator.continuation(), Some(&PageCursor::Token("p3".into())));
        paginator.next_page().await.unwrap();
        assert_eq!(paginator.continuation(), None);
    }
}
