//! Page-bounded export of a remote listing into CSV.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use rowsync_adapters::{created_id, CsvExportWriter, RemoteGateway, ResourceStrategy};
use rowsync_core::{PageCursor, SyncSummary};
use rowsync_storage::{Paginator, DEFAULT_MAX_PAGES};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::progress::ProgressSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Pages read by one chunk before it hands off a continuation.
    pub pages_per_chunk: usize,
    pub max_pages: usize,
    pub relationship_concurrency: usize,
    pub relationship_pause: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            pages_per_chunk: 10,
            max_pages: DEFAULT_MAX_PAGES,
            relationship_concurrency: 5,
            relationship_pause: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportChunk {
    pub summary: SyncSummary,
    /// Where the next chunk starts; `None` once the listing is exhausted.
    pub continuation: Option<PageCursor>,
    pub pages: usize,
    pub cancelled: bool,
}

/// Export up to `options.pages_per_chunk` pages starting at `start`.
pub async fn export_pages(
    gateway: &dyn RemoteGateway,
    strategy: &dyn ResourceStrategy,
    start: Option<PageCursor>,
    options: &ExportOptions,
    writer: &mut CsvExportWriter,
    progress: &ProgressSender,
) -> Result<ExportChunk> {
    let span = info_span!("export", resource = %strategy.resource(), start = ?start);
    async move {
        let mut paginator = Paginator::resume(gateway.listing(strategy), start, options.max_pages);
        let mut chunk = ExportChunk::default();

        while paginator.pages_fetched() < options.pages_per_chunk.max(1) {
            if progress.is_cancelled() {
                chunk.cancelled = true;
                break;
            }
            let Some(page) = paginator
                .next_page()
                .await
                .context("reading export page")?
            else {
                break;
            };
            let links =
                fetch_relationships(gateway, strategy, &page.items, options, &mut chunk.summary)
                    .await;
            for (item, item_links) in page.items.iter().zip(links) {
                writer
                    .write_row(&strategy.export_row(item, &item_links))
                    .context("writing export row")?;
                chunk.summary.exported += 1;
            }
            progress
                .info(format!(
                    "page {}: {} records exported",
                    paginator.pages_fetched(),
                    chunk.summary.exported
                ))
                .await;
        }

        for warning in paginator.warnings() {
            progress.warn(warning.clone()).await;
            chunk.summary.record_warning(warning.clone());
        }
        chunk.pages = paginator.pages_fetched();
        chunk.continuation = paginator.continuation().cloned();
        debug!(pages = chunk.pages, more = chunk.continuation.is_some(), "export chunk read");
        Ok::<_, anyhow::Error>(chunk)
    }
    .instrument(span)
    .await
}

/// Relationship ids per item, fetched in fixed-size concurrent batches.
async fn fetch_relationships(
    gateway: &dyn RemoteGateway,
    strategy: &dyn ResourceStrategy,
    items: &[JsonValue],
    options: &ExportOptions,
    summary: &mut SyncSummary,
) -> Vec<Vec<String>> {
    if !strategy.supports_links() {
        return vec![Vec::new(); items.len()];
    }
    let ids: Vec<Option<String>> = items.iter().map(created_id).collect();
    let mut out = Vec::with_capacity(items.len());
    let batches: Vec<&[Option<String>]> =
        ids.chunks(options.relationship_concurrency.max(1)).collect();
    let batch_count = batches.len();

    for (n, batch) in batches.into_iter().enumerate() {
        let results = join_all(batch.iter().map(|id| async move {
            match id {
                Some(id) => Some((id.as_str(), gateway.fetch_relationships(strategy, id).await)),
                None => None,
            }
        }))
        .await;
        for result in results {
            match result {
                Some((_, Ok(links))) => out.push(links),
                Some((id, Err(err))) => {
                    summary.record_warning(format!(
                        "relationships for {id} unavailable: {}",
                        err.summary()
                    ));
                    out.push(Vec::new());
                }
                None => out.push(Vec::new()),
            }
        }
        if n + 1 < batch_count && !options.relationship_pause.is_zero() {
            tokio::time::sleep(options.relationship_pause).await;
        }
    }
    out
}
