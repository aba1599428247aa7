use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::StorageGateway;
use crate::error::Result;
use crate::extractor::Extractor;
use crate::fetcher::PageSource;
use crate::harvest::progress::FlushReport;
use crate::types::TransactionRecord;

/// Worker → coordinator messages. Workers share nothing else.
#[derive(Debug)]
pub enum WorkerEvent {
    PageFetched { worker: usize, page: u32, records: usize, latency: Duration },
    PageFailed { worker: usize, page: u32, reason: String },
    Flushing { worker: usize },
    Flushed(FlushReport),
    Finished { worker: usize, result: Result<WorkerSummary> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub pages_attempted: u32,
    pub pages_failed: u32,
    pub flushes: u32,
    /// Stopped after too many consecutive empty pages.
    pub exhausted: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub flush_threshold: usize,
    pub max_empty_pages: u32,
    pub page_delay: Duration,
}

/// Records waiting for the next flush, with the pages they came from.
#[derive(Default)]
struct Buffer {
    records: Vec<TransactionRecord>,
    pages: Vec<(u32, u32)>,
}

/// Walks one partition: fetch → extract → buffer → flush.
pub struct Worker {
    id: usize,
    pages: Vec<u32>,
    source: Arc<dyn PageSource>,
    extractor: Extractor,
    gateway: StorageGateway,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    settings: WorkerSettings,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        pages: Vec<u32>,
        source: Arc<dyn PageSource>,
        extractor: Extractor,
        gateway: StorageGateway,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
        settings: WorkerSettings,
    ) -> Self {
        Self { id, pages, source, extractor, gateway, events, cancel, settings }
    }

    /// Run to the end of the partition and report the outcome as the last event.
    pub async fn run(self) {
        let result = self.harvest().await;
        if let Err(e) = &result {
            warn!(worker = self.id, "Worker stopped on error: {e}");
        }
        let _ = self.events.send(WorkerEvent::Finished { worker: self.id, result }).await;
    }

    async fn harvest(&self) -> Result<WorkerSummary> {
        let first = self.pages.first().copied().unwrap_or_default();
        let last = self.pages.last().copied().unwrap_or_default();
        info!(worker = self.id, pages = self.pages.len(), first, last, "Worker started");

        let mut summary = WorkerSummary::default();
        let mut buffer = Buffer::default();
        let mut empty_streak = 0u32;
        // A descending walk starts past the end of data, so leading empties
        // only count once real records have shown up.
        let walks_up = first <= last;
        let mut seen_data = false;

        for (i, &page) in self.pages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if i > 0 && !self.settings.page_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.page_delay) => {}
                    _ = self.cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                }
            }

            summary.pages_attempted += 1;
            let Some(records) = self.fetch_and_extract(page).await else {
                summary.pages_failed += 1;
                continue;
            };

            if records.is_empty() {
                empty_streak += 1;
                debug!(worker = self.id, page, empty_streak, "Empty page");
                if (walks_up || seen_data) && empty_streak >= self.settings.max_empty_pages {
                    info!(worker = self.id, page, empty_streak, "End of data reached");
                    summary.exhausted = true;
                    break;
                }
                continue;
            }
            empty_streak = 0;
            seen_data = true;

            buffer.pages.push((page, records.len() as u32));
            buffer.records.extend(records);

            if buffer.records.len() >= self.settings.flush_threshold {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                self.flush(&mut buffer).await?;
                summary.flushes += 1;
            }
        }

        // Tail flush: runs on natural end, exhaustion and cancellation alike.
        if !buffer.records.is_empty() {
            self.flush(&mut buffer).await?;
            summary.flushes += 1;
        }

        info!(
            worker = self.id,
            attempted = summary.pages_attempted,
            failed = summary.pages_failed,
            flushes = summary.flushes,
            exhausted = summary.exhausted,
            cancelled = summary.cancelled,
            "Worker finished"
        );
        Ok(summary)
    }

    /// `None` when the page is lost (fetch exhausted or payload unusable).
    async fn fetch_and_extract(&self, page: u32) -> Option<Vec<TransactionRecord>> {
        let raw = match self.source.fetch_page(page).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(worker = self.id, page, "Skipping page: {e}");
                self.emit(WorkerEvent::PageFailed { worker: self.id, page, reason: e.to_string() })
                    .await;
                return None;
            }
        };

        if raw.attempts > 1 {
            debug!(worker = self.id, page = raw.page, attempts = raw.attempts, "Page needed retries");
        }

        match self.extractor.extract(&raw.payload, Some(page)) {
            Ok(extracted) => {
                if extracted.skipped_entries > 0 {
                    warn!(worker = self.id, page, skipped = extracted.skipped_entries, "Dropped unreadable entries");
                }
                self.emit(WorkerEvent::PageFetched {
                    worker: self.id,
                    page,
                    records: extracted.records.len(),
                    latency: raw.latency,
                })
                .await;
                Some(extracted.records)
            }
            Err(e) => {
                warn!(worker = self.id, page, "Skipping page: {e}");
                self.emit(WorkerEvent::PageFailed { worker: self.id, page, reason: e.to_string() })
                    .await;
                None
            }
        }
    }

    /// Write the buffer, then mark its pages. A page is never marked before its
    /// records are stored.
    async fn flush(&self, buffer: &mut Buffer) -> Result<()> {
        self.emit(WorkerEvent::Flushing { worker: self.id }).await;

        let records = std::mem::take(&mut buffer.records);
        let pages = std::mem::take(&mut buffer.pages);

        let outcome = self.gateway.batch_write(&records).await?;
        for (page, count) in &pages {
            self.gateway.mark_page_complete(*page, *count).await?;
        }

        info!(
            worker = self.id,
            pages = pages.len(),
            records = outcome.total(),
            inserted = outcome.inserted,
            duplicates = outcome.skipped_duplicate,
            rejected = outcome.rejected_invalid,
            "Flushed batch"
        );
        self.emit(WorkerEvent::Flushed(FlushReport { worker: self.id, pages, outcome })).await;
        Ok(())
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(worker = self.id, "Coordinator gone, event dropped");
        }
    }
}
