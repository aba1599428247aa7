use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::StorageGateway;
use crate::error::{AppError, Result};
use crate::extractor::Extractor;
use crate::fetcher::PageSource;
use crate::harvest::partition::partition;
use crate::harvest::progress::ProgressSnapshot;
use crate::harvest::worker::{Worker, WorkerEvent, WorkerSettings};
use crate::locator::DateLocator;
use crate::types::{format_date_column, HarvestDirection, HarvestPhase, ResumeMode, SearchDirection};

/// What one harvest pass should cover.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub direction: HarvestDirection,
    pub resume: ResumeMode,
    pub start_page: Option<u32>,
    pub end_page: Option<u32>,
    /// Harvest exactly these pages, in this order.
    pub page_list: Option<Vec<u32>>,
    pub workers: usize,
    /// Date resume target overriding the stored date range.
    pub since: Option<DateTime<Utc>>,
    pub reset_markers: bool,
}

#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub snapshot: ProgressSnapshot,
    pub cancelled: bool,
}

/// Pages chosen during Resuming, and how they were chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub pages: Vec<u32>,
    pub origin: String,
}

/// Runs one end-to-end harvest pass. Owns the progress snapshot; workers only
/// report through the event channel.
pub struct Coordinator {
    cfg: Config,
    source: Arc<dyn PageSource>,
    extractor: Extractor,
    gateway: StorageGateway,
    cancel: CancellationToken,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
    progress_tx: watch::Sender<ProgressSnapshot>,
    progress_path: PathBuf,
}

impl Coordinator {
    pub fn new(
        cfg: Config,
        source: Arc<dyn PageSource>,
        gateway: StorageGateway,
        cancel: CancellationToken,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(ProgressSnapshot::new(Utc::now()));
        Self {
            extractor: Extractor::for_source(&cfg, source.as_ref()),
            progress_path: PathBuf::from(&cfg.progress_path),
            cfg,
            source,
            gateway,
            cancel,
            health,
            latency,
            progress_tx,
        }
    }

    /// Live view of the snapshot for the status server.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    pub async fn run(self, opts: RunOptions) -> Result<HarvestSummary> {
        self.log_previous_run().await;

        let mut snap = ProgressSnapshot::new(Utc::now());
        snap.direction = Some(opts.direction);
        snap.resume_mode = Some(opts.resume);
        snap = snap.transition(HarvestPhase::Resuming, Utc::now());
        self.health.set_running(true);
        self.publish(&snap).await;

        let plan = match self.plan(&opts).await {
            Ok(plan) => plan,
            Err(e) => return self.fail(snap, e).await,
        };

        let workers = opts.workers.clamp(1, plan.pages.len().max(1));
        snap.resumed_from = Some(plan.origin.clone());
        snap = snap.planned(plan.pages.len() as u32, self.cfg.page_size, self.cfg.flush_threshold, workers);
        info!(
            pages = plan.pages.len(),
            workers,
            first = plan.pages.first().copied(),
            last = plan.pages.last().copied(),
            origin = %plan.origin,
            "Harvest planned"
        );

        if plan.pages.is_empty() {
            info!("Nothing to harvest");
            return Ok(self.complete(snap, self.cancel.is_cancelled()).await);
        }

        snap = snap.transition(HarvestPhase::Harvesting, Utc::now());
        self.publish(&snap).await;

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let settings = WorkerSettings {
            flush_threshold: self.cfg.flush_threshold,
            max_empty_pages: self.cfg.max_empty_pages,
            page_delay: self.cfg.page_delay,
        };
        let handles: Vec<_> = partition(&plan.pages, workers)
            .into_iter()
            .enumerate()
            .map(|(id, pages)| {
                let worker = Worker::new(
                    id,
                    pages,
                    Arc::clone(&self.source),
                    self.extractor.clone(),
                    self.gateway.clone(),
                    tx.clone(),
                    self.cancel.clone(),
                    settings.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(tx);

        let mut fatal: Option<AppError> = None;
        let mut cancel_seen = false;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => snap = self.fold(snap, event, &mut fatal).await,
                    None => break,
                },
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    if fatal.is_none() {
                        info!("Cancellation requested, waiting for workers to flush");
                        snap = snap.transition(HarvestPhase::Cancelling, Utc::now());
                        self.publish(&snap).await;
                    }
                }
            }
        }

        for (id, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!(worker = id, "Worker task aborted: {e}");
                fatal.get_or_insert(AppError::Worker { worker: id, reason: e.to_string() });
            }
        }

        match fatal {
            Some(e) => self.fail(snap, e).await,
            None => Ok(self.complete(snap, cancel_seen || self.cancel.is_cancelled()).await),
        }
    }

    async fn fold(
        &self,
        snap: ProgressSnapshot,
        event: WorkerEvent,
        fatal: &mut Option<AppError>,
    ) -> ProgressSnapshot {
        let now = Utc::now();
        match event {
            WorkerEvent::PageFetched { worker, page, records, latency } => {
                debug!(worker, page, records, latency_ms = latency.as_millis() as u64, "Page fetched");
                self.health.inc_pages_fetched();
                self.latency.record(latency);
                snap.page_fetched(page, now)
            }
            WorkerEvent::PageFailed { worker, page, reason } => {
                debug!(worker, page, %reason, "Page failed");
                self.health.inc_pages_failed();
                snap.page_failed(page, now)
            }
            WorkerEvent::Flushing { worker } => {
                debug!(worker, "Flushing");
                snap.transition(HarvestPhase::Flushing, now)
            }
            WorkerEvent::Flushed(report) => {
                self.health.set_last_flush_at_ms(unix_millis());
                let snap = snap
                    .apply_flush(&report, now)
                    .transition(HarvestPhase::Harvesting, now);
                info!(
                    worker = report.worker,
                    batches = snap.batches_completed,
                    total_batches = snap.total_batches,
                    percent = snap.percent,
                    inserted = snap.records.inserted,
                    "Progress"
                );
                self.publish(&snap).await;
                snap
            }
            WorkerEvent::Finished { worker, result } => {
                match result {
                    Ok(summary) => debug!(
                        worker,
                        attempted = summary.pages_attempted,
                        failed = summary.pages_failed,
                        flushes = summary.flushes,
                        exhausted = summary.exhausted,
                        cancelled = summary.cancelled,
                        "Worker done"
                    ),
                    Err(e) => {
                        error!(worker, "Worker failed, stopping the run: {e}");
                        if fatal.is_none() {
                            *fatal = Some(e);
                            self.cancel.cancel();
                        }
                    }
                }
                snap
            }
        }
    }

    async fn complete(&self, snap: ProgressSnapshot, cancelled: bool) -> HarvestSummary {
        let snap = snap.transition(HarvestPhase::Completed, Utc::now());
        self.publish(&snap).await;
        self.health.set_running(false);
        info!(
            cancelled,
            pages_completed = snap.pages_completed,
            pages_failed = snap.pages_failed,
            inserted = snap.records.inserted,
            duplicates = snap.records.skipped_duplicate,
            rejected = snap.records.rejected_invalid,
            "Harvest completed"
        );
        HarvestSummary { snapshot: snap, cancelled }
    }

    /// Fatal for the run: stop every worker, keep the last good counters with
    /// phase Failed, hand the error up.
    async fn fail(&self, snap: ProgressSnapshot, e: AppError) -> Result<HarvestSummary> {
        error!("Harvest failed: {e}");
        self.cancel.cancel();
        let snap = snap.transition(HarvestPhase::Failed, Utc::now());
        self.publish(&snap).await;
        self.health.set_running(false);
        Err(e)
    }

    async fn publish(&self, snap: &ProgressSnapshot) {
        self.progress_tx.send_replace(snap.clone());
        if let Err(e) = snap.persist(&self.progress_path).await {
            warn!(path = %self.progress_path.display(), "Could not write progress file: {e}");
        }
    }

    async fn log_previous_run(&self) {
        match ProgressSnapshot::load(&self.progress_path).await {
            Ok(Some(prev)) => info!(
                phase = %prev.phase,
                pages_completed = prev.pages_completed,
                inserted = prev.records.inserted,
                percent = prev.percent,
                updated_at = %prev.updated_at,
                "Previous run progress"
            ),
            Ok(None) => {}
            Err(e) => warn!("Previous progress file unreadable, ignoring: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Resuming
    // -----------------------------------------------------------------------

    pub async fn plan(&self, opts: &RunOptions) -> Result<Plan> {
        if opts.reset_markers {
            self.gateway.reset_completion_markers().await?;
        }

        if let Some(list) = &opts.page_list {
            let mut seen = HashSet::new();
            let listed: Vec<u32> = list.iter().copied().filter(|p| *p > 0 && seen.insert(*p)).collect();
            if opts.resume == ResumeMode::Fresh {
                return Ok(Plan { pages: listed, origin: "page list, markers ignored".to_string() });
            }
            // Short lists: ask per page instead of loading every marker.
            let mut pages = Vec::with_capacity(listed.len());
            for page in &listed {
                if !self.gateway.is_page_complete(*page).await? {
                    pages.push(*page);
                }
            }
            let skipped = listed.len() - pages.len();
            return Ok(Plan { pages, origin: format!("page list, {skipped} completed page(s) skipped") });
        }

        match opts.resume {
            ResumeMode::Date => self.plan_by_date(opts).await,
            mode => {
                // Oldest-first starts at the far end, so it needs the real size.
                let total = match (opts.direction, opts.end_page) {
                    (HarvestDirection::OldestFirst, None) => self.reported_total().await,
                    _ => None,
                };
                let pages = self.candidate_range(opts, total);
                self.skip_completed(pages, mode, "page range").await
            }
        }
    }

    /// Start..=end in harvest order. Without an explicit end the source's
    /// reported size is used, then `MAX_PAGES`.
    fn candidate_range(&self, opts: &RunOptions, reported_total: Option<u32>) -> Vec<u32> {
        let start = opts.start_page.unwrap_or(1).max(1);
        let end = opts.end_page.or(reported_total).unwrap_or(self.cfg.max_pages);
        in_order(start, end, opts.direction)
    }

    async fn skip_completed(&self, pages: Vec<u32>, mode: ResumeMode, label: &str) -> Result<Plan> {
        if mode == ResumeMode::Fresh {
            return Ok(Plan { pages, origin: format!("{label}, markers ignored") });
        }

        let done = self.gateway.completed_pages().await?;
        let before = pages.len();
        let pages: Vec<u32> = pages.into_iter().filter(|p| !done.contains(p)).collect();
        let skipped = before - pages.len();

        if let Some(marker) = self.gateway.last_completion_marker().await? {
            info!(
                last_marked = marker.page_number,
                last_records = marker.records_count,
                marked_at = %marker.scraped_at,
                skipped,
                "Resuming past completion markers"
            );
        }
        Ok(Plan { pages, origin: format!("{label}, {skipped} completed page(s) skipped") })
    }

    async fn plan_by_date(&self, opts: &RunOptions) -> Result<Plan> {
        let total = self.reported_total().await;

        let target = match opts.since {
            Some(since) => since,
            None => {
                let stored = match opts.direction {
                    HarvestDirection::NewestFirst => self.gateway.first_recorded_date().await?,
                    HarvestDirection::OldestFirst => self.gateway.last_recorded_date().await?,
                };
                let Some(stored) = stored else {
                    info!("Store is empty, resuming from completion markers instead");
                    let pages = self.candidate_range(opts, total);
                    return self.skip_completed(pages, ResumeMode::Markers, "empty store").await;
                };
                stored
            }
        };

        let ceiling = total.unwrap_or(self.cfg.search_start_page);
        let locator = DateLocator::new(
            Arc::clone(&self.source),
            self.extractor.clone(),
            ceiling,
            self.cfg.search_max_probes,
        );

        let (found, pages) = match opts.direction {
            // Oldest stored sale sits at `found`; keep walking toward older pages.
            HarvestDirection::NewestFirst => {
                let found = locator.locate(target, SearchDirection::Backward).await?;
                let end = opts.end_page.or(total).unwrap_or(self.cfg.max_pages).max(found.page);
                (found, in_order(found.page, end, opts.direction))
            }
            // Newest stored sale sits at `found`; walk back toward page 1.
            HarvestDirection::OldestFirst => {
                let found = locator.locate(target, SearchDirection::Forward).await?;
                let floor = opts.start_page.unwrap_or(1).max(1);
                (found, in_order(floor, found.page, opts.direction))
            }
        };

        Ok(Plan {
            pages,
            origin: format!(
                "date {} at page {} ({} probes)",
                format_date_column(target),
                found.page,
                found.probes
            ),
        })
    }

    /// Page count advertised by page 1, if any.
    async fn reported_total(&self) -> Option<u32> {
        let raw = match self.source.fetch_page(1).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not read source size: {e}");
                return None;
            }
        };
        match self.extractor.extract(&raw.payload, Some(1)) {
            Ok(page) => {
                if let Some(total) = page.total_pages {
                    info!(total_pages = total, "Source reports its size");
                }
                page.total_pages
            }
            Err(e) => {
                warn!("Could not read source size: {e}");
                None
            }
        }
    }
}

fn in_order(start: u32, end: u32, direction: HarvestDirection) -> Vec<u32> {
    match direction {
        HarvestDirection::NewestFirst => (start..=end).collect(),
        HarvestDirection::OldestFirst => (start..=end).rev().collect(),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::error::FetchError;
    use crate::fetcher::RawPage;
    use crate::testing::{sale, MemorySource};
    use crate::types::{price_from_amount, AgentKind, TransactionRecord};

    fn newest() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn minutes_before_newest(m: i64) -> DateTime<Utc> {
        newest() - chrono::Duration::minutes(m)
    }

    struct Setup {
        cfg: Config,
        gateway: StorageGateway,
        cancel: CancellationToken,
        dir: TempDir,
    }

    async fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("harvest.db");
        let progress = dir.path().join("progress.json");
        let cfg = Config::for_tests(db.to_str().unwrap(), progress.to_str().unwrap());
        let gateway = StorageGateway::open(&cfg).await.unwrap();
        Setup { cfg, gateway, cancel: CancellationToken::new(), dir }
    }

    fn coordinator(s: &Setup, source: Arc<dyn PageSource>) -> Coordinator {
        Coordinator::new(
            s.cfg.clone(),
            source,
            s.gateway.clone(),
            s.cancel.clone(),
            Arc::new(HealthState::new()),
            Arc::new(LatencyStats::new().unwrap()),
        )
    }

    fn opts(resume: ResumeMode) -> RunOptions {
        RunOptions {
            direction: HarvestDirection::NewestFirst,
            resume,
            start_page: None,
            end_page: None,
            page_list: None,
            workers: 1,
            since: None,
            reset_markers: false,
        }
    }

    async fn saved_phase(path: &Path) -> HarvestPhase {
        ProgressSnapshot::load(path).await.unwrap().unwrap().phase
    }

    #[tokio::test]
    async fn marker_resume_starts_after_completed_pages() {
        let s = setup().await;
        for page in 1..=100 {
            s.gateway.mark_page_complete(page, 10).await.unwrap();
        }
        let source = Arc::new(MemorySource::dated(130, 10, newest()));
        let run = RunOptions { end_page: Some(130), workers: 2, ..opts(ResumeMode::Markers) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        let fetched = source.fetched();
        assert!(fetched.iter().all(|p| *p > 100), "re-fetched a completed page: {fetched:?}");
        assert_eq!(fetched.iter().min(), Some(&101));
        assert_eq!(fetched.len(), 30);
        assert_eq!(summary.snapshot.records.inserted, 300);
        assert_eq!(summary.snapshot.pages_completed, 30);
        assert_eq!(summary.snapshot.phase, HarvestPhase::Completed);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn parallel_fresh_run_stores_every_page_once() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(20, 10, newest()));
        let run = RunOptions { end_page: Some(20), workers: 3, ..opts(ResumeMode::Fresh) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        let mut fetched = source.fetched();
        fetched.sort_unstable();
        assert_eq!(fetched, (1..=20).collect::<Vec<_>>());
        assert_eq!(s.gateway.stats().await.unwrap().total_records, 200);
        assert_eq!(summary.snapshot.workers, 3);
        assert_eq!(summary.snapshot.percent, 100.0);
        assert_eq!(saved_phase(Path::new(&s.cfg.progress_path)).await, HarvestPhase::Completed);
    }

    #[tokio::test]
    async fn oldest_first_walks_pages_in_descending_order() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(6, 10, newest()));
        let run = RunOptions {
            direction: HarvestDirection::OldestFirst,
            end_page: Some(6),
            ..opts(ResumeMode::Fresh)
        };

        coordinator(&s, source.clone()).run(run).await.unwrap();

        assert_eq!(source.fetched(), vec![6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn oldest_first_without_end_page_uses_reported_size() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(10, 10, newest()));
        let run = RunOptions { direction: HarvestDirection::OldestFirst, ..opts(ResumeMode::Fresh) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        let fetched = source.fetched();
        // page 1 is read once for its size, then the walk starts at the last page
        assert_eq!(fetched[0], 1);
        assert_eq!(fetched[1..].to_vec(), (1..=10).rev().collect::<Vec<_>>());
        assert_eq!(s.gateway.stats().await.unwrap().total_records, 100);
        assert_eq!(summary.snapshot.phase, HarvestPhase::Completed);
    }

    #[tokio::test]
    async fn oldest_first_on_unsized_source_walks_down_to_the_data() {
        let mut s = setup().await;
        s.cfg.max_pages = 40;
        let pages = (0..3u32)
            .map(|i| serde_json::json!({ "sales": [sale(minutes_before_newest(i64::from(i)), i + 1)] }))
            .collect();
        let source = Arc::new(MemorySource::new(pages, 10));
        let run = RunOptions { direction: HarvestDirection::OldestFirst, ..opts(ResumeMode::Markers) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        assert_eq!(source.fetched().len(), 41);
        assert_eq!(s.gateway.stats().await.unwrap().total_records, 3);
        assert_eq!(summary.snapshot.pages_completed, 3);
    }

    /// Cancels the run as soon as a given page has been served.
    struct CancelAfter {
        inner: MemorySource,
        page: u32,
        token: CancellationToken,
    }

    #[async_trait]
    impl PageSource for CancelAfter {
        async fn fetch_page(&self, page: u32) -> std::result::Result<RawPage, FetchError> {
            let raw = self.inner.fetch_page(page).await;
            if page == self.page {
                self.token.cancel();
            }
            raw
        }

        fn page_size(&self) -> u32 {
            self.inner.page_size()
        }
    }

    #[tokio::test]
    async fn cancellation_finishes_the_page_and_flushes() {
        let s = setup().await;
        let source = Arc::new(CancelAfter {
            inner: MemorySource::dated(10, 10, newest()),
            page: 3,
            token: s.cancel.clone(),
        });
        let run = RunOptions { end_page: Some(10), ..opts(ResumeMode::Fresh) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(source.inner.fetched(), vec![1, 2, 3]);
        assert_eq!(s.gateway.stats().await.unwrap().total_records, 30);
        assert_eq!(
            s.gateway.completed_pages().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(summary.snapshot.phase, HarvestPhase::Completed);
    }

    #[tokio::test]
    async fn date_resume_newest_first_continues_past_oldest_stored_sale() {
        let s = setup().await;
        let oldest = minutes_before_newest(365);
        let stored = TransactionRecord {
            date: Some(oldest),
            time: format_date_column(oldest),
            page_number: 37,
            batch_number: 20250601,
            amount: "366000000".to_string(),
            price: price_from_amount("366000000"),
            tx_type: "sale".to_string(),
            agent_kind: AgentKind::Human,
            from_address: "seller".to_string(),
            to_address: "buyer".to_string(),
            name: "Card #366".to_string(),
        };
        s.gateway.batch_write(&[stored]).await.unwrap();
        let source = Arc::new(MemorySource::dated(60, 10, newest()));

        let summary = coordinator(&s, source).run(opts(ResumeMode::Date)).await.unwrap();

        let done = s.gateway.completed_pages().await.unwrap();
        assert_eq!(done.first(), Some(&37));
        assert_eq!(done.last(), Some(&60));
        assert_eq!(done.len(), 24);
        // the stored sale is seen again as a duplicate
        assert_eq!(summary.snapshot.records.skipped_duplicate, 1);
        assert!(summary.snapshot.resumed_from.unwrap().contains("page 37"));
    }

    #[tokio::test]
    async fn date_resume_oldest_first_walks_down_to_page_one() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(60, 10, newest()));
        let run = RunOptions {
            direction: HarvestDirection::OldestFirst,
            since: Some(minutes_before_newest(365)),
            ..opts(ResumeMode::Date)
        };

        coordinator(&s, source).run(run).await.unwrap();

        let done = s.gateway.completed_pages().await.unwrap();
        assert_eq!(done.into_iter().collect::<Vec<_>>(), (1..=37).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn date_resume_on_empty_store_falls_back_to_markers() {
        let s = setup().await;
        s.gateway.mark_page_complete(1, 10).await.unwrap();
        let source = Arc::new(MemorySource::dated(5, 10, newest()));
        let run = RunOptions { end_page: Some(5), ..opts(ResumeMode::Date) };

        let summary = coordinator(&s, source).run(run).await.unwrap();

        assert_eq!(summary.snapshot.pages_completed, 4);
        assert!(summary.snapshot.resumed_from.unwrap().starts_with("empty store"));
    }

    #[tokio::test]
    async fn missing_date_boundary_fails_the_run() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(60, 10, newest()));
        let run = RunOptions {
            since: Some(Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap()),
            ..opts(ResumeMode::Date)
        };

        let err = coordinator(&s, source).run(run).await.unwrap_err();

        assert!(matches!(err, AppError::BoundaryNotFound(_)));
        assert!(s.cancel.is_cancelled());
        assert_eq!(saved_phase(Path::new(&s.cfg.progress_path)).await, HarvestPhase::Failed);
    }

    #[tokio::test]
    async fn storage_failure_mid_run_is_fatal() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(5, 10, newest()));
        let run = RunOptions { page_list: Some(vec![1, 2, 3]), ..opts(ResumeMode::Fresh) };
        s.gateway.close().await;

        let err = coordinator(&s, source).run(run).await.unwrap_err();

        assert!(matches!(err, AppError::Database(_) | AppError::StorageUnavailable { .. }));
        assert_eq!(saved_phase(Path::new(&s.cfg.progress_path)).await, HarvestPhase::Failed);
    }

    #[tokio::test]
    async fn page_list_skips_marked_pages_unless_fresh() {
        let s = setup().await;
        s.gateway.mark_page_complete(3, 10).await.unwrap();
        let source = Arc::new(MemorySource::dated(10, 10, newest()));
        let run = RunOptions { page_list: Some(vec![7, 3, 9]), ..opts(ResumeMode::Markers) };

        let summary = coordinator(&s, source.clone()).run(run).await.unwrap();

        assert_eq!(source.fetched(), vec![7, 9]);
        assert!(summary.snapshot.resumed_from.unwrap().contains("1 completed page(s) skipped"));
    }

    #[tokio::test]
    async fn explicit_page_list_is_honoured_verbatim() {
        let s = setup().await;
        let source = Arc::new(MemorySource::dated(10, 10, newest()));
        let run = RunOptions { page_list: Some(vec![7, 3, 7, 0, 9]), ..opts(ResumeMode::Fresh) };

        coordinator(&s, source.clone()).run(run).await.unwrap();

        assert_eq!(source.fetched(), vec![7, 3, 9]);
    }
}
