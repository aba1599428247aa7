use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::{HarvestDirection, HarvestPhase, ResumeMode, WriteOutcome};

/// Result of one worker flush, folded into the snapshot by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub worker: usize,
    /// `(page, records)` for every page written and marked in this flush.
    pub pages: Vec<(u32, u32)>,
    pub outcome: WriteOutcome,
}

impl FlushReport {
    pub fn last_page(&self) -> Option<u32> {
        self.pages.last().map(|(page, _)| *page)
    }
}

/// Progress of one harvest run. A plain value: every change goes through a
/// method that returns the next snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: HarvestPhase,
    pub direction: Option<HarvestDirection>,
    pub resume_mode: Option<ResumeMode>,
    pub workers: usize,
    /// Last page reported fetched or flushed.
    pub current_page: Option<u32>,
    /// Pages planned for this run.
    pub total_pages: u32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    pub batches_completed: u32,
    pub total_batches: u32,
    pub percent: f64,
    pub records: WriteOutcome,
    /// How the starting point was chosen.
    pub resumed_from: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: HarvestPhase::Idle,
            direction: None,
            resume_mode: None,
            workers: 0,
            current_page: None,
            total_pages: 0,
            pages_completed: 0,
            pages_failed: 0,
            batches_completed: 0,
            total_batches: 0,
            percent: 0.0,
            records: WriteOutcome::default(),
            resumed_from: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Fix the plan: `planned_pages` pages across `workers`, flushing every
    /// `flush_threshold` records of at most `page_size` per page.
    pub fn planned(
        mut self,
        planned_pages: u32,
        page_size: u32,
        flush_threshold: usize,
        workers: usize,
    ) -> Self {
        let expected_records = u64::from(planned_pages) * u64::from(page_size);
        let threshold = flush_threshold.max(1) as u64;
        self.total_pages = planned_pages;
        self.total_batches = u32::try_from(expected_records.div_ceil(threshold)).unwrap_or(u32::MAX);
        self.workers = workers;
        self.percent = completion_percent(self.batches_completed, self.total_batches);
        self
    }

    pub fn apply_flush(mut self, report: &FlushReport, now: DateTime<Utc>) -> Self {
        self.pages_completed += report.pages.len() as u32;
        self.batches_completed += 1;
        self.records += report.outcome;
        if let Some(page) = report.last_page() {
            self.current_page = Some(page);
        }
        self.percent = completion_percent(self.batches_completed, self.total_batches);
        self.updated_at = now;
        self
    }

    pub fn page_failed(mut self, page: u32, now: DateTime<Utc>) -> Self {
        self.pages_failed += 1;
        self.current_page = Some(page);
        self.updated_at = now;
        self
    }

    pub fn page_fetched(mut self, page: u32, now: DateTime<Utc>) -> Self {
        self.current_page = Some(page);
        self.updated_at = now;
        self
    }

    /// Move to `next` when the lifecycle allows it; otherwise stay put.
    pub fn transition(mut self, next: HarvestPhase, now: DateTime<Utc>) -> Self {
        if self.phase == next {
            return self;
        }
        if self.phase.can_transition_to(next) {
            debug!(from = %self.phase, to = %next, "Harvest phase change");
            self.phase = next;
            self.updated_at = now;
        } else {
            debug!(from = %self.phase, to = %next, "Ignoring phase change");
        }
        self
    }

    /// Atomic overwrite: write a sibling temp file, then rename over `path`.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// `None` when no snapshot has been written yet.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Share of planned batches flushed, capped at 100. Zero planned batches is 0%.
pub fn completion_percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(done) / f64::from(total) * 100.0).min(100.0)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn report(pages: &[(u32, u32)], inserted: u64) -> FlushReport {
        FlushReport {
            worker: 0,
            pages: pages.to_vec(),
            outcome: WriteOutcome { inserted, skipped_duplicate: 1, rejected_invalid: 0 },
        }
    }

    #[test]
    fn zero_planned_batches_is_zero_percent() {
        assert_eq!(completion_percent(0, 0), 0.0);
        assert_eq!(completion_percent(3, 0), 0.0);

        let snap = ProgressSnapshot::new(t0()).planned(0, 10, 100, 1);
        assert_eq!(snap.total_batches, 0);
        assert_eq!(snap.percent, 0.0);
    }

    #[test]
    fn flushes_fold_into_counters() {
        let snap = ProgressSnapshot::new(t0())
            .planned(40, 10, 100, 2)
            .apply_flush(&report(&[(1, 10), (2, 10)], 19), t0())
            .apply_flush(&report(&[(3, 7)], 6), t0());

        assert_eq!(snap.total_batches, 4);
        assert_eq!(snap.batches_completed, 2);
        assert_eq!(snap.pages_completed, 3);
        assert_eq!(snap.current_page, Some(3));
        assert_eq!(snap.records.inserted, 25);
        assert_eq!(snap.records.skipped_duplicate, 2);
        assert_eq!(snap.percent, 50.0);
    }

    #[test]
    fn percent_never_exceeds_one_hundred() {
        let mut snap = ProgressSnapshot::new(t0()).planned(1, 10, 100, 1);
        for _ in 0..3 {
            snap = snap.apply_flush(&report(&[(1, 1)], 1), t0());
        }
        assert_eq!(snap.percent, 100.0);
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let snap = ProgressSnapshot::new(t0()).transition(HarvestPhase::Flushing, t0());
        assert_eq!(snap.phase, HarvestPhase::Idle);

        let snap = snap
            .transition(HarvestPhase::Resuming, t0())
            .transition(HarvestPhase::Harvesting, t0())
            .transition(HarvestPhase::Completed, t0())
            .transition(HarvestPhase::Cancelling, t0());
        assert_eq!(snap.phase, HarvestPhase::Completed);
    }

    #[tokio::test]
    async fn persisted_snapshot_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        assert_eq!(ProgressSnapshot::load(&path).await.unwrap(), None);

        let snap = ProgressSnapshot::new(t0())
            .planned(20, 10, 50, 1)
            .apply_flush(&report(&[(1, 10)], 10), t0());
        snap.persist(&path).await.unwrap();

        assert_eq!(ProgressSnapshot::load(&path).await.unwrap(), Some(snap));
        assert!(!temp_path(&path).exists());
    }
}
