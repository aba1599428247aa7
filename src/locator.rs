use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::LocateError;
use crate::extractor::Extractor;
use crate::fetcher::PageSource;
use crate::types::{format_date_column, SearchDirection};

/// Lower pages checked when a probe lands on a page without data.
const EMPTY_SCAN_WINDOW: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub page: u32,
    pub probes: u32,
}

/// Where a probed page sits relative to the target. Pages are newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// Every dated record is newer than the target.
    Newer,
    Contains,
    /// Every dated record is older than the target.
    Older,
    /// No dated records, or the fetch failed.
    Empty,
}

/// Outcome of resolving one page, empty-page scanning included.
#[derive(Debug, Clone, Copy)]
enum Step {
    Found(u32),
    /// The target is above `bound`; `data` is the nearest page with records.
    Lo { bound: u32, data: u32 },
    /// The target is below `bound`. `kind` is `Older` or `Empty`.
    Hi { bound: u32, kind: Probe },
}

/// Maps a calendar date to the source page holding it.
///
/// `start_page` (where a backward search begins) and `max_probes` (how many
/// fetches a search may spend) are independent.
pub struct DateLocator {
    source: Arc<dyn PageSource>,
    extractor: Extractor,
    start_page: u32,
    max_probes: u32,
}

impl DateLocator {
    pub fn new(
        source: Arc<dyn PageSource>,
        extractor: Extractor,
        start_page: u32,
        max_probes: u32,
    ) -> Self {
        Self { source, extractor, start_page: start_page.max(1), max_probes }
    }

    /// Page whose records contain `target`, or the newer page of the pair that
    /// straddles it.
    pub async fn locate(
        &self,
        target: DateTime<Utc>,
        direction: SearchDirection,
    ) -> std::result::Result<Located, LocateError> {
        info!(
            target = %format_date_column(target),
            %direction,
            start_page = self.start_page,
            max_probes = self.max_probes,
            "Locating date boundary"
        );

        let mut search = Search { locator: self, target, probes: 0, seen: HashMap::new() };
        let found = match direction {
            SearchDirection::Forward => search.forward().await,
            SearchDirection::Backward => search.backward().await,
        };

        match found {
            Some(page) => {
                info!(page, probes = search.probes, "Date boundary located");
                Ok(Located { page, probes: search.probes })
            }
            None => {
                warn!(probes = search.probes, "Date boundary not found");
                Err(LocateError::BoundaryNotFound {
                    target: format_date_column(target),
                    probes: search.probes,
                })
            }
        }
    }

    async fn classify(&self, page: u32, target: DateTime<Utc>) -> Probe {
        let raw = match self.source.fetch_page(page).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(page, "Probe fetch failed, treating as empty: {e}");
                return Probe::Empty;
            }
        };
        let extracted = match self.extractor.extract(&raw.payload, Some(page)) {
            Ok(extracted) => extracted,
            Err(e) => {
                debug!(page, "Probe payload unusable, treating as empty: {e}");
                return Probe::Empty;
            }
        };

        let mut dates = extracted.records.iter().filter_map(|r| r.date);
        let Some(first) = dates.next() else {
            return Probe::Empty;
        };
        let (oldest, newest) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));

        if oldest > target {
            Probe::Newer
        } else if newest < target {
            Probe::Older
        } else {
            Probe::Contains
        }
    }
}

/// State of one `locate` call. Every fetched page is cached so narrowing never
/// pays twice for the same page.
struct Search<'a> {
    locator: &'a DateLocator,
    target: DateTime<Utc>,
    probes: u32,
    seen: HashMap<u32, Probe>,
}

impl Search<'_> {
    /// `None` once the probe budget is spent.
    async fn probe(&mut self, page: u32) -> Option<Probe> {
        if let Some(class) = self.seen.get(&page) {
            return Some(*class);
        }
        if self.probes >= self.locator.max_probes {
            return None;
        }
        self.probes += 1;
        let class = self.locator.classify(page, self.target).await;
        debug!(page, probe = self.probes, ?class, "Probed page");
        self.seen.insert(page, class);
        Some(class)
    }

    /// Probe `page`; when it is empty, look at up to `EMPTY_SCAN_WINDOW` pages
    /// below it (staying above `floor`) for one with data. With none found the
    /// page counts as past the end of the data.
    async fn resolve(&mut self, page: u32, floor: u32) -> Option<Step> {
        match self.probe(page).await? {
            Probe::Contains => return Some(Step::Found(page)),
            Probe::Newer => return Some(Step::Lo { bound: page, data: page }),
            Probe::Older => return Some(Step::Hi { bound: page, kind: Probe::Older }),
            Probe::Empty => {}
        }

        let lowest = page.saturating_sub(EMPTY_SCAN_WINDOW).max(floor + 1);
        for q in (lowest..page).rev() {
            match self.probe(q).await? {
                Probe::Contains => return Some(Step::Found(q)),
                Probe::Newer => return Some(Step::Lo { bound: page, data: q }),
                Probe::Older => return Some(Step::Hi { bound: q, kind: Probe::Older }),
                Probe::Empty => {}
            }
        }
        Some(Step::Hi { bound: page, kind: Probe::Empty })
    }

    async fn forward(&mut self) -> Option<u32> {
        match self.resolve(1, 0).await? {
            Step::Found(p) => Some(p),
            Step::Lo { bound, data } => self.gallop_up(bound, data).await,
            // Page 1 already older than the target, or no data at all.
            Step::Hi { .. } => None,
        }
    }

    async fn backward(&mut self) -> Option<u32> {
        let start = self.locator.start_page;
        match self.resolve(start, 0).await? {
            Step::Found(p) => Some(p),
            Step::Lo { bound, data } => self.gallop_up(bound, data).await,
            Step::Hi { bound, kind } => self.gallop_down(bound, kind).await,
        }
    }

    /// `lo` is known newer than the target; double the step upward until a
    /// page is not.
    async fn gallop_up(&mut self, mut lo: u32, mut lo_data: u32) -> Option<u32> {
        let mut step = 1u32;
        loop {
            let p = lo.saturating_add(step);
            if p == lo {
                return None;
            }
            match self.resolve(p, lo).await? {
                Step::Found(found) => return Some(found),
                Step::Lo { bound, data } => {
                    lo = bound;
                    lo_data = data;
                    step = step.saturating_mul(2);
                }
                Step::Hi { bound, kind } => return self.bisect(lo, lo_data, bound, kind).await,
            }
        }
    }

    /// `hi` is known older than the target (or past the data); double the step
    /// downward until a newer page appears.
    async fn gallop_down(&mut self, mut hi: u32, mut hi_kind: Probe) -> Option<u32> {
        let mut step = 1u32;
        loop {
            if hi <= 1 {
                return None;
            }
            let p = hi.saturating_sub(step).max(1);
            // no empty-page scan here: the next, larger step covers it
            match self.resolve(p, p - 1).await? {
                Step::Found(found) => return Some(found),
                Step::Lo { bound, data } => return self.bisect(bound, data, hi, hi_kind).await,
                Step::Hi { bound, kind } => {
                    hi = bound;
                    hi_kind = kind;
                    step = step.saturating_mul(2);
                }
            }
        }
    }

    async fn bisect(
        &mut self,
        mut lo: u32,
        mut lo_data: u32,
        mut hi: u32,
        mut hi_kind: Probe,
    ) -> Option<u32> {
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            match self.resolve(mid, lo).await? {
                Step::Found(p) => return Some(p),
                Step::Lo { bound, data } => {
                    lo = bound;
                    lo_data = data;
                }
                Step::Hi { bound, kind } => {
                    hi = bound;
                    hi_kind = kind;
                }
            }
        }

        // Adjacent bounds: a real older page means the target falls between two
        // pages; an empty one means it is older than everything stored.
        match hi_kind {
            Probe::Older => Some(lo_data),
            _ => None,
        }
    }
}
