//! In-memory page source shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::FetchError;
use crate::fetcher::{PageSource, RawPage};
use crate::types::format_date_column;

/// Serves pre-built payloads. Pages past the end come back as an empty `sales`
/// list, the way the live API answers.
pub struct MemorySource {
    pages: Vec<Value>,
    page_size: u32,
    failing: HashSet<u32>,
    fetched: Mutex<Vec<u32>>,
}

impl MemorySource {
    pub fn new(pages: Vec<Value>, page_size: u32) -> Self {
        Self { pages, page_size, failing: HashSet::new(), fetched: Mutex::new(Vec::new()) }
    }

    /// `n_pages` pages of `per_page` sales, newest on page 1, one minute apart
    /// starting at `newest`.
    pub fn dated(n_pages: u32, per_page: u32, newest: DateTime<Utc>) -> Self {
        let pages = (1..=n_pages)
            .map(|p| {
                let sales: Vec<Value> = (0..per_page)
                    .map(|i| {
                        let idx = (p - 1) * per_page + i;
                        sale(newest - chrono::Duration::minutes(i64::from(idx)), idx + 1)
                    })
                    .collect();
                json!({ "sales": sales, "totalPages": n_pages })
            })
            .collect();
        Self::new(pages, per_page)
    }

    pub fn failing_on(mut self, pages: &[u32]) -> Self {
        self.failing.extend(pages.iter().copied());
        self
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.fetched.lock().unwrap().clone()
    }
}

pub fn sale(at: DateTime<Utc>, amount: u32) -> Value {
    json!({
        "time": format_date_column(at),
        "amount": (u64::from(amount) * 1_000_000).to_string(),
        "type": "sale",
        "from": "seller",
        "to": "buyer",
        "nft": { "name": format!("Card #{amount}") }
    })
}

#[async_trait]
impl PageSource for MemorySource {
    async fn fetch_page(&self, page: u32) -> Result<RawPage, FetchError> {
        self.fetched.lock().unwrap().push(page);
        if self.failing.contains(&page) {
            return Err(FetchError::Transient { page, reason: "scripted failure".to_string() });
        }
        let payload = page
            .checked_sub(1)
            .and_then(|idx| self.pages.get(idx as usize))
            .cloned()
            .unwrap_or_else(|| json!({ "sales": [] }));
        Ok(RawPage { page, payload, latency: Duration::from_millis(1), attempts: 1 })
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}
