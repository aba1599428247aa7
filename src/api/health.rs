//! Shared health state for the /health endpoint.
//! Updated by the harvest coordinator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared harvest counters. Written by the coordinator, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// True while a harvest run is between Resuming and its terminal phase.
    pub running: AtomicBool,
    pub pages_fetched: AtomicU64,
    pub pages_failed: AtomicU64,
    /// Unix millis of the last successful flush (0 = none).
    pub last_flush_at_ms: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::Relaxed);
    }

    pub fn inc_pages_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pages_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_flush_at_ms(&self, ms: u64) {
        self.last_flush_at_ms.store(ms, Ordering::Relaxed);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched.load(Ordering::Relaxed)
    }

    pub fn pages_failed(&self) -> u64 {
        self.pages_failed.load(Ordering::Relaxed)
    }

    pub fn last_flush_at_ms(&self) -> u64 {
        self.last_flush_at_ms.load(Ordering::Relaxed)
    }
}
