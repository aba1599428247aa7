//! Row types read back from the store.

use serde::Serialize;

/// One point of an item's price history. `at` is `coalesce(date, time)`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PricePoint {
    pub at: Option<String>,
    pub price: f64,
    pub amount: Option<String>,
    pub tx_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoreStats {
    pub total_records: i64,
    pub machine_records: i64,
    pub zero_price_records: i64,
    pub distinct_names: i64,
    pub completed_pages: i64,
    /// Earliest `coalesce(date, time)` in the store.
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CompletionMarker {
    pub page_number: i64,
    pub records_count: i64,
    pub scraped_at: String,
}

/// A stored sale as written to an export file. Legacy rows may lack any column
/// but `price`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredSale {
    pub date: Option<String>,
    pub time: Option<String>,
    pub page_number: Option<i64>,
    pub batch_number: Option<i64>,
    pub amount: Option<String>,
    pub price: f64,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub agent_kind: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub name: Option<String>,
}
