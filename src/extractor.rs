//! Payload → `TransactionRecord` mapping.
//!
//! There is exactly one extraction path. Callers that know the page number pass it,
//! callers that don't (ad-hoc probes) pass `None`; the output schema is the same.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::ExtractError;
use crate::fetcher::PageSource;
use crate::types::{price_from_amount, AgentKind, TransactionRecord};

/// Keys that may hold the entry list when the payload is an object.
const COLLECTION_KEYS: &[&str] = &["sales", "data", "transactions", "items", "results"];

/// Timestamp keys, most authoritative first.
const TIMESTAMP_KEYS: &[&str] = &["time", "timestamp", "createdAt", "created_at", "date", "blockTime"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

const NAME_KEYWORDS: &[&str] = &["pokemon", "card", "trading", "booster", "pack", "box", "set"];
const NAME_NOISE: &[&str] = &["http", "www", "api", "json", "null", "undefined"];

/// Result of extracting one page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub records: Vec<TransactionRecord>,
    /// Entries that were not objects and could not be read at all.
    pub skipped_entries: usize,
    /// Total page count, when the payload advertises one.
    pub total_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    machine_addresses: Vec<String>,
    page_size: u32,
}

impl Extractor {
    pub fn new(machine_addresses: Vec<String>, page_size: u32) -> Self {
        Self { machine_addresses, page_size }
    }

    /// Machine addresses from config; page size from the source that will be
    /// read, so `total / page_size` matches the `limit` actually sent.
    pub fn for_source(cfg: &Config, source: &dyn PageSource) -> Self {
        Self::new(cfg.machine_addresses.clone(), source.page_size())
    }

    /// Map a raw payload to records. Fails only when the payload carries no
    /// recognizable collection; individual bad entries are skipped.
    pub fn extract(
        &self,
        payload: &Value,
        page_number: Option<u32>,
    ) -> std::result::Result<ExtractedPage, ExtractError> {
        let entries = collection(payload)?;
        let page = page_number.unwrap_or(0);

        let mut out = ExtractedPage {
            records: Vec::with_capacity(entries.len()),
            skipped_entries: 0,
            total_pages: self.total_pages(payload),
        };

        for (idx, entry) in entries.iter().enumerate() {
            match entry.as_object() {
                Some(obj) => out.records.push(self.extract_entry(obj, page)),
                None => {
                    debug!(page, index = idx, "Skipping non-object entry");
                    out.skipped_entries += 1;
                }
            }
        }

        Ok(out)
    }

    fn extract_entry(&self, entry: &Map<String, Value>, page: u32) -> TransactionRecord {
        let (date, time) = resolve_timestamp(entry);
        let amount = first_string(entry, &["amount", "price_raw"]).unwrap_or_default();
        let from_address = first_string(entry, &["from", "from_address", "fromAddress"]).unwrap_or_default();
        let to_address = first_string(entry, &["to", "to_address", "toAddress"]).unwrap_or_default();

        let agent_kind = if self.is_machine(&from_address) || self.is_machine(&to_address) {
            AgentKind::Machine
        } else {
            AgentKind::Human
        };

        TransactionRecord {
            date,
            batch_number: batch_number(date, &time, page),
            price: price_from_amount(&amount),
            time,
            page_number: page,
            amount,
            tx_type: first_string(entry, &["type", "transactionType", "saleType"]).unwrap_or_default(),
            agent_kind,
            from_address,
            to_address,
            name: resolve_name(entry),
        }
    }

    fn is_machine(&self, address: &str) -> bool {
        !address.is_empty() && self.machine_addresses.iter().any(|m| m == address)
    }

    fn total_pages(&self, payload: &Value) -> Option<u32> {
        let obj = payload.as_object()?;
        let scopes = [
            Some(obj),
            obj.get("pagination").and_then(|p| p.as_object()),
            obj.get("meta").and_then(|p| p.as_object()),
        ];

        for scope in scopes.into_iter().flatten() {
            for key in ["totalPages", "total_pages", "pageCount"] {
                if let Some(n) = scope.get(key).and_then(as_u64) {
                    return u32::try_from(n).ok();
                }
            }
            for key in ["total", "totalCount", "total_count"] {
                if let Some(n) = scope.get(key).and_then(as_u64) {
                    let per_page = u64::from(self.page_size.max(1));
                    return u32::try_from(n.div_ceil(per_page)).ok();
                }
            }
        }
        None
    }
}

fn collection(payload: &Value) -> std::result::Result<&[Value], ExtractError> {
    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(obj) => {
            for key in COLLECTION_KEYS {
                match obj.get(*key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(Value::Null) => return Ok(&[]),
                    _ => {}
                }
            }
            Err(ExtractError::UnrecognizedShape { found: "object without an entry list" })
        }
        Value::Null => Err(ExtractError::UnrecognizedShape { found: "null" }),
        Value::Bool(_) => Err(ExtractError::UnrecognizedShape { found: "boolean" }),
        Value::Number(_) => Err(ExtractError::UnrecognizedShape { found: "number" }),
        Value::String(_) => Err(ExtractError::UnrecognizedShape { found: "string" }),
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// `(date, raw time)`. The raw string comes from `time` when present, otherwise
/// from whichever key produced the date.
fn resolve_timestamp(entry: &Map<String, Value>) -> (Option<DateTime<Utc>>, String) {
    let raw_time = entry.get("time").and_then(value_to_string);

    for key in TIMESTAMP_KEYS {
        if let Some(value) = entry.get(*key) {
            if let Some(dt) = parse_timestamp(value) {
                let raw = raw_time.clone().or_else(|| value_to_string(value)).unwrap_or_default();
                return (Some(dt), raw);
            }
        }
    }

    (None, raw_time.unwrap_or_default())
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` (read as UTC), a bare date,
/// or epoch seconds / milliseconds.
pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(from_epoch);
    }
    None
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    // Anything past 10^10 would be year 2286 in seconds; read it as millis.
    if n > 10_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else if n > 0 {
        DateTime::from_timestamp(n, 0)
    } else {
        None
    }
}

fn batch_number(date: Option<DateTime<Utc>>, time: &str, page: u32) -> u32 {
    if let Some(dt) = date {
        return ymd(dt.date_naive());
    }
    time.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .map(ymd)
        .unwrap_or(page / 100)
}

fn ymd(d: NaiveDate) -> u32 {
    d.year().max(0) as u32 * 10_000 + d.month() * 100 + d.day()
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

type NameStrategy = fn(&Map<String, Value>) -> Option<String>;

/// Tried in order; the first non-empty result wins.
const NAME_STRATEGIES: &[(&str, NameStrategy)] = &[
    ("name", top_level_name),
    ("nft.name", nft_name),
    ("ebayListing.title", ebay_title),
    ("ebayListing.data.title", ebay_data_title),
    ("metadata.name", metadata_name),
    ("alternate keys", alternate_name),
    ("keyword heuristic", keyword_name),
    ("descriptive string", descriptive_name),
];

pub fn resolve_name(entry: &Map<String, Value>) -> String {
    for (label, strategy) in NAME_STRATEGIES {
        if let Some(name) = strategy(entry) {
            if *label != "name" {
                debug!(strategy = *label, "Name resolved by fallback");
            }
            return name;
        }
    }
    String::new()
}

fn top_level_name(entry: &Map<String, Value>) -> Option<String> {
    entry.get("name").and_then(non_empty)
}

fn nft_name(entry: &Map<String, Value>) -> Option<String> {
    nested(entry, &["nft", "name"])
}

fn ebay_title(entry: &Map<String, Value>) -> Option<String> {
    nested(entry, &["ebayListing", "title"])
}

fn ebay_data_title(entry: &Map<String, Value>) -> Option<String> {
    nested(entry, &["ebayListing", "data", "title"])
}

fn metadata_name(entry: &Map<String, Value>) -> Option<String> {
    nested(entry, &["metadata", "name"])
}

fn alternate_name(entry: &Map<String, Value>) -> Option<String> {
    ["title", "itemName", "item_name"]
        .iter()
        .find_map(|k| entry.get(*k).and_then(non_empty))
}

fn nested(entry: &Map<String, Value>, path: &[&str]) -> Option<String> {
    let (first, rest) = path.split_first()?;
    let mut cur = entry.get(*first)?;
    for key in rest {
        cur = cur.as_object()?.get(*key)?;
    }
    non_empty(cur)
}

/// Top-level string values that are not structural fields.
fn free_text(entry: &Map<String, Value>) -> impl Iterator<Item = &str> {
    entry
        .iter()
        .filter(|(k, _)| !TIMESTAMP_KEYS.contains(&k.as_str()))
        .filter_map(|(_, v)| v.as_str())
        .map(str::trim)
}

fn keyword_name(entry: &Map<String, Value>) -> Option<String> {
    free_text(entry)
        .find(|s| {
            let lower = s.to_lowercase();
            s.len() > 10
                && !s.bytes().all(|b| b.is_ascii_digit())
                && NAME_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .map(str::to_string)
}

fn descriptive_name(entry: &Map<String, Value>) -> Option<String> {
    free_text(entry)
        .find(|s| {
            let lower = s.to_lowercase();
            s.len() > 15
                && s.len() < 200
                && s.contains(' ')
                && !s.replace(' ', "").bytes().all(|b| b.is_ascii_digit())
                && !NAME_NOISE.iter().any(|w| lower.contains(w))
        })
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn non_empty(v: &Value) -> Option<String> {
    v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| entry.get(*k).and_then(value_to_string))
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::CLAW_MACHINE_ADDRESS;

    fn extractor() -> Extractor {
        Extractor::new(vec![CLAW_MACHINE_ADDRESS.to_string()], 10)
    }

    #[test]
    fn well_formed_sale_maps_every_field() {
        let payload = json!({
            "sales": [{
                "time": "2025-03-04T05:06:07.000Z",
                "amount": "12500000",
                "type": "sale",
                "from": "alice",
                "to": CLAW_MACHINE_ADDRESS,
                "nft": { "name": "  Charizard Holo  " }
            }]
        });

        let page = extractor().extract(&payload, Some(42)).unwrap();
        assert_eq!(page.records.len(), 1);
        let r = &page.records[0];

        assert_eq!(r.time, "2025-03-04T05:06:07.000Z");
        assert_eq!(r.date_column().as_deref(), Some("2025-03-04T05:06:07.000Z"));
        assert_eq!(r.batch_number, 20250304);
        assert_eq!(r.page_number, 42);
        assert_eq!(r.amount, "12500000");
        assert_eq!(r.price, 12.5);
        assert_eq!(r.tx_type, "sale");
        assert_eq!(r.agent_kind, AgentKind::Machine);
        assert_eq!(r.name, "Charizard Holo");
    }

    #[test]
    fn zero_amount_is_a_real_zero_price() {
        let payload = json!([{ "time": "2025-01-01T00:00:00Z", "amount": "0", "type": "sale" }]);
        let r = &extractor().extract(&payload, None).unwrap().records[0];

        assert_eq!(r.amount, "0");
        assert_eq!(r.price, 0.0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn numeric_amounts_are_kept_as_strings() {
        let payload = json!([{ "time": "2025-01-01T00:00:00Z", "amount": 3000000, "type": "sale" }]);
        let r = &extractor().extract(&payload, None).unwrap().records[0];
        assert_eq!(r.amount, "3000000");
        assert_eq!(r.price, 3.0);
    }

    #[test]
    fn bad_entries_never_abort_the_page() {
        let payload = json!({ "data": [
            { "amount": "5", "type": "sale" },
            42,
            null,
            { "time": "2025-01-02T00:00:00Z", "amount": "7", "type": "sale" }
        ]});

        let page = extractor().extract(&payload, Some(3)).unwrap();

        assert_eq!(page.skipped_entries, 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].validate(), Err("missing time"));
        assert!(page.records[0].date.is_none());
        assert!(page.records[1].validate().is_ok());
    }

    #[test]
    fn unrecognized_payloads_are_the_only_error() {
        let ex = extractor();
        assert!(ex.extract(&json!("oops"), None).is_err());
        assert!(ex.extract(&json!({ "message": "busy" }), None).is_err());
        assert!(ex.extract(&json!(null), None).is_err());
        assert_eq!(ex.extract(&json!({ "sales": null }), None).unwrap().records.len(), 0);
    }

    #[test]
    fn name_strategies_run_in_order() {
        let both = json!({ "nft": { "name": "From NFT" }, "ebayListing": { "title": "From eBay" } });
        assert_eq!(resolve_name(both.as_object().unwrap()), "From NFT");

        let blank_nft = json!({ "nft": { "name": "   " }, "ebayListing": { "title": "From eBay" } });
        assert_eq!(resolve_name(blank_nft.as_object().unwrap()), "From eBay");

        let nested_ebay = json!({ "ebayListing": { "data": { "title": "Deep Title" } } });
        assert_eq!(resolve_name(nested_ebay.as_object().unwrap()), "Deep Title");

        let alternate = json!({ "itemName": "Alt Key" });
        assert_eq!(resolve_name(alternate.as_object().unwrap()), "Alt Key");
    }

    #[test]
    fn heuristics_pick_product_like_text() {
        let keyword = json!({ "memo": "Pokemon Booster Pack 151", "from": "abc" });
        assert_eq!(resolve_name(keyword.as_object().unwrap()), "Pokemon Booster Pack 151");

        let descriptive = json!({ "note": "Vintage Shadowless Charizard PSA 9", "link": "https://x.y/z a" });
        assert_eq!(resolve_name(descriptive.as_object().unwrap()), "Vintage Shadowless Charizard PSA 9");

        let nothing = json!({ "from": "abc", "time": "2025-01-01T00:00:00Z" });
        assert_eq!(resolve_name(nothing.as_object().unwrap()), "");
    }

    #[test]
    fn page_number_is_the_only_difference_between_call_sites() {
        let payload = json!([{ "time": "2025-01-01T00:00:00Z", "amount": "1", "type": "sale" }]);
        let ex = extractor();

        let mut with_page = ex.extract(&payload, Some(9)).unwrap().records.remove(0);
        let without_page = ex.extract(&payload, None).unwrap().records.remove(0);

        assert_eq!(with_page.page_number, 9);
        with_page.page_number = 0;
        assert_eq!(with_page, without_page);
    }

    #[test]
    fn batch_number_falls_back_from_date_to_time_to_page() {
        assert_eq!(batch_number(None, "2024-12-31 garbage", 500), 20241231);
        assert_eq!(batch_number(None, "garbage", 512), 5);
    }

    #[test]
    fn alternate_timestamp_keys_and_epochs_parse() {
        let payload = json!([
            { "createdAt": 1_735_689_600_000i64, "amount": "1", "type": "sale" },
            { "timestamp": "2025-01-01 00:00:00", "amount": "2", "type": "sale" }
        ]);
        let page = extractor().extract(&payload, None).unwrap();

        let expected = parse_timestamp_str("2025-01-01T00:00:00Z");
        assert_eq!(page.records[0].date, expected);
        assert_eq!(page.records[0].time, "1735689600000");
        assert_eq!(page.records[1].date, expected);
        assert_eq!(page.records[1].time, "2025-01-01 00:00:00");
    }

    #[test]
    fn unparsable_time_keeps_raw_string_without_date() {
        let payload = json!([{ "time": "yesterday-ish", "amount": "1", "type": "sale" }]);
        let r = &extractor().extract(&payload, Some(250)).unwrap().records[0];

        assert!(r.date.is_none());
        assert_eq!(r.time, "yesterday-ish");
        assert_eq!(r.batch_number, 2);
    }

    #[test]
    fn total_pages_is_read_from_known_indicators() {
        let ex = extractor();
        let direct = json!({ "sales": [], "totalPages": 321 });
        let nested = json!({ "sales": [], "pagination": { "total_pages": "12" } });
        let counted = json!({ "sales": [], "total": 95 });

        assert_eq!(ex.extract(&direct, None).unwrap().total_pages, Some(321));
        assert_eq!(ex.extract(&nested, None).unwrap().total_pages, Some(12));
        assert_eq!(ex.extract(&counted, None).unwrap().total_pages, Some(10));
        assert_eq!(ex.extract(&json!([]), None).unwrap().total_pages, None);
    }

    #[test]
    fn record_counts_are_divided_by_the_source_page_size() {
        let cfg = Config::for_tests("unused.db", "unused.json");
        let source = crate::testing::MemorySource::new(Vec::new(), 25);
        let ex = Extractor::for_source(&cfg, &source);

        let counted = json!({ "sales": [], "totalCount": 95 });

        assert_eq!(ex.extract(&counted, None).unwrap().total_pages, Some(4));
    }
}
