use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::models::{CompletionMarker, PricePoint, StoreStats, StoredSale};
use crate::db::schema::{self, SchemaReady};
use crate::error::{AppError, Result};
use crate::extractor::parse_timestamp_str;
use crate::types::{format_date_column, TransactionRecord, WriteOutcome};

const INSERT_TRANSACTION: &str = r#"
    INSERT OR IGNORE INTO transactions (
        date, page_number, batch_number, time, amount, price,
        type, agent_kind, from_address, to_address, name
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Base pause between storage retries; grows linearly per attempt.
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone, Copy)]
enum Bound {
    First,
    Last,
}

impl Bound {
    fn aggregate(self) -> &'static str {
        match self {
            Bound::First => "MIN",
            Bound::Last => "MAX",
        }
    }
}

/// Pooled access to the record store. Cheap to clone; every worker holds one.
#[derive(Clone)]
pub struct StorageGateway {
    pool: SqlitePool,
    write_retries: u32,
}

impl StorageGateway {
    /// Schema first, pool second.
    pub async fn open(cfg: &Config) -> Result<Self> {
        let ready = schema::ensure_schema(&cfg.db_path).await?;
        Self::connect(ready, cfg).await
    }

    pub async fn connect(ready: SchemaReady, cfg: &Config) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.db_max_connections)
            .acquire_timeout(cfg.db_acquire_timeout)
            .connect_with(ready.connect_options())
            .await?;
        info!(
            db_path = %cfg.db_path,
            max_connections = cfg.db_max_connections,
            migrated_columns = ready.added_columns.len(),
            "Storage pool ready"
        );
        Ok(Self { pool, write_retries: cfg.db_write_retries })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Validate each record, then insert the valid ones in one transaction.
    /// Identity collisions, inside the batch or with stored rows, are skipped.
    pub async fn batch_write(&self, records: &[TransactionRecord]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut valid = Vec::with_capacity(records.len());

        for record in records {
            match record.validate() {
                Ok(()) => valid.push(record),
                Err(reason) => {
                    debug!(page = record.page_number, reason, "Rejected invalid record");
                    outcome.rejected_invalid += 1;
                }
            }
        }

        if valid.is_empty() {
            return Ok(outcome);
        }

        let valid = valid.as_slice();
        let inserted = self.with_retry("batch_write", move || self.insert_all(valid)).await?;
        outcome.inserted = inserted;
        outcome.skipped_duplicate = valid.len() as u64 - inserted;
        Ok(outcome)
    }

    async fn insert_all(&self, records: &[&TransactionRecord]) -> std::result::Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for r in records {
            let result = sqlx::query(INSERT_TRANSACTION)
                .bind(r.date_column())
                .bind(i64::from(r.page_number))
                .bind(i64::from(r.batch_number))
                .bind(&r.time)
                .bind(&r.amount)
                .bind(r.price)
                .bind(&r.tx_type)
                .bind(r.agent_kind.as_str())
                .bind(&r.from_address)
                .bind(&r.to_address)
                .bind(&r.name)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Record that `page` was flushed. Returns false when it was already marked.
    pub async fn mark_page_complete(&self, page: u32, records_count: u32) -> Result<bool> {
        let scraped_at = format_date_column(Utc::now());
        let scraped_at = scraped_at.as_str();
        let affected = self
            .with_retry("mark_page_complete", move || async move {
                sqlx::query(
                    "INSERT OR IGNORE INTO scraped_pages (page_number, records_count, scraped_at) VALUES (?, ?, ?)",
                )
                .bind(i64::from(page))
                .bind(i64::from(records_count))
                .bind(scraped_at)
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    pub async fn reset_completion_markers(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM scraped_pages")
            .execute(&self.pool)
            .await?
            .rows_affected();
        warn!(deleted, "Completion markers reset");
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn is_page_complete(&self, page: u32) -> Result<bool> {
        let found = self
            .with_retry("is_page_complete", move || async move {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM scraped_pages WHERE page_number = ?")
                    .bind(i64::from(page))
                    .fetch_one(&self.pool)
                    .await
            })
            .await?;
        Ok(found > 0)
    }

    pub async fn completed_pages(&self) -> Result<BTreeSet<u32>> {
        let pages = self
            .with_retry("completed_pages", move || async move {
                sqlx::query_scalar::<_, i64>("SELECT page_number FROM scraped_pages")
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        Ok(pages.into_iter().filter_map(|p| u32::try_from(p).ok()).collect())
    }

    /// Highest-numbered completion marker.
    pub async fn last_completion_marker(&self) -> Result<Option<CompletionMarker>> {
        let marker = sqlx::query_as::<_, CompletionMarker>(
            "SELECT page_number, records_count, scraped_at FROM scraped_pages ORDER BY page_number DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(marker)
    }

    pub async fn first_recorded_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.recorded_date(Bound::First).await
    }

    pub async fn last_recorded_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.recorded_date(Bound::Last).await
    }

    /// Extreme of `coalesce(date, time)`. The `date` column aggregates in SQL;
    /// raw `time` values of undated rows are parsed here, and ones that do
    /// not parse are left out instead of winning a text comparison.
    async fn recorded_date(&self, bound: Bound) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT {}(date) FROM transactions WHERE date IS NOT NULL AND date != ''",
            bound.aggregate()
        );
        let sql = sql.as_str();
        let dated = self
            .with_retry("recorded_date", move || async move {
                sqlx::query_scalar::<_, Option<String>>(sql).fetch_one(&self.pool).await
            })
            .await?;
        let dated = dated.and_then(|s| {
            let parsed = parse_timestamp_str(&s);
            if parsed.is_none() {
                warn!(raw = %s, "Stored date does not parse");
            }
            parsed
        });

        let raw_times = self
            .with_retry("recorded_date", move || async move {
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT time FROM transactions \
                     WHERE (date IS NULL OR date = '') AND time IS NOT NULL AND time != ''",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        let mut unparsable = 0usize;
        let undated = raw_times.iter().filter_map(|raw| {
            let parsed = parse_timestamp_str(raw);
            if parsed.is_none() {
                unparsable += 1;
            }
            parsed
        });
        let undated = match bound {
            Bound::First => undated.min(),
            Bound::Last => undated.max(),
        };
        if unparsable > 0 {
            debug!(unparsable, "Undated rows with unreadable time ignored");
        }

        Ok(match (dated, undated) {
            (Some(a), Some(b)) => Some(match bound {
                Bound::First => a.min(b),
                Bound::Last => a.max(b),
            }),
            (a, b) => a.or(b),
        })
    }

    /// Sales of one item in chronological order. Zero prices are real prices
    /// and stay in.
    pub async fn price_history(&self, name: &str) -> Result<Vec<PricePoint>> {
        let points = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT COALESCE(date, time) AS at, price, amount, type AS tx_type
            FROM transactions
            WHERE name = ?
            ORDER BY COALESCE(date, time) ASC, id ASC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(points)
    }

    /// Every stored sale, oldest first.
    pub async fn all_sales(&self) -> Result<Vec<StoredSale>> {
        let sales = sqlx::query_as::<_, StoredSale>(
            r#"
            SELECT date, time, page_number, batch_number, amount, price,
                   type AS tx_type, agent_kind, from_address, to_address, name
            FROM transactions
            ORDER BY COALESCE(date, time) ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sales)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let stats = sqlx::query_as::<_, StoreStats>(
            r#"
            SELECT
                COUNT(*) AS total_records,
                COALESCE(SUM(CASE WHEN agent_kind = 'machine' THEN 1 ELSE 0 END), 0) AS machine_records,
                COALESCE(SUM(CASE WHEN price = 0 THEN 1 ELSE 0 END), 0) AS zero_price_records,
                COUNT(DISTINCT name) AS distinct_names,
                (SELECT COUNT(*) FROM scraped_pages) AS completed_pages,
                MIN(COALESCE(date, time)) AS first_seen,
                MAX(COALESCE(date, time)) AS last_seen
            FROM transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt <= self.write_retries => {
                    let delay = STORAGE_RETRY_DELAY * attempt;
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, "Storage busy, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(AppError::StorageUnavailable { attempts: attempt, source: e });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pool exhaustion, I/O and SQLite lock contention clear up on their own.
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}
