//! Startup schema check and in-place migration.
//!
//! Runs on a single un-pooled connection. The pool is only built from the
//! `SchemaReady` token this hands back.

use std::collections::HashSet;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{info, warn};

use crate::error::{AppError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TRANSACTIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        date         TEXT,
        page_number  INTEGER,
        batch_number INTEGER,
        time         TEXT,
        amount       TEXT,
        price        REAL NOT NULL DEFAULT 0,
        type         TEXT,
        agent_kind   TEXT,
        from_address TEXT,
        to_address   TEXT,
        name         TEXT,
        created_at   TEXT DEFAULT CURRENT_TIMESTAMP
    )
"#;

const CREATE_SCRAPED_PAGES: &str = r#"
    CREATE TABLE IF NOT EXISTS scraped_pages (
        page_number   INTEGER PRIMARY KEY,
        records_count INTEGER NOT NULL DEFAULT 0,
        scraped_at    TEXT NOT NULL
    )
"#;

/// Columns a store created by an older build may lack, with the definition used
/// to add them. `ALTER TABLE ADD COLUMN` rejects non-constant defaults, hence no
/// CURRENT_TIMESTAMP on `created_at`.
const TRANSACTION_COLUMNS: &[(&str, &str)] = &[
    ("date", "TEXT"),
    ("page_number", "INTEGER"),
    ("batch_number", "INTEGER"),
    ("time", "TEXT"),
    ("amount", "TEXT"),
    ("price", "REAL NOT NULL DEFAULT 0"),
    ("type", "TEXT"),
    ("agent_kind", "TEXT"),
    ("from_address", "TEXT"),
    ("to_address", "TEXT"),
    ("name", "TEXT"),
    ("created_at", "TEXT"),
];

/// Prices rows that predate the `price` column. Only plain positive integer
/// amounts qualify; everything else keeps the 0 default.
const BACKFILL_PRICE: &str = r#"
    UPDATE transactions
    SET price = CAST(amount AS INTEGER) / 1000000.0
    WHERE amount GLOB '[0-9]*'
      AND amount NOT GLOB '*[^0-9]*'
      AND CAST(amount AS INTEGER) > 0
"#;

const SCRAPED_PAGE_COLUMNS: &[(&str, &str)] = &[
    ("records_count", "INTEGER NOT NULL DEFAULT 0"),
    ("scraped_at", "TEXT NOT NULL DEFAULT ''"),
];

const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_identity ON transactions(time, amount, type)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_page ON transactions(page_number)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_batch ON transactions(batch_number)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_time ON transactions(time)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_name ON transactions(name)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_price ON transactions(price)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions(type)",
];

/// Proof that the database file exists and its schema is current. Only
/// `ensure_schema` can produce one.
#[derive(Debug)]
pub struct SchemaReady {
    options: SqliteConnectOptions,
    /// Columns added by this startup's migration, if any.
    pub added_columns: Vec<String>,
}

impl SchemaReady {
    pub fn connect_options(&self) -> SqliteConnectOptions {
        self.options.clone()
    }
}

pub fn connect_options(db_path: &str) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Create the database file and tables if missing, add any missing columns,
/// then create every index. Idempotent; safe on every start.
pub async fn ensure_schema(db_path: &str) -> Result<SchemaReady> {
    let options = connect_options(db_path);
    let mut conn = SqliteConnection::connect_with(&options).await?;

    sqlx::query(CREATE_TRANSACTIONS).execute(&mut conn).await?;
    sqlx::query(CREATE_SCRAPED_PAGES).execute(&mut conn).await?;

    let mut added_columns = add_missing_columns(&mut conn, "transactions", TRANSACTION_COLUMNS).await?;
    added_columns.extend(add_missing_columns(&mut conn, "scraped_pages", SCRAPED_PAGE_COLUMNS).await?);

    if added_columns.iter().any(|c| c == "transactions.price") {
        let priced = sqlx::query(BACKFILL_PRICE)
            .execute(&mut conn)
            .await
            .map_err(|e| AppError::Schema(format!("price backfill failed: {e}")))?
            .rows_affected();
        info!(priced, "Backfilled price on legacy rows");
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(&mut conn)
            .await
            .map_err(|e| AppError::Schema(format!("index creation failed ({ddl}): {e}")))?;
    }

    conn.close().await?;

    if added_columns.is_empty() {
        info!(db_path, "Schema ready");
    } else {
        warn!(db_path, columns = ?added_columns, "Migrated legacy schema in place");
    }

    Ok(SchemaReady { options, added_columns })
}

async fn existing_columns(conn: &mut SqliteConnection, table: &str) -> Result<HashSet<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("name").map_err(AppError::from))
        .collect()
}

async fn add_missing_columns(
    conn: &mut SqliteConnection,
    table: &str,
    wanted: &[(&str, &str)],
) -> Result<Vec<String>> {
    let have = existing_columns(conn, table).await?;
    let mut added = Vec::new();

    for (column, definition) in wanted {
        if have.contains(*column) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::Schema(format!("adding {table}.{column} failed: {e}")))?;
        added.push(format!("{table}.{column}"));
    }

    Ok(added)
}
