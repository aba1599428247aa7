//! Backup export of the stored sales as JSON or CSV.

use std::path::Path;

use clap::ValueEnum;
use tracing::info;

use crate::db::models::StoredSale;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

const CSV_HEADER: [&str; 11] = [
    "date",
    "time",
    "page_number",
    "batch_number",
    "amount",
    "price",
    "type",
    "agent_kind",
    "from_address",
    "to_address",
    "name",
];

pub fn render(sales: &[StoredSale], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(sales)?),
        ExportFormat::Csv => render_csv(sales),
    }
}

fn render_csv(sales: &[StoredSale]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(CSV_HEADER)?;

    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    let number = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
    for s in sales {
        wtr.write_record([
            text(&s.date),
            text(&s.time),
            number(s.page_number),
            number(s.batch_number),
            text(&s.amount),
            s.price.to_string(),
            text(&s.tx_type),
            text(&s.agent_kind),
            text(&s.from_address),
            text(&s.to_address),
            text(&s.name),
        ])?;
    }

    wtr.into_inner().map_err(|e| AppError::Io(e.into_error()))
}

/// Render and write `sales` to `path`, replacing any previous export whole.
pub async fn write_export(path: &Path, sales: &[StoredSale], format: ExportFormat) -> Result<()> {
    let bytes = render(sales, format)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    info!(path = %path.display(), records = sales.len(), ?format, "Export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn stored(time: &str, amount: &str, price: f64, name: &str) -> StoredSale {
        StoredSale {
            date: Some(time.to_string()),
            time: Some(time.to_string()),
            page_number: Some(1),
            batch_number: Some(20250101),
            amount: Some(amount.to_string()),
            price,
            tx_type: Some("sale".to_string()),
            agent_kind: Some("human".to_string()),
            from_address: Some("a".to_string()),
            to_address: Some("b".to_string()),
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn csv_has_header_and_blank_cells_for_missing_columns() {
        let mut legacy = stored("2024-01-01T00:00:00Z", "0", 0.0, "Old, Card");
        legacy.date = None;
        legacy.page_number = None;
        let sales = vec![legacy, stored("2025-01-01T00:00:00.000Z", "2500000", 2.5, "Mew")];

        let out = String::from_utf8(render(&sales, ExportFormat::Csv).unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert_eq!(lines[1], ",2024-01-01T00:00:00Z,,20250101,0,0,sale,human,a,b,\"Old, Card\"");
        assert!(lines[2].ends_with(",2500000,2.5,sale,human,a,b,Mew"));
    }

    #[tokio::test]
    async fn json_export_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.json");
        tokio::fs::write(&path, "stale").await.unwrap();

        let sales = vec![stored("2025-01-01T00:00:00.000Z", "2500000", 2.5, "Mew")];
        write_export(&path, &sales, ExportFormat::Json).await.unwrap();

        let body: Value = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(body[0]["type"], "sale");
        assert_eq!(body[0]["price"], 2.5);
        assert!(!dir.path().join("sales.json.tmp").exists());
    }
}
