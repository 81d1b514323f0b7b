//! Flat CSV table shared by the ledger, the expired snapshot and the active
//! export. Cells are quoted unless numeric, so free text round-trips exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use kajin_core::{parse_timestamp, ListingId};

use crate::ledger::LedgerRow;
use crate::write_atomic;

pub const ID_COLUMN: &str = "id";
pub const EXPIRED_AT_COLUMN: &str = "expired_at";
const LEADING_COLUMNS: [&str; 2] = ["alert_id", "source"];

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// `id`, the leading columns that exist, every other column sorted, `expired_at`.
pub fn header_for(rows: &[LedgerRow]) -> Vec<String> {
    let mut others: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.fields.keys().map(String::as_str))
        .collect();

    let mut header = vec![ID_COLUMN.to_string()];
    for column in LEADING_COLUMNS {
        if others.remove(column) {
            header.push(column.to_string());
        }
    }
    header.extend(others.into_iter().map(ToString::to_string));
    header.push(EXPIRED_AT_COLUMN.to_string());
    header
}

pub fn encode_rows(rows: &[LedgerRow]) -> Result<Vec<u8>> {
    let header = header_for(rows);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new());
    writer
        .write_record(&header)
        .context("writing table header")?;

    for row in rows {
        let record = header.iter().map(|column| match column.as_str() {
            ID_COLUMN => row.id.to_string(),
            EXPIRED_AT_COLUMN => row
                .expired_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
            other => row.fields.get(other).cloned().unwrap_or_default(),
        });
        writer
            .write_record(record)
            .with_context(|| format!("writing table row {}", row.id))?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing table buffer: {}", err.error()))
}

pub fn decode_rows(bytes: &[u8]) -> Result<Vec<LedgerRow>> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let header: Vec<String> = reader
        .headers()
        .context("reading table header")?
        .iter()
        .map(ToString::to_string)
        .collect();
    let Some(id_index) = header.iter().position(|c| c == ID_COLUMN) else {
        bail!("table has no `{ID_COLUMN}` column");
    };

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading table row {}", line + 1))?;
        let id = record.get(id_index).unwrap_or_default().trim();
        if id.is_empty() {
            bail!("table row {} has an empty id", line + 1);
        }

        let mut fields = BTreeMap::new();
        let mut expired_at = None;
        for (column, cell) in header.iter().zip(record.iter()) {
            match column.as_str() {
                ID_COLUMN => {}
                EXPIRED_AT_COLUMN => expired_at = parse_timestamp(cell),
                other => {
                    fields.insert(other.to_string(), cell.to_string());
                }
            }
        }
        rows.push(LedgerRow {
            id: ListingId::new(id),
            fields,
            expired_at,
        });
    }
    Ok(rows)
}

pub async fn write_rows(path: &Path, rows: &[LedgerRow]) -> Result<()> {
    let bytes = encode_rows(rows)?;
    write_atomic(path, &bytes)
        .await
        .with_context(|| format!("persisting table {}", path.display()))
}
