//! Append-only history of every listing ever observed.
//!
//! Rows are never removed. The only in-place update is stamping `expired_at`,
//! and a stamp once written is kept.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kajin_core::{Listing, ListingId, ResolvedOutcome};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::table::{self, format_timestamp};

/// One flattened listing snapshot as stored in the ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub id: ListingId,
    pub fields: BTreeMap<String, String>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    pub fn from_listing(listing: &Listing) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("alert_id".to_string(), listing.alert_id.to_string());
        fields.insert("source".to_string(), listing.source.clone());
        fields.insert(
            "declared_expired_at".to_string(),
            listing
                .declared_expiry
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
        );
        for (key, value) in &listing.attributes {
            fields.insert(key.clone(), cell_text(value));
        }
        Self {
            id: listing.id.clone(),
            fields,
            expired_at: None,
        }
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("listing {0} was stamped before being appended to the ledger")]
    UnknownListing(ListingId),
    #[error("no resolved outcome supplied for listing {0}")]
    MissingOutcome(ListingId),
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    rows: Vec<LedgerRow>,
    index: HashMap<ListingId, usize>,
}

impl Ledger {
    pub fn from_rows(rows: impl IntoIterator<Item = LedgerRow>) -> Self {
        let mut ledger = Self::default();
        for row in rows {
            if ledger.index.contains_key(&row.id) {
                warn!(listing_id = %row.id, "duplicate ledger row ignored; first one wins");
                continue;
            }
            ledger.index.insert(row.id.clone(), ledger.rows.len());
            ledger.rows.push(row);
        }
        ledger
    }

    /// Loads the ledger table. An absent file is a cold start. A file that
    /// cannot be parsed is moved aside rather than overwritten at end of run.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking ledger path {}", path.display()))?
        {
            info!(path = %path.display(), "no ledger found, starting a new history");
            return Ok(Self::default());
        }

        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading ledger {}", path.display()))?;
        match table::decode_rows(&bytes) {
            Ok(rows) => {
                let ledger = Self::from_rows(rows);
                info!(path = %path.display(), rows = ledger.len(), "loaded ledger");
                Ok(ledger)
            }
            Err(err) => {
                let aside = unreadable_path(path, Utc::now());
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "ledger is unreadable; moving it aside and starting a new history"
                );
                fs::rename(path, &aside).await.with_context(|| {
                    format!("moving unreadable ledger to {}", aside.display())
                })?;
                Ok(Self::default())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: &ListingId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ListingId) -> Option<&LedgerRow> {
        self.index.get(id).map(|&i| &self.rows[i])
    }

    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    pub fn ids(&self) -> impl Iterator<Item = &ListingId> {
        self.rows.iter().map(|row| &row.id)
    }

    /// Inserts a row for every listing not yet in the ledger, in batch order.
    /// Returns the number of rows added.
    pub fn append_new(&mut self, listings: &[Listing]) -> usize {
        let mut added = 0;
        for listing in listings {
            if self.index.contains_key(&listing.id) {
                continue;
            }
            self.index.insert(listing.id.clone(), self.rows.len());
            self.rows.push(LedgerRow::from_listing(listing));
            added += 1;
        }
        added
    }

    /// Copies `expired_at` from `outcomes` onto the rows named in `expired_ids`.
    ///
    /// Every id must already be in the ledger and have an outcome; nothing is
    /// written if either check fails. Rows already stamped keep their stamp.
    /// Returns the number of rows newly stamped.
    pub fn stamp_expired(
        &mut self,
        expired_ids: &[ListingId],
        outcomes: &[ResolvedOutcome],
    ) -> Result<usize, LedgerError> {
        let by_id: HashMap<&ListingId, &ResolvedOutcome> =
            outcomes.iter().map(|o| (&o.listing_id, o)).collect();

        let mut updates = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            let Some(&row_index) = self.index.get(id) else {
                return Err(LedgerError::UnknownListing(id.clone()));
            };
            let Some(outcome) = by_id.get(id) else {
                return Err(LedgerError::MissingOutcome(id.clone()));
            };
            updates.push((row_index, outcome.expired_at));
        }

        let mut stamped = 0;
        for (row_index, expired_at) in updates {
            let row = &mut self.rows[row_index];
            if row.expired_at.is_none() && expired_at.is_some() {
                row.expired_at = expired_at;
                stamped += 1;
            }
        }
        Ok(stamped)
    }

    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        table::write_rows(path.as_ref(), &self.rows).await
    }
}

fn unreadable_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    path.with_file_name(format!("{name}.unreadable-{}", at.format("%Y%m%dT%H%M%SZ")))
}
