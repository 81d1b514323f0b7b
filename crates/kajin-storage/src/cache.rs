//! Incremental store of resolved links, keyed by listing id.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kajin_core::{Listing, ListingId, ResolvedOutcome};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLink {
    pub link: String,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Persisted `id -> {link, expired_at}` map.
///
/// Under normal operation entries are only added, or have `expired_at`
/// upgraded from absent to a timestamp. [`LinkCache::discard_for_recheck`] is
/// the single path that drops entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkCache {
    entries: BTreeMap<ListingId, CachedLink>,
}

impl LinkCache {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking link cache path {}", path.display()))?
        {
            info!(path = %path.display(), "no link cache found, every listing will be resolved");
            return Ok(Self::default());
        }

        let data = fs::read(path)
            .await
            .with_context(|| format!("reading link cache {}", path.display()))?;
        let entries: BTreeMap<ListingId, CachedLink> = serde_json::from_slice(&data)
            .with_context(|| format!("parsing link cache {}", path.display()))?;
        info!(path = %path.display(), entries = entries.len(), "loaded link cache");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ListingId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ListingId) -> Option<ResolvedOutcome> {
        self.entries.get(id).map(|cached| ResolvedOutcome {
            listing_id: id.clone(),
            link: cached.link.clone(),
            expired_at: cached.expired_at,
        })
    }

    /// Ids from `listings` that still need resolving, in batch order.
    ///
    /// With `force_full` every listing is returned regardless of what is cached.
    pub fn delta(&self, listings: &[Listing], force_full: bool) -> Vec<ListingId> {
        let mut seen = HashSet::new();
        listings
            .iter()
            .map(|listing| &listing.id)
            .filter(|id| seen.insert(*id))
            .filter(|id| force_full || !self.entries.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Drops every cached entry ahead of a forced re-check. Returns how many
    /// entries were discarded.
    pub fn discard_for_recheck(&mut self) -> usize {
        let discarded = self.entries.len();
        if discarded > 0 {
            warn!(
                discarded,
                "discarding cached links to re-check every listing for expiration"
            );
        }
        self.entries.clear();
        discarded
    }

    /// Folds new outcomes into the store. A newer outcome replaces the cached
    /// link, but never clears an `expired_at` that is already set.
    /// Returns the number of ids that were not cached before.
    pub fn merge(&mut self, outcomes: impl IntoIterator<Item = ResolvedOutcome>) -> usize {
        let mut added = 0;
        for outcome in outcomes {
            match self.entries.get_mut(&outcome.listing_id) {
                Some(cached) => {
                    cached.link = outcome.link;
                    if cached.expired_at.is_none() {
                        cached.expired_at = outcome.expired_at;
                    }
                }
                None => {
                    self.entries.insert(
                        outcome.listing_id,
                        CachedLink {
                            link: outcome.link,
                            expired_at: outcome.expired_at,
                        },
                    );
                    added += 1;
                }
            }
        }
        added
    }

    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes =
            serde_json::to_vec_pretty(&self.entries).context("serializing link cache")?;
        write_atomic(path, &bytes)
            .await
            .with_context(|| format!("persisting link cache {}", path.display()))
    }
}
