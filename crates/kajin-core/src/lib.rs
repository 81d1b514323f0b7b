//! Core domain model for Kajin: listings, resolved outcomes and fetched responses.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "kajin-core";

/// Stable listing identifier, shared by the feed, the link cache and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListingId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of the saved search (alert) a listing was surfaced under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlertId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One classified ad as retrieved from the bulk feed.
///
/// `attributes` holds every raw feed field that the engine does not interpret
/// (rent, area, coordinates, description, ...). It is carried through to the
/// ledger and exports untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub alert_id: AlertId,
    pub source: String,
    pub declared_expiry: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("feed record is not a JSON object")]
    NotAnObject,
    #[error("feed record has no usable `{0}` field")]
    MissingField(&'static str),
}

impl Listing {
    /// Builds a listing from one `ads[]` entry of the alert dashboard feed.
    ///
    /// The `id`, `alert_id`, `source` and `expired_at` keys are lifted out of the
    /// record; everything else stays in `attributes`.
    pub fn from_feed_record(alert_id: &AlertId, record: JsonValue) -> Result<Self, RecordError> {
        let JsonValue::Object(map) = record else {
            return Err(RecordError::NotAnObject);
        };
        let mut attributes: BTreeMap<String, JsonValue> = map.into_iter().collect();

        let id = attributes
            .remove("id")
            .as_ref()
            .and_then(scalar_to_string)
            .ok_or(RecordError::MissingField("id"))?;
        let source = attributes
            .remove("source")
            .as_ref()
            .and_then(scalar_to_string)
            .ok_or(RecordError::MissingField("source"))?;
        let declared_expiry = attributes
            .remove("expired_at")
            .as_ref()
            .and_then(JsonValue::as_str)
            .and_then(parse_timestamp);
        attributes.remove("alert_id");

        Ok(Self {
            id: ListingId::new(id),
            alert_id: alert_id.clone(),
            source,
            declared_expiry,
            attributes,
        })
    }
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses the timestamp shapes the upstream API emits (RFC 3339, or a naive
/// `YYYY-MM-DD HH:MM:SS` taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Result of resolving one listing: where it really points and whether the
/// originating source has removed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutcome {
    pub listing_id: ListingId,
    pub link: String,
    pub expired_at: Option<DateTime<Utc>>,
}

impl ResolvedOutcome {
    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }
}

/// What a single listing fetch yields: the URL after redirects, the HTTP status
/// and the body when it decoded as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedListing {
    pub final_url: String,
    pub status: u16,
    pub body: Option<String>,
}
