//! Per-source expiration signatures + the collaborator contracts the resolver
//! and cleanup steps run against.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kajin_core::{AlertId, FetchedListing, Listing, ListingId};
use kajin_storage::{FetchError, UpstreamClient};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "kajin-adapters";

/// Upstream sites a listing can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    LogicImmo,
    Leboncoin,
    Century21,
    MeilleursAgents,
    Locservice,
    LagenceBlue,
    Pap,
    SeLoger,
    Paruvendu,
    Laforet,
    AvendreAlouer,
    Orpi,
    Explorimmo,
    StephanePlaza,
    Flatlooker,
    Bienici,
    GuyHoquet,
    ParisAttitude,
    Fnaim,
    EraFrance,
    Jinka,
}

const ALL_SOURCES: [Source; 21] = [
    Source::LogicImmo,
    Source::Leboncoin,
    Source::Century21,
    Source::MeilleursAgents,
    Source::Locservice,
    Source::LagenceBlue,
    Source::Pap,
    Source::SeLoger,
    Source::Paruvendu,
    Source::Laforet,
    Source::AvendreAlouer,
    Source::Orpi,
    Source::Explorimmo,
    Source::StephanePlaza,
    Source::Flatlooker,
    Source::Bienici,
    Source::GuyHoquet,
    Source::ParisAttitude,
    Source::Fnaim,
    Source::EraFrance,
    Source::Jinka,
];

/// How a source signals that a listing was taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionRule {
    /// A marker element in the fetched HTML.
    DocumentMarker(MarkerRule),
    /// The shape of the URL the ad redirected to.
    RedirectPath(PathRule),
    /// No reliable signal; never reports expiration.
    PassThrough,
    /// The feed already carries the expiration timestamp.
    Declared,
}

impl DetectionRule {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::DocumentMarker(_) => "document-marker",
            Self::RedirectPath(_) => "redirect-path",
            Self::PassThrough => "pass-through",
            Self::Declared => "declared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerRule {
    /// Any element matching the selector.
    Class(&'static str),
    /// The first element matching `selector` must contain an `inner` element
    /// whose trimmed text equals `text`.
    ClassWithText {
        selector: &'static str,
        inner: &'static str,
        text: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRule {
    /// One `/`-separated piece of the final URL equals the sentinel.
    SegmentEquals {
        index: SegmentIndex,
        sentinel: &'static str,
    },
    /// The last `/`-separated piece contains the sentinel.
    TailContains(&'static str),
}

/// Position in `final_url.split('/')`. `FromStart(3)` is the first path
/// segment of an absolute URL; `FromEnd(0)` is the last piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentIndex {
    FromStart(usize),
    FromEnd(usize),
}

impl SegmentIndex {
    fn pick<'a>(self, pieces: &[&'a str]) -> Option<&'a str> {
        let index = match self {
            Self::FromStart(i) => i,
            Self::FromEnd(i) => pieces.len().checked_sub(i + 1)?,
        };
        pieces.get(index).copied()
    }
}

impl PathRule {
    pub fn matches(&self, final_url: &str) -> bool {
        let pieces: Vec<&str> = final_url.split('/').collect();
        match *self {
            Self::SegmentEquals { index, sentinel } => index.pick(&pieces) == Some(sentinel),
            Self::TailContains(sentinel) => pieces.last().is_some_and(|p| p.contains(sentinel)),
        }
    }
}

impl Source {
    pub fn all() -> &'static [Source] {
        &ALL_SOURCES
    }

    pub fn from_id(id: &str) -> Option<Self> {
        ALL_SOURCES.iter().copied().find(|s| s.id() == id)
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::LogicImmo => "logic-immo",
            Self::Leboncoin => "leboncoin",
            Self::Century21 => "century21",
            Self::MeilleursAgents => "meilleursagents",
            Self::Locservice => "locservice",
            Self::LagenceBlue => "lagenceblue",
            Self::Pap => "pap",
            Self::SeLoger => "seloger",
            Self::Paruvendu => "paruvendu",
            Self::Laforet => "laforet",
            Self::AvendreAlouer => "avendrealouer",
            Self::Orpi => "orpi",
            Self::Explorimmo => "explorimmo",
            Self::StephanePlaza => "stephaneplaza",
            Self::Flatlooker => "flatlooker",
            Self::Bienici => "bienici",
            Self::GuyHoquet => "guyhoquet",
            Self::ParisAttitude => "parisattitude",
            Self::Fnaim => "fnaim",
            Self::EraFrance => "erafrance",
            Self::Jinka => "jinka",
        }
    }

    pub fn rule(self) -> DetectionRule {
        use DetectionRule::*;
        use SegmentIndex::*;

        match self {
            Self::LogicImmo => DocumentMarker(MarkerRule::Class(".expiredTxt")),
            Self::Leboncoin => DocumentMarker(MarkerRule::Class("._1oejz._1hnil._1-TTU._35DXM")),
            Self::Century21 => DocumentMarker(MarkerRule::ClassWithText {
                selector: ".content_msg",
                inner: "strong",
                text: "Nous sommes désolés, la page à laquelle vous tentez d'accéder n'existe pas.",
            }),
            Self::MeilleursAgents => DocumentMarker(MarkerRule::Class(".error-page")),
            Self::Locservice => DocumentMarker(MarkerRule::Class(".louerecemment")),
            Self::LagenceBlue => DocumentMarker(MarkerRule::Class(".label.label-warning")),
            Self::Pap => RedirectPath(PathRule::SegmentEquals {
                index: FromStart(3),
                sentinel: "annonce",
            }),
            Self::SeLoger => RedirectPath(PathRule::SegmentEquals {
                index: FromEnd(0),
                sentinel: "#expiree",
            }),
            Self::Paruvendu => RedirectPath(PathRule::SegmentEquals {
                index: FromEnd(0),
                sentinel: "#showError404",
            }),
            Self::Laforet => RedirectPath(PathRule::SegmentEquals {
                index: FromStart(3),
                sentinel: "ville",
            }),
            Self::AvendreAlouer => RedirectPath(PathRule::TailContains("#expiree")),
            Self::Orpi => RedirectPath(PathRule::SegmentEquals {
                index: FromEnd(1),
                sentinel: "louer-appartement",
            }),
            Self::Explorimmo
            | Self::StephanePlaza
            | Self::Flatlooker
            | Self::Bienici
            | Self::GuyHoquet
            | Self::ParisAttitude
            | Self::Fnaim
            | Self::EraFrance => PassThrough,
            Self::Jinka => Declared,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid selector {selector:?} for source {source_id}: {message}")]
    Selector {
        source_id: &'static str,
        selector: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
struct CompiledMarker {
    selector: Selector,
    inner: Option<(Selector, &'static str)>,
}

impl CompiledMarker {
    fn found_in(&self, document: &Html) -> bool {
        match &self.inner {
            None => document.select(&self.selector).next().is_some(),
            Some((inner, text)) => document
                .select(&self.selector)
                .next()
                .and_then(|el| el.select(inner).next())
                .is_some_and(|el| el.text().collect::<String>().trim() == *text),
        }
    }
}

fn compile(source: Source, selector: &'static str) -> Result<Selector, SignatureError> {
    Selector::parse(selector).map_err(|e| SignatureError::Selector {
        source_id: source.id(),
        selector,
        message: e.to_string(),
    })
}

/// The source table with its selectors compiled, built once per run.
#[derive(Debug, Clone)]
pub struct SignatureRegistry {
    markers: HashMap<Source, CompiledMarker>,
}

impl SignatureRegistry {
    pub fn builtin() -> Result<Self, SignatureError> {
        let mut markers = HashMap::new();
        for &source in Source::all() {
            let DetectionRule::DocumentMarker(rule) = source.rule() else {
                continue;
            };
            let compiled = match rule {
                MarkerRule::Class(selector) => CompiledMarker {
                    selector: compile(source, selector)?,
                    inner: None,
                },
                MarkerRule::ClassWithText {
                    selector,
                    inner,
                    text,
                } => CompiledMarker {
                    selector: compile(source, selector)?,
                    inner: Some((compile(source, inner)?, text)),
                },
            };
            markers.insert(source, compiled);
        }
        Ok(Self { markers })
    }

    /// Expiration timestamp for one fetched listing, or `None` when the listing
    /// is live or the source gives no usable signal.
    ///
    /// Unknown sources and unexpected page or URL shapes all yield `None`.
    pub fn detect(
        &self,
        source_id: &str,
        response: &FetchedListing,
        declared_expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let Some(source) = Source::from_id(source_id) else {
            debug!(source_id, "no signature for source; expiration unknown");
            return None;
        };

        match source.rule() {
            DetectionRule::DocumentMarker(_) => {
                let marker = self.markers.get(&source)?;
                let body = response.body.as_deref()?;
                let document = Html::parse_document(body);
                marker.found_in(&document).then_some(now)
            }
            DetectionRule::RedirectPath(rule) => rule.matches(&response.final_url).then_some(now),
            DetectionRule::PassThrough => None,
            DetectionRule::Declared => declared_expiry,
        }
    }
}

/// Performs the single HTTP retrieval behind one listing.
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch(
        &self,
        alert_id: &AlertId,
        listing_id: &ListingId,
    ) -> Result<FetchedListing, FetchError>;
}

/// Tells the aggregator a listing's link is dead.
#[async_trait]
pub trait AbuseReporter: Send + Sync {
    async fn report_removed(&self, alert_id: &AlertId, listing_id: &ListingId)
        -> anyhow::Result<()>;
}

/// Supplies the current batch of listings across every alert.
#[async_trait]
pub trait ListingFeed: Send + Sync {
    async fn fetch_batch(&self) -> anyhow::Result<Vec<Listing>>;
}

#[async_trait]
impl ListingFetcher for UpstreamClient {
    async fn fetch(
        &self,
        alert_id: &AlertId,
        listing_id: &ListingId,
    ) -> Result<FetchedListing, FetchError> {
        self.view_ad(alert_id, listing_id).await
    }
}

#[async_trait]
impl AbuseReporter for UpstreamClient {
    async fn report_removed(
        &self,
        alert_id: &AlertId,
        listing_id: &ListingId,
    ) -> anyhow::Result<()> {
        self.report_abuse(alert_id, listing_id).await?;
        Ok(())
    }
}

#[async_trait]
impl ListingFeed for UpstreamClient {
    async fn fetch_batch(&self) -> anyhow::Result<Vec<Listing>> {
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for alert in self.alerts().await? {
            let records = self.alert_listings(&alert).await?;
            info!(alert_id = %alert.id, name = %alert.name, ads = records.len(), "retrieved alert listings");
            for record in records {
                match Listing::from_feed_record(&alert.id, record) {
                    Ok(listing) if seen.insert(listing.id.clone()) => batch.push(listing),
                    Ok(listing) => {
                        debug!(listing_id = %listing.id, alert_id = %alert.id, "listing already surfaced by another alert");
                    }
                    Err(err) => warn!(alert_id = %alert.id, error = %err, "skipping unusable feed record"),
                }
            }
        }
        Ok(batch)
    }
}
