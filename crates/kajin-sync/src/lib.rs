//! Run orchestration: resolve pending listings, fold outcomes into the link
//! cache and ledger, and sweep expired listings when asked to.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kajin_adapters::{AbuseReporter, ListingFeed, ListingFetcher, SignatureRegistry};
use kajin_core::{FetchedListing, Listing, ListingId, ResolvedOutcome};
use kajin_storage::http::DEFAULT_API_BASE;
use kajin_storage::table::write_rows;
use kajin_storage::{
    FetchError, Ledger, LedgerRow, LinkCache, RetryPolicy, UpstreamClient, UpstreamConfig,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kajin-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub databases_dir: PathBuf,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry_backoff_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("KAJIN_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            email: std::env::var("KAJIN_EMAIL").ok(),
            password: std::env::var("KAJIN_PASSWORD").ok(),
            databases_dir: std::env::var("KAJIN_DATABASES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./databases")),
            data_dir: std::env::var("KAJIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("KAJIN_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/88.0.4324.190 Safari/537.36".to_string()
            }),
            http_timeout_secs: std::env::var("KAJIN_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            retry_backoff_secs: std::env::var("KAJIN_RETRY_BACKOFF_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Defaults rooted at `root`, ignoring the environment.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            email: None,
            password: None,
            databases_dir: root.join("databases"),
            data_dir: root.join("data"),
            user_agent: "kajin".to_string(),
            http_timeout_secs: 20,
            retry_backoff_secs: 30,
        }
    }

    pub fn link_cache_path(&self) -> PathBuf {
        self.databases_dir.join("appart_links_db.json")
    }

    pub fn expired_snapshot_path(&self) -> PathBuf {
        self.databases_dir.join("last_deleted_apparts.csv")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("history.csv")
    }

    pub fn active_export_path(&self) -> PathBuf {
        self.data_dir.join("apparts.csv")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.databases_dir.join("logs.log")
    }

    /// Creates the databases directory if needed and truncates the run log, so
    /// the file only ever holds the latest run.
    pub fn open_run_log(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.databases_dir)
            .with_context(|| format!("creating {}", self.databases_dir.display()))?;
        let path = self.run_log_path();
        std::fs::File::create(&path).with_context(|| format!("opening run log {}", path.display()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_secs(self.retry_backoff_secs),
            ..Default::default()
        }
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.api_base.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// What the caller asked this run to do beyond the incremental pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// Re-resolve every listing and remove the ones found expired.
    pub sweep: bool,
    /// Throw away the whole link cache before resolving.
    pub rebuild_cache: bool,
}

/// Drives one listing through the fetcher and the signature registry.
pub struct Resolver {
    fetcher: Arc<dyn ListingFetcher>,
    registry: SignatureRegistry,
    retry: RetryPolicy,
}

impl Resolver {
    pub fn new(
        fetcher: Arc<dyn ListingFetcher>,
        registry: SignatureRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            registry,
            retry,
        }
    }

    pub async fn resolve(&self, listing: &Listing) -> Result<ResolvedOutcome, FetchError> {
        let span = info_span!("resolve", listing_id = %listing.id, source = %listing.source);
        async {
            let response = self.fetch_with_retry(listing).await?;
            let expired_at = self.registry.detect(
                &listing.source,
                &response,
                listing.declared_expiry,
                Utc::now(),
            );
            debug!(link = %response.final_url, status = response.status, expired = expired_at.is_some(), "resolved");
            Ok(ResolvedOutcome {
                listing_id: listing.id.clone(),
                link: response.final_url,
                expired_at,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_with_retry(&self, listing: &Listing) -> Result<FetchedListing, FetchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.fetcher.fetch(&listing.alert_id, &listing.id).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && self.retry.allows_retry(attempts) => {
                    warn!(
                        attempt = attempts,
                        backoff_secs = self.retry.backoff.as_secs_f64(),
                        error = %err,
                        "transient fetch failure, backing off before retrying"
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A listing in the working set together with its current outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveListing {
    pub listing: Listing,
    pub outcome: ResolvedOutcome,
}

impl ActiveListing {
    /// Ledger-shaped row carrying the outcome's expiration stamp.
    pub fn snapshot_row(&self) -> LedgerRow {
        let mut row = LedgerRow::from_listing(&self.listing);
        row.expired_at = self.outcome.expired_at;
        row
    }

    /// Snapshot row plus the resolved link, for the active-set export.
    pub fn export_row(&self) -> LedgerRow {
        let mut row = self.snapshot_row();
        row.fields
            .insert("link".to_string(), self.outcome.link.clone());
        row
    }
}

#[derive(Debug)]
pub struct SweepReport {
    pub survivors: Vec<ActiveListing>,
    pub removed: Vec<ListingId>,
    pub failed_reports: usize,
}

/// Removes expired listings from the working set after snapshotting them and
/// reporting each one upstream.
pub struct CleanupCoordinator {
    reporter: Arc<dyn AbuseReporter>,
    snapshot_path: PathBuf,
}

impl CleanupCoordinator {
    pub fn new(reporter: Arc<dyn AbuseReporter>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            reporter,
            snapshot_path: snapshot_path.into(),
        }
    }

    pub async fn sweep(
        &self,
        active: Vec<ActiveListing>,
        expired_ids: &[ListingId],
    ) -> Result<SweepReport> {
        let expired: HashSet<&ListingId> = expired_ids.iter().collect();
        let (removed, survivors): (Vec<ActiveListing>, Vec<ActiveListing>) = active
            .into_iter()
            .partition(|item| expired.contains(&item.listing.id));
        info!(expired = removed.len(), "starting the cleaning of expired listings");

        let rows: Vec<LedgerRow> = removed.iter().map(ActiveListing::snapshot_row).collect();
        write_rows(&self.snapshot_path, &rows)
            .await
            .with_context(|| format!("writing expired snapshot {}", self.snapshot_path.display()))?;

        let mut failed_reports = 0;
        for item in &removed {
            if let Err(err) = self
                .reporter
                .report_removed(&item.listing.alert_id, &item.listing.id)
                .await
            {
                failed_reports += 1;
                warn!(
                    listing_id = %item.listing.id,
                    alert_id = %item.listing.alert_id,
                    error = %err,
                    "removal report failed; dropping the listing locally anyway"
                );
            }
        }

        info!(
            removed = removed.len(),
            remaining = survivors.len(),
            failed_reports,
            "finished cleaning expired listings"
        );
        Ok(SweepReport {
            survivors,
            removed: removed.into_iter().map(|item| item.listing.id).collect(),
            failed_reports,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sweep: bool,
    pub batch_size: usize,
    pub resolved: usize,
    pub from_cache: usize,
    pub newly_expired: usize,
    pub ledger_appended: usize,
    pub ledger_stamped: usize,
    pub ledger_rows: usize,
    pub removed: usize,
    pub failed_reports: usize,
    pub active: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    feed: Arc<dyn ListingFeed>,
    resolver: Resolver,
    cleanup: CleanupCoordinator,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        feed: Arc<dyn ListingFeed>,
        fetcher: Arc<dyn ListingFetcher>,
        reporter: Arc<dyn AbuseReporter>,
    ) -> Result<Self> {
        let registry = SignatureRegistry::builtin().context("compiling source signatures")?;
        let resolver = Resolver::new(fetcher, registry, config.retry_policy());
        let cleanup = CleanupCoordinator::new(reporter, config.expired_snapshot_path());
        Ok(Self {
            config,
            feed,
            resolver,
            cleanup,
        })
    }

    /// Logs in with the configured credentials and wires the upstream client
    /// in as feed, fetcher and reporter.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let (Some(email), Some(password)) = (config.email.as_deref(), config.password.as_deref())
        else {
            anyhow::bail!("no credentials: set KAJIN_EMAIL and KAJIN_PASSWORD or pass --email/--password");
        };
        let client = Arc::new(
            UpstreamClient::login(&config.upstream_config(), email, password)
                .await
                .context("authenticating against the aggregator API")?,
        );
        Self::new(config, client.clone(), client.clone(), client)
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<RunSummary> {
        let listings = self
            .feed
            .fetch_batch()
            .await
            .context("retrieving listings from the feed")?;
        self.run_batch(listings, mode).await
    }

    pub async fn run_batch(&self, listings: Vec<Listing>, mode: RunMode) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let listings = dedup_by_id(listings);
        info!(%run_id, listings = listings.len(), sweep = mode.sweep, "starting run");

        let cache_path = self.config.link_cache_path();
        let ledger_path = self.config.ledger_path();
        let mut cache = LinkCache::load(&cache_path).await?;
        let mut ledger = Ledger::load(&ledger_path).await?;

        let ledger_appended = ledger.append_new(&listings);
        info!(appended = ledger_appended, total = ledger.len(), "ledger updated with new listings");

        if mode.rebuild_cache {
            cache.discard_for_recheck();
        }
        let pending: HashSet<ListingId> = cache.delta(&listings, mode.sweep).into_iter().collect();
        info!(pending = pending.len(), "listings need resolving");

        let mut fresh = Vec::with_capacity(pending.len());
        for (i, listing) in listings.iter().filter(|l| pending.contains(&l.id)).enumerate() {
            let outcome = self
                .resolver
                .resolve(listing)
                .await
                .with_context(|| format!("resolving listing {}", listing.id))?;
            fresh.push(outcome);
            if (i + 1) % 25 == 0 || i + 1 == pending.len() {
                info!("resolved {}/{} listings", i + 1, pending.len());
            }
        }
        let resolved = fresh.len();
        cache.merge(fresh);

        let mut active = Vec::with_capacity(listings.len());
        for listing in listings {
            let outcome = cache
                .get(&listing.id)
                .with_context(|| format!("listing {} missing from link cache after merge", listing.id))?;
            active.push(ActiveListing { listing, outcome });
        }

        let newly_expired: Vec<ListingId> = active
            .iter()
            .filter(|item| pending.contains(&item.listing.id) && item.outcome.is_expired())
            .map(|item| item.listing.id.clone())
            .collect();
        // Cached expirations count as well; rows already stamped keep their stamp.
        let expired_in_batch: Vec<ListingId> = active
            .iter()
            .filter(|item| item.outcome.is_expired())
            .map(|item| item.listing.id.clone())
            .collect();
        let outcomes: Vec<ResolvedOutcome> = active.iter().map(|item| item.outcome.clone()).collect();
        let stamped = ledger
            .stamp_expired(&expired_in_batch, &outcomes)
            .context("stamping expired listings in the ledger")?;
        if !newly_expired.is_empty() {
            warn!(expired = newly_expired.len(), stamped, "listings have expired");
        }

        let (active, removed, failed_reports) = if mode.sweep {
            let report = self.cleanup.sweep(active, &newly_expired).await?;
            (report.survivors, report.removed.len(), report.failed_reports)
        } else {
            (active, 0, 0)
        };

        cache.persist(&cache_path).await?;
        ledger.persist(&ledger_path).await?;
        let export: Vec<LedgerRow> = active.iter().map(ActiveListing::export_row).collect();
        write_rows(&self.config.active_export_path(), &export).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sweep: mode.sweep,
            batch_size: outcomes.len(),
            resolved,
            from_cache: outcomes.len() - resolved,
            newly_expired: newly_expired.len(),
            ledger_appended,
            ledger_stamped: stamped,
            ledger_rows: ledger.len(),
            removed,
            failed_reports,
            active: active.len(),
        };
        info!(
            %run_id,
            resolved = summary.resolved,
            from_cache = summary.from_cache,
            newly_expired = summary.newly_expired,
            removed = summary.removed,
            "run complete"
        );
        Ok(summary)
    }
}

fn dedup_by_id(listings: Vec<Listing>) -> Vec<Listing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| {
            let first = seen.insert(listing.id.clone());
            if !first {
                debug!(listing_id = %listing.id, "duplicate listing in batch ignored");
            }
            first
        })
        .collect()
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<RunSummary> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
    pipeline.run_once(mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kajin_core::AlertId;
    use kajin_storage::table::decode_rows;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Clone)]
    enum Planned {
        Page { url: &'static str, body: Option<&'static str> },
        Transient,
        Fatal,
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        plans: Mutex<HashMap<ListingId, VecDeque<Planned>>>,
        fallback: HashMap<ListingId, Planned>,
        calls: Mutex<Vec<ListingId>>,
    }

    impl ScriptedFetcher {
        fn always(pages: &[(&str, Planned)]) -> Self {
            Self {
                fallback: pages
                    .iter()
                    .map(|(id, plan)| (ListingId::from(*id), plan.clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn scripted(id: &str, plans: Vec<Planned>) -> Self {
            let fetcher = Self::default();
            fetcher
                .plans
                .lock()
                .unwrap()
                .insert(ListingId::from(id), plans.into());
            fetcher
        }

        fn calls(&self) -> Vec<ListingId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ListingFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _alert_id: &AlertId,
            listing_id: &ListingId,
        ) -> Result<FetchedListing, FetchError> {
            self.calls.lock().unwrap().push(listing_id.clone());
            let plan = self
                .plans
                .lock()
                .unwrap()
                .get_mut(listing_id)
                .and_then(VecDeque::pop_front)
                .or_else(|| self.fallback.get(listing_id).cloned())
                .expect("unplanned fetch");
            let io = |kind| std::io::Error::new(kind, "scripted");
            match plan {
                Planned::Page { url, body } => Ok(FetchedListing {
                    final_url: url.to_string(),
                    status: 200,
                    body: body.map(ToString::to_string),
                }),
                Planned::Transient => Err(FetchError::transient(
                    "http://upstream",
                    io(std::io::ErrorKind::ConnectionRefused),
                )),
                Planned::Fatal => Err(FetchError::fatal(
                    "http://upstream",
                    io(std::io::ErrorKind::InvalidData),
                )),
            }
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        fail_for: HashSet<ListingId>,
        reports: Mutex<Vec<(AlertId, ListingId)>>,
    }

    #[async_trait]
    impl AbuseReporter for RecordingReporter {
        async fn report_removed(
            &self,
            alert_id: &AlertId,
            listing_id: &ListingId,
        ) -> anyhow::Result<()> {
            self.reports
                .lock()
                .unwrap()
                .push((alert_id.clone(), listing_id.clone()));
            if self.fail_for.contains(listing_id) {
                anyhow::bail!("upstream returned 500");
            }
            Ok(())
        }
    }

    struct StaticFeed(Vec<Listing>);

    #[async_trait]
    impl ListingFeed for StaticFeed {
        async fn fetch_batch(&self) -> anyhow::Result<Vec<Listing>> {
            Ok(self.0.clone())
        }
    }

    fn listing(id: &str, source: &str) -> Listing {
        Listing::from_feed_record(
            &AlertId::from("alert-9"),
            json!({
                "id": id,
                "source": source,
                "rent": 1100,
                "area": 42,
                "description": format!("Annonce {id}, \"vue dégagée\"")
            }),
        )
        .unwrap()
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    const MARKER_PAGE: &str =
        r#"<html><body><div class="expiredTxt">Annonce expirée</div></body></html>"#;

    fn abc_fetcher() -> ScriptedFetcher {
        ScriptedFetcher::always(&[
            (
                "A",
                Planned::Page {
                    url: "https://www.logic-immo.com/detail-location-A.htm",
                    body: Some(MARKER_PAGE),
                },
            ),
            (
                "B",
                Planned::Page {
                    url: "https://www.bienici.com/annonce/location/B",
                    body: Some("<html></html>"),
                },
            ),
            (
                "C",
                Planned::Page {
                    url: "https://www.pap.fr/annonce/locations-appartement-paris-75-g439",
                    body: None,
                },
            ),
        ])
    }

    fn abc_batch() -> Vec<Listing> {
        vec![listing("A", "logic-immo"), listing("B", "bienici"), listing("C", "pap")]
    }

    fn pipeline(
        root: &std::path::Path,
        fetcher: Arc<ScriptedFetcher>,
        reporter: Arc<RecordingReporter>,
    ) -> SyncPipeline {
        let mut config = SyncConfig::rooted_at(root);
        config.retry_backoff_secs = 0;
        SyncPipeline::new(config, Arc::new(StaticFeed(abc_batch())), fetcher, reporter).unwrap()
    }

    #[test]
    fn run_log_is_truncated_per_run() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::rooted_at(dir.path().join("fresh"));

        {
            use std::io::Write;
            let mut log = config.open_run_log().unwrap();
            writeln!(log, "previous run").unwrap();
        }
        assert!(config.run_log_path().starts_with(&config.databases_dir));
        assert!(!std::fs::read_to_string(config.run_log_path()).unwrap().is_empty());

        config.open_run_log().unwrap();
        assert_eq!(std::fs::read_to_string(config.run_log_path()).unwrap(), "");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_exactly_once() {
        let fetcher = Arc::new(ScriptedFetcher::scripted(
            "A",
            vec![
                Planned::Transient,
                Planned::Page {
                    url: "https://www.pap.fr/annonce/locations",
                    body: None,
                },
            ],
        ));
        let resolver =
            Resolver::new(fetcher.clone(), SignatureRegistry::builtin().unwrap(), quick_retry());

        let outcome = resolver.resolve(&listing("A", "pap")).await.unwrap();
        assert_eq!(outcome.link, "https://www.pap.fr/annonce/locations");
        assert!(outcome.is_expired());
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_is_propagated() {
        let fetcher = Arc::new(ScriptedFetcher::scripted(
            "A",
            vec![Planned::Transient, Planned::Transient, Planned::Transient],
        ));
        let resolver =
            Resolver::new(fetcher.clone(), SignatureRegistry::builtin().unwrap(), quick_retry());

        let err = resolver.resolve(&listing("A", "pap")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let fetcher = Arc::new(ScriptedFetcher::scripted("A", vec![Planned::Fatal]));
        let resolver =
            Resolver::new(fetcher.clone(), SignatureRegistry::builtin().unwrap(), quick_retry());

        assert!(resolver.resolve(&listing("A", "pap")).await.is_err());
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn sweep_snapshots_before_dropping_and_survives_report_failures() {
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("databases").join("last_deleted_apparts.csv");
        let reporter = Arc::new(RecordingReporter {
            fail_for: [ListingId::from("A")].into_iter().collect(),
            ..Default::default()
        });
        let coordinator = CleanupCoordinator::new(reporter.clone(), &snapshot);

        let at = Utc::now();
        let active: Vec<ActiveListing> = abc_batch()
            .into_iter()
            .map(|listing| {
                let expired = listing.id.as_str() != "B";
                ActiveListing {
                    outcome: ResolvedOutcome {
                        listing_id: listing.id.clone(),
                        link: format!("https://example.test/{}", listing.id),
                        expired_at: expired.then_some(at),
                    },
                    listing,
                }
            })
            .collect();

        let report = coordinator
            .sweep(active, &[ListingId::from("A"), ListingId::from("C")])
            .await
            .unwrap();

        let survivors: Vec<&str> = report.survivors.iter().map(|a| a.listing.id.as_str()).collect();
        assert_eq!(survivors, vec!["B"]);
        assert_eq!(report.removed, vec![ListingId::from("A"), ListingId::from("C")]);
        assert_eq!(report.failed_reports, 1);
        assert_eq!(reporter.reports.lock().unwrap().len(), 2);

        let rows = decode_rows(&std::fs::read(&snapshot).unwrap()).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert!(rows.iter().all(|r| r.expired_at.is_some()));
        assert_eq!(
            rows[0].fields.get("description").map(String::as_str),
            Some("Annonce A, \"vue dégagée\"")
        );
    }

    #[tokio::test]
    async fn end_to_end_incremental_run_then_sweep() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(abc_fetcher());
        let reporter = Arc::new(RecordingReporter::default());
        let pipeline = pipeline(dir.path(), fetcher.clone(), reporter.clone());
        let config = SyncConfig::rooted_at(dir.path());

        let first = pipeline.run_once(RunMode::default()).await.unwrap();
        assert_eq!(first.resolved, 3);
        assert_eq!(first.ledger_appended, 3);
        assert_eq!(first.newly_expired, 2);
        assert_eq!(first.removed, 0);

        let cache = LinkCache::load(config.link_cache_path()).await.unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&ListingId::from("A")).unwrap().is_expired());
        assert!(!cache.get(&ListingId::from("B")).unwrap().is_expired());
        assert!(cache.get(&ListingId::from("C")).unwrap().is_expired());

        let ledger = Ledger::load(config.ledger_path()).await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert!(ledger.get(&ListingId::from("A")).unwrap().expired_at.is_some());
        assert!(ledger.get(&ListingId::from("B")).unwrap().expired_at.is_none());

        let second = pipeline.run_once(RunMode::default()).await.unwrap();
        assert_eq!(second.resolved, 0);
        assert_eq!(second.from_cache, 3);
        assert_eq!(fetcher.calls().len(), 3);

        let sweep = pipeline
            .run_once(RunMode {
                sweep: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sweep.resolved, 3);
        assert_eq!(sweep.removed, 2);
        assert_eq!(sweep.active, 1);
        assert_eq!(reporter.reports.lock().unwrap().len(), 2);

        let snapshot = decode_rows(&std::fs::read(config.expired_snapshot_path()).unwrap()).unwrap();
        let snapshot_ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(snapshot_ids, vec!["A", "C"]);

        let export = decode_rows(&std::fs::read(config.active_export_path()).unwrap()).unwrap();
        assert_eq!(export.len(), 1);
        assert_eq!(export[0].id.as_str(), "B");
        assert_eq!(
            export[0].fields.get("link").map(String::as_str),
            Some("https://www.bienici.com/annonce/location/B")
        );

        let ledger = Ledger::load(config.ledger_path()).await.unwrap();
        assert_eq!(ledger.len(), 3);
    }

    #[tokio::test]
    async fn sweep_keeps_the_first_expiration_stamp() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(abc_fetcher());
        let pipeline = pipeline(dir.path(), fetcher, Arc::new(RecordingReporter::default()));
        let config = SyncConfig::rooted_at(dir.path());

        pipeline.run_once(RunMode::default()).await.unwrap();
        let first_stamp = LinkCache::load(config.link_cache_path())
            .await
            .unwrap()
            .get(&ListingId::from("A"))
            .unwrap()
            .expired_at;

        pipeline
            .run_once(RunMode {
                sweep: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let after = LinkCache::load(config.link_cache_path()).await.unwrap();
        assert_eq!(after.get(&ListingId::from("A")).unwrap().expired_at, first_stamp);
        assert_eq!(
            Ledger::load(config.ledger_path())
                .await
                .unwrap()
                .get(&ListingId::from("A"))
                .unwrap()
                .expired_at,
            first_stamp
        );
    }

    #[tokio::test]
    async fn recreated_ledger_picks_up_cached_expirations() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(abc_fetcher());
        let pipeline = pipeline(dir.path(), fetcher.clone(), Arc::new(RecordingReporter::default()));
        let config = SyncConfig::rooted_at(dir.path());

        let first = pipeline.run_once(RunMode::default()).await.unwrap();
        assert_eq!(first.ledger_stamped, 2);
        let cached_stamp = LinkCache::load(config.link_cache_path())
            .await
            .unwrap()
            .get(&ListingId::from("C"))
            .unwrap()
            .expired_at;

        std::fs::write(config.ledger_path(), "not,a,ledger\n1,2,3\n").unwrap();
        let second = pipeline.run_once(RunMode::default()).await.unwrap();
        assert_eq!(second.resolved, 0);
        assert_eq!(second.ledger_appended, 3);
        assert_eq!(second.ledger_stamped, 2);
        assert_eq!(fetcher.calls().len(), 3);

        let ledger = Ledger::load(config.ledger_path()).await.unwrap();
        assert_eq!(ledger.get(&ListingId::from("C")).unwrap().expired_at, cached_stamp);
        assert!(ledger.get(&ListingId::from("A")).unwrap().expired_at.is_some());
        assert!(ledger.get(&ListingId::from("B")).unwrap().expired_at.is_none());

        let third = pipeline.run_once(RunMode::default()).await.unwrap();
        assert_eq!(third.ledger_stamped, 0);
    }

    #[tokio::test]
    async fn failed_resolution_aborts_without_persisting() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::scripted("A", vec![Planned::Fatal]));
        let mut config = SyncConfig::rooted_at(dir.path());
        config.retry_backoff_secs = 0;
        let pipeline = SyncPipeline::new(
            config.clone(),
            Arc::new(StaticFeed(vec![listing("A", "pap")])),
            fetcher,
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();

        assert!(pipeline.run_once(RunMode::default()).await.is_err());
        assert!(!config.link_cache_path().exists());
        assert!(!config.ledger_path().exists());
    }

    #[tokio::test]
    async fn rebuild_discards_cache_and_resolves_everything() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(abc_fetcher());
        let pipeline = pipeline(dir.path(), fetcher.clone(), Arc::new(RecordingReporter::default()));

        pipeline.run_once(RunMode::default()).await.unwrap();
        let rebuilt = pipeline
            .run_once(RunMode {
                rebuild_cache: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rebuilt.resolved, 3);
        assert_eq!(fetcher.calls().len(), 6);
    }
}
