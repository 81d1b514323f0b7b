//! Thin client for the aggregator API: session login, alert listing, paginated
//! ad retrieval, the ad redirect endpoint and abuse reports.

use std::sync::Arc;
use std::time::Duration;

use kajin_core::{AlertId, FetchedListing, ListingId};
use reqwest::cookie::Jar;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, LOCATION, ORIGIN,
    UPGRADE_INSECURE_REQUESTS,
};
use reqwest::{redirect, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::FetchError;

pub const DEFAULT_API_BASE: &str = "https://api.jinka.fr";
pub const ABUSE_REASON_LINK_404: &str = "ad_link_404";
/// Hops followed on the ad redirect chain before giving up.
pub const MAX_AD_REDIRECTS: usize = 10;

const NAVIGATION_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";

/// Headers a browser sends when opening an ad, so source sites serve the HTML page.
fn navigation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(NAVIGATION_ACCEPT));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    for (name, value) in [
        ("sec-fetch-site", "same-site"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-user", "?1"),
        ("sec-fetch-dest", "document"),
    ] {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("authentication rejected with http status {0}")]
    AuthRejected(u16),
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// An alert (saved search) and how many dashboard pages it spans.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertSummary {
    pub id: AlertId,
    pub name: String,
    pub user_name: Option<String>,
    pub ads_per_day: Option<f64>,
    pub nb_pages: u32,
}

#[derive(Debug, Deserialize)]
struct AuthPayload {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AlertPayload {
    id: JsonValue,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    estimated_ads_per_day: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DashboardPayload {
    pagination: PaginationPayload,
}

#[derive(Debug, Deserialize)]
struct PaginationPayload {
    #[serde(rename = "nbPages")]
    nb_pages: u32,
}

#[derive(Debug, Deserialize)]
struct AdsPagePayload {
    #[serde(default)]
    ads: Vec<JsonValue>,
}

/// Authenticated session against the aggregator API.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    /// Same session, but redirects are walked by hand in [`Self::view_ad`].
    navigator: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl UpstreamClient {
    pub async fn login(
        config: &UpstreamConfig,
        email: &str,
        password: &str,
    ) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr,fr-FR;q=0.8,en-US;q=0.5,en;q=0.3"),
        );
        headers.insert(ORIGIN, HeaderValue::from_static("https://www.jinka.fr"));

        let jar = Arc::new(Jar::default());
        let builder = || {
            let builder = reqwest::Client::builder()
                .gzip(true)
                .brotli(true)
                .cookie_provider(jar.clone())
                .default_headers(headers.clone())
                .timeout(config.timeout);
            match &config.user_agent {
                Some(user_agent) => builder.user_agent(user_agent.clone()),
                None => builder,
            }
        };
        let client = builder().build().map_err(UpstreamError::Client)?;
        let navigator = builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(UpstreamError::Client)?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let url = format!("{base_url}/apiv2/user/auth");
        let resp = client
            .post(&url)
            .form(&[("email", email), ("password", password)])
            .send()
            .await
            .map_err(|source| UpstreamError::Request {
                url: url.clone(),
                source,
            })?;
        if resp.status() != StatusCode::OK {
            return Err(UpstreamError::AuthRejected(resp.status().as_u16()));
        }
        let auth: AuthPayload = resp
            .json()
            .await
            .map_err(|source| UpstreamError::Request { url, source })?;
        info!("authenticated against the aggregator API");

        Ok(Self {
            client,
            navigator,
            base_url,
            access_token: auth.access_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, UpstreamError> {
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|source| UpstreamError::Request {
                url: url.clone(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        resp.json()
            .await
            .map_err(|source| UpstreamError::Request { url, source })
    }

    fn dashboard_url(&self, alert_id: &AlertId, page: u32) -> String {
        format!(
            "{}/apiv2/alert/{alert_id}/dashboard?filter=all&page={page}",
            self.base_url
        )
    }

    /// Every alert of the account, with its dashboard page count (read from the
    /// pagination block of the first dashboard page).
    pub async fn alerts(&self) -> Result<Vec<AlertSummary>, UpstreamError> {
        let payloads: Vec<AlertPayload> =
            self.get_json(format!("{}/apiv2/alert", self.base_url)).await?;

        let total = payloads.len();
        let mut alerts = Vec::with_capacity(total);
        for (i, payload) in payloads.into_iter().enumerate() {
            let id = match &payload.id {
                JsonValue::String(s) => AlertId::new(s.clone()),
                other => AlertId::new(other.to_string()),
            };
            let dashboard: DashboardPayload = self.get_json(self.dashboard_url(&id, 1)).await?;
            info!(
                alert_id = %id,
                pages = dashboard.pagination.nb_pages,
                "processed alert {}/{}",
                i + 1,
                total
            );
            alerts.push(AlertSummary {
                id,
                name: payload.name.unwrap_or_default(),
                user_name: payload.user_name,
                ads_per_day: payload.estimated_ads_per_day,
                nb_pages: dashboard.pagination.nb_pages,
            });
        }
        Ok(alerts)
    }

    /// Raw `ads[]` records of every dashboard page of `alert`.
    pub async fn alert_listings(
        &self,
        alert: &AlertSummary,
    ) -> Result<Vec<JsonValue>, UpstreamError> {
        let mut records = Vec::new();
        for page in 1..=alert.nb_pages {
            let payload: AdsPagePayload = self.get_json(self.dashboard_url(&alert.id, page)).await?;
            debug!(alert_id = %alert.id, page, ads = payload.ads.len(), "fetched dashboard page");
            records.extend(payload.ads);
        }
        Ok(records)
    }

    /// Follows the aggregator's redirect for one ad and returns wherever it lands.
    ///
    /// Redirects are followed hop by hop so the landing URL keeps the last
    /// fragment seen on the chain (`.../annonce.htm#expiree`); an HTTP client
    /// never sends fragments, so they only survive in the `Location` headers.
    /// Any HTTP status is a valid response here; only transport failures are errors.
    pub async fn view_ad(
        &self,
        alert_id: &AlertId,
        listing_id: &ListingId,
    ) -> Result<FetchedListing, FetchError> {
        let url = format!("{}/alert_result_view_ad", self.base_url);
        let span = info_span!("view_ad", %alert_id, %listing_id);
        async {
            let mut current = Url::parse_with_params(
                &url,
                &[("ad", listing_id.as_str()), ("alert_token", alert_id.as_str())],
            )
            .map_err(|err| FetchError::fatal(url.clone(), err))?;
            let mut fragment: Option<String> = None;

            for _ in 0..=MAX_AD_REDIRECTS {
                let resp = self
                    .navigator
                    .get(current.clone())
                    .headers(navigation_headers())
                    .send()
                    .await
                    .map_err(|err| FetchError::from_reqwest(current.to_string(), err))?;

                let location = resp
                    .status()
                    .is_redirection()
                    .then(|| resp.headers().get(LOCATION))
                    .flatten()
                    .and_then(|value| value.to_str().ok());
                if let Some(location) = location {
                    let next = current
                        .join(location)
                        .map_err(|err| FetchError::fatal(current.to_string(), err))?;
                    if let Some(f) = next.fragment().filter(|f| !f.is_empty()) {
                        fragment = Some(f.to_string());
                    }
                    debug!(from = %current, to = %next, "following ad redirect");
                    current = next;
                    continue;
                }

                let status = resp.status().as_u16();
                let mut landed = resp.url().clone();
                if landed.fragment().is_none() {
                    landed.set_fragment(fragment.as_deref());
                }
                let final_url = landed.to_string();
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|err| FetchError::from_reqwest(final_url.clone(), err))?;
                debug!(status, final_url = %final_url, bytes = bytes.len(), "ad resolved");
                return Ok(FetchedListing {
                    final_url,
                    status,
                    body: String::from_utf8(bytes.to_vec()).ok(),
                });
            }
            Err(FetchError::fatal(
                url.clone(),
                format!("more than {MAX_AD_REDIRECTS} redirects"),
            ))
        }
        .instrument(span)
        .await
    }

    /// Flags `listing_id` as a dead link on `alert_id`.
    pub async fn report_abuse(
        &self,
        alert_id: &AlertId,
        listing_id: &ListingId,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/apiv2/alert/{}/abuses", self.base_url, alert_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .form(&[("ad_id", listing_id.as_str()), ("reason", ABUSE_REASON_LINK_404)])
            .send()
            .await
            .map_err(|source| UpstreamError::Request {
                url: url.clone(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    async fn logged_in(server: &MockServer) -> UpstreamClient {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/apiv2/user/auth")
                    .body_contains("email=me%40example.test");
                then.status(200).json_body(json!({"access_token": "tok-1"}));
            })
            .await;
        let config = UpstreamConfig {
            base_url: server.base_url(),
            ..Default::default()
        };
        UpstreamClient::login(&config, "me@example.test", "secret")
            .await
            .expect("login")
    }

    #[tokio::test]
    async fn rejected_login_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/apiv2/user/auth");
                then.status(401);
            })
            .await;
        let config = UpstreamConfig {
            base_url: server.base_url(),
            ..Default::default()
        };
        let err = UpstreamClient::login(&config, "me@example.test", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::AuthRejected(401)));
    }

    #[tokio::test]
    async fn alerts_and_pages_are_walked() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/apiv2/alert")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!([
                    {"id": 42, "name": "Paris 11e", "user_name": "me", "estimated_ads_per_day": 3.5}
                ]));
            })
            .await;
        let page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/apiv2/alert/42/dashboard")
                    .query_param("filter", "all")
                    .query_param("page", "1");
                then.status(200).json_body(json!({
                    "pagination": {"nbPages": 2, "totals": {"all": 3}},
                    "ads": [{"id": 1, "source": "pap"}, {"id": 2, "source": "orpi"}]
                }));
            })
            .await;
        let page2 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/apiv2/alert/42/dashboard")
                    .query_param("page", "2");
                then.status(200).json_body(json!({"ads": [{"id": 3, "source": "fnaim"}]}));
            })
            .await;

        let alerts = client.alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, AlertId::from("42"));
        assert_eq!(alerts[0].nb_pages, 2);

        let records = client.alert_listings(&alerts[0]).await.unwrap();
        assert_eq!(records.len(), 3);
        page1.assert_hits_async(2).await;
        page2.assert_async().await;
    }

    #[tokio::test]
    async fn view_ad_follows_redirects_and_keeps_error_pages() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        let target = server.url("/annonce/locations-appartement-paris-75");
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/alert_result_view_ad")
                    .query_param("ad", "77")
                    .query_param("alert_token", "42");
                then.status(302).header("Location", target.as_str());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/annonce/locations-appartement-paris-75");
                then.status(404).body("<html><body>gone</body></html>");
            })
            .await;

        let fetched = client
            .view_ad(&AlertId::from("42"), &ListingId::from("77"))
            .await
            .unwrap();
        assert_eq!(fetched.final_url, target);
        assert_eq!(fetched.status, 404);
        assert_eq!(fetched.body.as_deref(), Some("<html><body>gone</body></html>"));
    }

    #[tokio::test]
    async fn view_ad_keeps_the_fragment_of_the_redirect_target() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        let hop = server.url("/go/1");
        let landing = server.url("/annonces/1.htm/#expiree");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/alert_result_view_ad");
                then.status(302).header("Location", hop.as_str());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/go/1");
                then.status(301).header("Location", landing.as_str());
            })
            .await;
        let page = server
            .mock_async(|when, then| {
                when.method(GET).path("/annonces/1.htm/");
                then.status(200).body("<html></html>");
            })
            .await;

        let fetched = client
            .view_ad(&AlertId::from("42"), &ListingId::from("1"))
            .await
            .unwrap();
        assert_eq!(fetched.final_url, landing);
        assert!(fetched.final_url.ends_with("/#expiree"));
        page.assert_async().await;
    }

    #[tokio::test]
    async fn fragment_survives_a_later_hop_without_one() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/alert_result_view_ad");
                then.status(302).header("Location", "/annonces/2.htm#expiree");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/annonces/2.htm");
                then.status(302).header("Location", "/annonces/2/");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/annonces/2/");
                then.status(200).body("ok");
            })
            .await;

        let fetched = client
            .view_ad(&AlertId::from("42"), &ListingId::from("2"))
            .await
            .unwrap();
        assert_eq!(fetched.final_url, server.url("/annonces/2/#expiree"));
    }

    #[tokio::test]
    async fn view_ad_sends_browser_navigation_headers() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        let ad = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/alert_result_view_ad")
                    .header("accept", NAVIGATION_ACCEPT)
                    .header("sec-fetch-mode", "navigate")
                    .header("sec-fetch-dest", "document");
                then.status(200).body("<html></html>");
            })
            .await;

        let fetched = client
            .view_ad(&AlertId::from("42"), &ListingId::from("3"))
            .await
            .unwrap();
        assert_eq!(fetched.status, 200);
        ad.assert_async().await;
    }

    #[tokio::test]
    async fn endless_redirects_are_a_fatal_fetch_error() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/alert_result_view_ad");
                then.status(302).header("Location", "/alert_result_view_ad");
            })
            .await;

        let err = client
            .view_ad(&AlertId::from("42"), &ListingId::from("4"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn abuse_report_posts_dead_link_reason() {
        let server = MockServer::start_async().await;
        let client = logged_in(&server).await;
        let report = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/apiv2/alert/42/abuses")
                    .body_contains("ad_id=77")
                    .body_contains("reason=ad_link_404");
                then.status(200);
            })
            .await;

        client
            .report_abuse(&AlertId::from("42"), &ListingId::from("77"))
            .await
            .unwrap();
        report.assert_async().await;
    }
}
