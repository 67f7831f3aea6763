use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::model::{Cursor, HashtagSpan, ItemId, RawItem};
use crate::settings::{Settings, SECRET_FEED_TOKEN};

/// Source of new messages. Returns items with `id > cursor`, in any order.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn fetch(&self, after: Cursor) -> Result<Vec<RawItem>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<ApiPost>,
}

#[derive(Debug, Deserialize)]
struct ApiPost {
    id: String,
    text: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    entities: Option<ApiEntities>,
    #[serde(default)]
    referenced_tweets: Vec<ApiReference>,
}

#[derive(Debug, Deserialize)]
struct ApiEntities {
    #[serde(default)]
    hashtags: Vec<ApiHashtag>,
}

#[derive(Debug, Deserialize)]
struct ApiHashtag {
    start: usize,
    end: usize,
    tag: String,
}

#[derive(Debug, Deserialize)]
struct ApiReference {
    #[serde(rename = "type")]
    typ: String,
    id: String,
}

/// Recent-search client for one monitored account.
#[derive(Clone)]
pub struct HttpFeed {
    http: Client,
    base_url: Url,
    account: String,
    max_results: u32,
    settings: Arc<Settings>,
}

impl fmt::Debug for HttpFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeed")
            .field("base_url", &self.base_url)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl HttpFeed {
    pub fn new(
        base_url: &str,
        account: &str,
        max_results: u32,
        timeout: Duration,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid feed base URL")?;
        let http = Client::builder()
            .user_agent(concat!("sar-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build feed HTTP client")?;
        // The search endpoint only accepts 10..=100 results per page.
        let clamped = max_results.clamp(10, 100);
        if clamped != max_results {
            warn!(requested = max_results, used = clamped, "feed page size out of range; clamping");
        }
        Ok(Self {
            http,
            base_url,
            account: account.to_string(),
            max_results: clamped,
            settings,
        })
    }

    pub fn build_request(&self, after: Cursor) -> Result<reqwest::Request> {
        let token = self
            .settings
            .secret(SECRET_FEED_TOKEN)
            .ok_or_else(|| anyhow!("feed bearer token not configured"))?;
        let mut url = self
            .base_url
            .join("2/tweets/search/recent")
            .context("invalid feed base URL")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("query", &format!("from:{}", self.account));
            query.append_pair("max_results", &self.max_results.to_string());
            query.append_pair("tweet.fields", "created_at,entities,referenced_tweets");
            if after.0 > 0 {
                query.append_pair("since_id", &after.to_string());
            }
        }
        self.http
            .get(url)
            .bearer_auth(token)
            .build()
            .context("failed to build feed request")
    }

    pub fn permalink(&self, id: ItemId) -> String {
        format!("https://twitter.com/{}/status/{}", self.account, id)
    }

    fn to_raw_item(&self, post: ApiPost) -> Option<RawItem> {
        let id: ItemId = match post.id.parse() {
            Ok(id) => id,
            Err(err) => {
                warn!(?err, "dropping post with non-numeric id");
                return None;
            }
        };
        let mut hashtags: Vec<HashtagSpan> = post
            .entities
            .map(|e| e.hashtags)
            .unwrap_or_default()
            .into_iter()
            .map(|h| HashtagSpan {
                start: h.start,
                end: h.end,
                text: h.tag,
            })
            .collect();
        hashtags.sort_by_key(|h| h.start);
        let reply_to = post
            .referenced_tweets
            .iter()
            .find(|r| r.typ == "replied_to")
            .and_then(|r| r.id.parse().ok());
        Some(RawItem {
            id,
            created_at: post.created_at.unwrap_or_else(Utc::now),
            full_text: post.text,
            hashtags,
            reply_to,
            permalink: self.permalink(id),
        })
    }
}

#[async_trait]
impl Feed for HttpFeed {
    #[instrument(skip_all, fields(after = %after))]
    async fn fetch(&self, after: Cursor) -> Result<Vec<RawItem>> {
        let request = self.build_request(after)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach feed")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from feed: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("feed error {}: {}", status, body));
        }

        let payload: SearchResponse = res.json().await.context("invalid feed response JSON")?;
        let items: Vec<RawItem> = payload
            .data
            .into_iter()
            .filter_map(|p| self.to_raw_item(p))
            .collect();
        info!(count = items.len(), "fetched posts");
        Ok(items)
    }
}
