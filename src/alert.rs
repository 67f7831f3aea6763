use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::model::ProcessingRecord;
use crate::settings::{Settings, SECRET_ALERT_WEBHOOK};

/// Alerting channel for records that shall be published.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Send one alert per record, in order. Returns how many were delivered.
    async fn publish(&self, records: &[ProcessingRecord], alert_threshold: f64) -> Result<usize>;
}

/// Render the alert text for one record.
///
/// Records whose lexical score exceeds `alert_threshold` ping the whole channel.
pub fn format_alert(rec: &ProcessingRecord, alert_threshold: f64) -> String {
    let mut msg = String::new();
    if rec.lexical_score > alert_threshold {
        msg.push_str("@channel\n");
    }
    msg.push_str(&rec.text_highlighted);
    msg.push('\n');
    let _ = write!(
        msg,
        "Score (v{}): {:.2}",
        rec.lexical_version, rec.lexical_score
    );
    if let (Some(score), Some(version)) = (rec.remote_score, rec.remote_version.as_deref()) {
        let _ = write!(msg, ", ML ({version}): {score:.2}");
    }
    let _ = write!(msg, "\nLink: {}", rec.item.permalink);
    msg
}

/// Slack incoming webhook. The URL is a secret and is resolved per publish.
#[derive(Clone)]
pub struct SlackWebhook {
    http: Client,
    settings: Arc<Settings>,
}

impl fmt::Debug for SlackWebhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackWebhook").finish_non_exhaustive()
    }
}

impl SlackWebhook {
    pub fn new(settings: Arc<Settings>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("sar-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { http, settings })
    }

    fn endpoint(&self) -> Result<Url> {
        let raw = self
            .settings
            .secret(SECRET_ALERT_WEBHOOK)
            .ok_or_else(|| anyhow!("alert webhook not configured"))?;
        Url::parse(&raw).context("invalid alert webhook URL")
    }

    async fn post(&self, endpoint: &Url, text: &str) -> Result<()> {
        let res = self
            .http
            .post(endpoint.clone())
            .json(&json!({ "text": text, "link_names": "1" }))
            .send()
            .await
            .context("failed to reach webhook")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertSink for SlackWebhook {
    #[instrument(skip_all, fields(count = records.len()))]
    async fn publish(&self, records: &[ProcessingRecord], alert_threshold: f64) -> Result<usize> {
        let endpoint = self.endpoint()?;
        let mut sent = 0;
        for rec in records {
            let text = format_alert(rec, alert_threshold);
            match self.post(&endpoint, &text).await {
                Ok(()) => sent += 1,
                Err(err) => warn!(?err, id = %rec.id(), "failed to post alert"),
            }
        }
        info!(sent, total = records.len(), "alerts published");
        Ok(sent)
    }
}
