use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::{Label, RemoteVerdict};
use crate::settings::{Settings, SECRET_CLASSIFIER_URL};

/// Secondary classifier consulted for lexically positive items.
///
/// Implementations never fail: any problem is reported as `None`, which the
/// pipeline treats as "fall back to the lexical decision".
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Option<RemoteVerdict>;
}

/// Used when no classifier endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledClassifier;

#[async_trait]
impl RemoteClassifier for DisabledClassifier {
    async fn classify(&self, _text: &str) -> Option<RemoteVerdict> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    label: i64,
    score: f64,
    #[serde(default)]
    version: Option<String>,
}

/// JSON-over-HTTP classifier: `POST {"tweet": text}` → `{label, score, version}`.
#[derive(Clone)]
pub struct HttpClassifier {
    http: Client,
    settings: Arc<Settings>,
}

impl fmt::Debug for HttpClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClassifier").finish_non_exhaustive()
    }
}

impl HttpClassifier {
    pub fn new(settings: Arc<Settings>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("sar-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build classifier HTTP client")?;
        Ok(Self { http, settings })
    }

    /// The endpoint is resolved on every call so it can be rotated at runtime.
    fn endpoint(&self) -> Result<Url> {
        let raw = self
            .settings
            .secret(SECRET_CLASSIFIER_URL)
            .ok_or_else(|| anyhow!("classifier endpoint not configured"))?;
        Url::parse(&raw).context("invalid classifier endpoint")
    }

    async fn try_classify(&self, text: &str) -> Result<RemoteVerdict> {
        let endpoint = self.endpoint()?;
        let res = self
            .http
            .post(endpoint)
            .json(&json!({ "tweet": text }))
            .send()
            .await
            .context("failed to reach classifier")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("classifier error {}: {}", status, body));
        }

        let body = res.text().await.context("failed to read classifier response")?;
        let reply: ClassifierResponse =
            serde_json::from_str(&body).context("invalid classifier response JSON")?;
        let version = reply
            .version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("classifier reply carries no version"))?;
        if !reply.score.is_finite() {
            return Err(anyhow!("classifier score is not a number"));
        }

        Ok(RemoteVerdict {
            score: reply.score,
            label: if reply.label == 1 {
                Label::Positive
            } else {
                Label::Negative
            },
            version,
        })
    }
}

#[async_trait]
impl RemoteClassifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Option<RemoteVerdict> {
        debug!("calling remote classifier");
        match self.try_classify(text).await {
            Ok(verdict) => {
                info!(
                    label = verdict.label.as_str(),
                    score = verdict.score,
                    version = %verdict.version,
                    "remote classifier answered"
                );
                Some(verdict)
            }
            Err(err) => {
                warn!(?err, "remote classifier unavailable; relying on lexical score");
                None
            }
        }
    }
}
