//! Configuration loader and validator for the SAR feed watcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::delay::DelayPolicy;
use crate::scorer::{TermLists, DEFAULT_BLACKLIST, DEFAULT_IRRELEVANT, DEFAULT_RELEVANT};
use crate::settings::Tunables;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub feed: Feed,
    #[serde(default)]
    pub classifier: Classifier,
    #[serde(default)]
    pub alert: Alert,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub terms: Option<Terms>,
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Upstream feed search settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub base_url: String,
    pub account: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Overridden by `SARWATCH_FEED_BEARER_TOKEN`.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Remote classifier. Without a URL (here or in the environment) it is never consulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classifier {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Alerting webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_lexical_threshold")]
    pub lexical: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_base_seconds")]
    pub base_seconds: u64,
    #[serde(default = "default_quiet_seconds")]
    pub quiet_seconds: u64,
    #[serde(default = "default_min_seconds")]
    pub min_seconds: u64,
    #[serde(default = "default_quiet_start_hour")]
    pub quiet_start_hour: u32,
    #[serde(default = "default_quiet_end_hour")]
    pub quiet_end_hour: u32,
    /// Fixed offset used for the quiet window; host local time when absent.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// Replacement term lists. A missing list keeps the built-in one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Terms {
    #[serde(default)]
    pub relevant: Option<Vec<String>>,
    #[serde(default)]
    pub irrelevant: Option<Vec<String>>,
    #[serde(default)]
    pub blacklist: Option<Vec<String>>,
}

fn default_max_results() -> u32 {
    15
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_lexical_threshold() -> f64 {
    0.01
}
fn default_alert_threshold() -> f64 {
    0.1
}
fn default_base_seconds() -> u64 {
    45
}
fn default_quiet_seconds() -> u64 {
    180
}
fn default_min_seconds() -> u64 {
    30
}
fn default_quiet_start_hour() -> u32 {
    1
}
fn default_quiet_end_hour() -> u32 {
    6
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lexical: default_lexical_threshold(),
            alert: default_alert_threshold(),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            active: false,
            base_seconds: default_base_seconds(),
            quiet_seconds: default_quiet_seconds(),
            min_seconds: default_min_seconds(),
            quiet_start_hour: default_quiet_start_hour(),
            quiet_end_hour: default_quiet_end_hour(),
            utc_offset_minutes: None,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        let s = &self.schedule;
        DelayPolicy {
            base_seconds: s.base_seconds,
            quiet_seconds: s.quiet_seconds,
            min_seconds: s.min_seconds,
            quiet_start_hour: s.quiet_start_hour,
            quiet_end_hour: s.quiet_end_hour,
            utc_offset_minutes: s.utc_offset_minutes,
        }
    }

    pub fn tunables(&self) -> Tunables {
        Tunables {
            lexical_threshold: self.thresholds.lexical,
            alert_threshold: self.thresholds.alert,
            active: self.schedule.active,
        }
    }

    pub fn term_lists(&self) -> TermLists {
        let Some(terms) = &self.terms else {
            return TermLists::default();
        };
        let pick = |custom: &Option<Vec<String>>, builtin: &[&str]| -> Vec<String> {
            custom
                .clone()
                .unwrap_or_else(|| builtin.iter().map(|s| s.to_string()).collect())
        };
        TermLists::new(
            &pick(&terms.relevant, DEFAULT_RELEVANT),
            &pick(&terms.irrelevant, DEFAULT_IRRELEVANT),
            &pick(&terms.blacklist, DEFAULT_BLACKLIST),
        )
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.feed.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("feed.base_url must be non-empty"));
    }
    if cfg.feed.account.trim().is_empty() {
        return Err(ConfigError::Invalid("feed.account must be non-empty"));
    }
    if !(10..=100).contains(&cfg.feed.max_results) {
        return Err(ConfigError::Invalid("feed.max_results must be within 10..=100"));
    }

    if !(0.0..=1.0).contains(&cfg.thresholds.lexical) {
        return Err(ConfigError::Invalid("thresholds.lexical must be within [0, 1]"));
    }
    if !(0.0..=1.0).contains(&cfg.thresholds.alert) {
        return Err(ConfigError::Invalid("thresholds.alert must be within [0, 1]"));
    }

    let s = &cfg.schedule;
    // A zero floor would let an overrunning cycle compute a zero delay and stop the loop.
    if s.min_seconds == 0 {
        return Err(ConfigError::Invalid("schedule.min_seconds must be > 0"));
    }
    if s.quiet_start_hour > 23 || s.quiet_end_hour > 23 {
        return Err(ConfigError::Invalid("schedule quiet hours must be within 0..=23"));
    }
    if let Some(offset) = s.utc_offset_minutes {
        if offset.abs() >= 24 * 60 {
            return Err(ConfigError::Invalid("schedule.utc_offset_minutes out of range"));
        }
    }

    if let Some(terms) = &cfg.terms {
        if matches!(&terms.relevant, Some(list) if list.iter().all(|t| t.trim().is_empty())) {
            return Err(ConfigError::Invalid("terms.relevant must contain at least one term"));
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  max_backoff_seconds: 300

feed:
  base_url: "https://api.twitter.com/"
  account: "politivest"
  max_results: 15
  timeout_seconds: 30
  bearer_token: "YOUR_FEED_BEARER_TOKEN"

classifier:
  url: "https://classifier.example/api/score"
  timeout_seconds: 30

alert:
  webhook_url: "https://hooks.slack.com/services/XXX/YYY/ZZZ"
  timeout_seconds: 30

thresholds:
  lexical: 0.01
  alert: 0.1

schedule:
  active: true
  base_seconds: 45
  quiet_seconds: 180
  min_seconds: 30
  quiet_start_hour: 1
  quiet_end_hour: 6
  utc_offset_minutes: 60
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.feed.account, "politivest");
        assert!(cfg.schedule.active);
        assert_eq!(cfg.delay_policy().utc_offset_minutes, Some(60));
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60
feed:
  base_url: "http://localhost"
  account: "someone"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.feed.max_results, 15);
        assert_eq!(cfg.classifier.url, None);
        assert_eq!(cfg.thresholds.lexical, 0.01);
        assert_eq!(cfg.thresholds.alert, 0.1);
        assert!(!cfg.schedule.active);
        assert_eq!(cfg.schedule.base_seconds, 45);
        assert_eq!(cfg.schedule.quiet_seconds, 180);
        assert_eq!(cfg.schedule.min_seconds, 30);
        assert_eq!(cfg.term_lists(), TermLists::default());
    }

    #[test]
    fn invalid_feed_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.feed.account = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("feed.account")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.feed.max_results = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn feed_page_size_must_fit_search_limits() {
        for (max_results, ok) in [(9, false), (10, true), (100, true), (101, false)] {
            let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
            cfg.feed.max_results = max_results;
            assert_eq!(validate(&cfg).is_ok(), ok, "max_results = {max_results}");
        }
    }

    #[test]
    fn invalid_schedule() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.min_seconds = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("min_seconds")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.quiet_end_hour = 24;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.thresholds.alert = 1.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn custom_terms_replace_only_given_lists() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.terms = Some(Terms {
            relevant: Some(vec!["Savn".into()]),
            ..Default::default()
        });
        validate(&cfg).unwrap();
        let terms = cfg.term_lists();
        assert_eq!(terms.relevant(), ["savn"]);
        assert_eq!(terms.blacklist().len(), DEFAULT_BLACKLIST.len());
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.feed.max_results, 15);
    }
}
