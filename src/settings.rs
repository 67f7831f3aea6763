//! Runtime tunables and secrets.
//!
//! Values are looked up on every access so an operator can flip the active
//! switch or move a threshold without restarting the worker. Anything that
//! is missing or fails to parse falls back to the configured default.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;

pub const ENV_ACTIVE: &str = "SARWATCH_ACTIVE";
pub const ENV_LEXICAL_THRESHOLD: &str = "SARWATCH_MINSCORE";
pub const ENV_ALERT_THRESHOLD: &str = "SARWATCH_MINSCORE_ALERT";

pub const SECRET_FEED_TOKEN: &str = "SARWATCH_FEED_BEARER_TOKEN";
pub const SECRET_CLASSIFIER_URL: &str = "SARWATCH_CLASSIFIER_URL";
pub const SECRET_ALERT_WEBHOOK: &str = "SARWATCH_ALERT_WEBHOOK_URL";

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Defaults used when the environment does not provide a usable value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub lexical_threshold: f64,
    pub alert_threshold: f64,
    pub active: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            lexical_threshold: 0.01,
            alert_threshold: 0.1,
            active: false,
        }
    }
}

#[derive(Clone)]
pub struct Settings {
    defaults: Tunables,
    secrets: HashMap<String, String>,
    lookup: Arc<Lookup>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("defaults", &self.defaults)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Settings backed by the process environment.
    pub fn from_env(defaults: Tunables) -> Self {
        Self::with_lookup(defaults, |name| std::env::var(name).ok())
    }

    /// Settings backed by a custom lookup (tests, alternative secret stores).
    pub fn with_lookup<F>(defaults: Tunables, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            defaults,
            secrets: HashMap::new(),
            lookup: Arc::new(lookup),
        }
    }

    /// Environment-backed settings seeded with the config file's values and secrets.
    pub fn from_config(cfg: &Config) -> Self {
        let mut settings = Self::from_env(cfg.tunables());
        let configured = [
            (SECRET_FEED_TOKEN, cfg.feed.bearer_token.clone()),
            (SECRET_CLASSIFIER_URL, cfg.classifier.url.clone()),
            (SECRET_ALERT_WEBHOOK, cfg.alert.webhook_url.clone()),
        ];
        for (name, value) in configured {
            if let Some(value) = value {
                settings = settings.with_secret(name, value);
            }
        }
        settings
    }

    pub fn with_secret(mut self, name: &str, value: impl Into<String>) -> Self {
        self.secrets.insert(name.to_string(), value.into());
        self
    }

    /// Secret by name: the lookup wins, the configured value is the fallback.
    pub fn secret(&self, name: &str) -> Option<String> {
        let usable = |s: String| Some(s.trim().to_string()).filter(|s| !s.is_empty());
        (self.lookup)(name)
            .and_then(usable)
            .or_else(|| self.secrets.get(name).cloned().and_then(usable))
    }

    pub fn lexical_threshold(&self) -> f64 {
        self.float_or_default(ENV_LEXICAL_THRESHOLD, self.defaults.lexical_threshold)
    }

    pub fn alert_threshold(&self) -> f64 {
        self.float_or_default(ENV_ALERT_THRESHOLD, self.defaults.alert_threshold)
    }

    /// The loop keeps rescheduling itself only while this is on.
    pub fn active(&self) -> bool {
        let Some(raw) = (self.lookup)(ENV_ACTIVE) else {
            return self.defaults.active;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(
                    var = ENV_ACTIVE,
                    value = other,
                    default = self.defaults.active,
                    "unparsable active switch; using default"
                );
                self.defaults.active
            }
        }
    }

    fn float_or_default(&self, name: &str, default: f64) -> f64 {
        let Some(raw) = (self.lookup)(name) else {
            return default;
        };
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                warn!(var = name, value = %raw, default, "unparsable threshold; using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn with_vars(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::with_lookup(Tunables::default(), move |name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let s = with_vars(&[]);
        assert_eq!(s.lexical_threshold(), 0.01);
        assert_eq!(s.alert_threshold(), 0.1);
        assert!(!s.active());
    }

    #[test]
    fn environment_overrides_defaults() {
        let s = with_vars(&[
            (ENV_LEXICAL_THRESHOLD, "0.2"),
            (ENV_ALERT_THRESHOLD, " 0.5 "),
            (ENV_ACTIVE, "1"),
        ]);
        assert_eq!(s.lexical_threshold(), 0.2);
        assert_eq!(s.alert_threshold(), 0.5);
        assert!(s.active());
    }

    #[test]
    fn parse_failures_fall_back() {
        let s = with_vars(&[
            (ENV_LEXICAL_THRESHOLD, "lots"),
            (ENV_ALERT_THRESHOLD, "NaN"),
            (ENV_ACTIVE, "maybe"),
        ]);
        assert_eq!(s.lexical_threshold(), 0.01);
        assert_eq!(s.alert_threshold(), 0.1);
        assert!(!s.active());
    }

    #[test]
    fn values_are_read_on_every_access() {
        let flag = Arc::new(Mutex::new("1".to_string()));
        let source = flag.clone();
        let s = Settings::with_lookup(Tunables::default(), move |name| {
            (name == ENV_ACTIVE).then(|| source.lock().unwrap().clone())
        });
        assert!(s.active());
        *flag.lock().unwrap() = "0".into();
        assert!(!s.active());
    }

    #[test]
    fn secrets_prefer_lookup_then_configured_value() {
        let s = with_vars(&[(SECRET_FEED_TOKEN, "from-env")])
            .with_secret(SECRET_FEED_TOKEN, "from-config")
            .with_secret(SECRET_ALERT_WEBHOOK, "https://hooks.example/x")
            .with_secret(SECRET_CLASSIFIER_URL, "  ");
        assert_eq!(s.secret(SECRET_FEED_TOKEN).as_deref(), Some("from-env"));
        assert_eq!(
            s.secret(SECRET_ALERT_WEBHOOK).as_deref(),
            Some("https://hooks.example/x")
        );
        assert_eq!(s.secret(SECRET_CLASSIFIER_URL), None);
    }

    #[test]
    fn blank_environment_value_falls_back_to_configured_secret() {
        let s = with_vars(&[(SECRET_ALERT_WEBHOOK, ""), (SECRET_FEED_TOKEN, "   ")])
            .with_secret(SECRET_ALERT_WEBHOOK, "https://hooks.example/x")
            .with_secret(SECRET_FEED_TOKEN, " token-2 ");
        assert_eq!(
            s.secret(SECRET_ALERT_WEBHOOK).as_deref(),
            Some("https://hooks.example/x")
        );
        assert_eq!(s.secret(SECRET_FEED_TOKEN).as_deref(), Some("token-2"));
    }
}
