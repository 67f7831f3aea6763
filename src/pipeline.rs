//! Two-stage classification: lexical scorer first, remote classifier second.
use std::sync::Arc;
use tracing::{debug, info};

use crate::classifier::RemoteClassifier;
use crate::model::{Label, ProcessingRecord};
use crate::scorer::LexicalScorer;
use crate::settings::Settings;

/// Version stamped on every lexical score.
pub const LEXICAL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct Pipeline {
    scorer: Arc<LexicalScorer>,
    remote: Arc<dyn RemoteClassifier>,
    settings: Arc<Settings>,
}

impl Pipeline {
    pub fn new(
        scorer: Arc<LexicalScorer>,
        remote: Arc<dyn RemoteClassifier>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            scorer,
            remote,
            settings,
        }
    }

    /// Run both stages, in order, on `record.text_without_tags`.
    pub async fn classify(&self, record: &mut ProcessingRecord) {
        self.apply_lexical(record);
        if record.lexical_label != Label::Negative {
            self.apply_remote(record).await;
        }
        debug!(
            id = %record.id(),
            lexical = record.lexical_score,
            remote_version = ?record.remote_version,
            publish = record.shall_publish(),
            "classified item"
        );
    }

    fn apply_lexical(&self, record: &mut ProcessingRecord) {
        let threshold = self.settings.lexical_threshold();
        let score = self.scorer.score(&record.text_without_tags);
        record.lexical_score = score.value;
        record.text_highlighted = score.highlighted;
        record.lexical_version = LEXICAL_VERSION.to_string();
        record.lexical_label = if score.value > threshold {
            Label::Positive
        } else {
            Label::Negative
        };
    }

    async fn apply_remote(&self, record: &mut ProcessingRecord) {
        info!(id = %record.id(), score = record.lexical_score, "lexical threshold exceeded; querying remote classifier");
        match self.remote.classify(&record.text_without_tags).await {
            Some(verdict) => {
                record.remote_score = Some(verdict.score);
                record.remote_label = verdict.label;
                record.remote_version = Some(verdict.version);
            }
            None => {
                info!(id = %record.id(), "no remote verdict; relying on lexical label");
            }
        }
    }
}
