//! One generation of the polling loop:
//! fetch → fan out per-item workflows → order and filter → archive and
//! alert → decide the delay before the next generation.
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::GenerationContext;
use crate::alert::AlertSink;
use crate::archive::Archive;
use crate::delay::DelayPolicy;
use crate::feed::Feed;
use crate::item::process_item;
use crate::model::{Cursor, ItemId, ProcessingRecord, RawItem};
use crate::pipeline::Pipeline;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Run the next generation from `cursor` at `wake_at`.
    Continue {
        cursor: Cursor,
        wake_at: DateTime<Utc>,
    },
    /// The active switch is off; the loop stops here.
    Finished { cursor: Cursor },
}

impl GenerationOutcome {
    pub fn cursor(&self) -> Cursor {
        match self {
            GenerationOutcome::Continue { cursor, .. } | GenerationOutcome::Finished { cursor } => {
                *cursor
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayDecision {
    finished_at: DateTime<Utc>,
    delay_seconds: u64,
}

/// Fan-in result of one batch.
#[derive(Debug, Default)]
pub struct Aggregate {
    /// Ascending by id; everything below the first failed item.
    pub archival: Vec<ProcessingRecord>,
    /// Subset of `archival` that shall be published, same order.
    pub publish: Vec<ProcessingRecord>,
    /// Items left for the next fetch window, ascending.
    pub deferred: Vec<ItemId>,
}

/// Restore id order after the unordered fan-out and split off failures.
///
/// A failed item holds back every item above it, so the cursor never skips
/// past work that has not been done.
pub fn aggregate(results: Vec<(ItemId, Result<ProcessingRecord>)>) -> Aggregate {
    let first_failure = results
        .iter()
        .filter(|(_, r)| r.is_err())
        .map(|(id, _)| *id)
        .min();

    let mut archival = Vec::new();
    let mut deferred = Vec::new();
    for (id, result) in results {
        match result {
            Ok(rec) if first_failure.map_or(true, |f| id < f) => archival.push(rec),
            _ => deferred.push(id),
        }
    }
    archival.sort_by_key(|r| r.id());
    deferred.sort();

    let publish = archival
        .iter()
        .filter(|r| r.shall_publish())
        .cloned()
        .collect();

    Aggregate {
        archival,
        publish,
        deferred,
    }
}

pub struct Controller {
    feed: Arc<dyn Feed>,
    archive: Arc<dyn Archive>,
    alerts: Arc<dyn AlertSink>,
    pipeline: Pipeline,
    settings: Arc<Settings>,
    delay: DelayPolicy,
}

impl Controller {
    pub fn new(
        feed: Arc<dyn Feed>,
        archive: Arc<dyn Archive>,
        alerts: Arc<dyn AlertSink>,
        pipeline: Pipeline,
        settings: Arc<Settings>,
        delay: DelayPolicy,
    ) -> Self {
        Self {
            feed,
            archive,
            alerts,
            pipeline,
            settings,
            delay,
        }
    }

    /// Run one generation starting at `cursor`.
    pub async fn run_generation(
        &self,
        ctx: &GenerationContext,
        cursor: Cursor,
    ) -> Result<GenerationOutcome> {
        let started_at = ctx.now("started_at").await?;
        if !ctx.is_replaying() {
            info!(
                instance = ctx.instance_id(),
                generation = ctx.generation(),
                run_id = %ctx.run_id(),
                %cursor,
                "generation started"
            );
        }

        let fetched: Vec<RawItem> = ctx
            .step("fetch", || async {
                match self.feed.fetch(cursor).await {
                    Ok(items) => Ok(items),
                    Err(err) => {
                        warn!(?err, %cursor, "fetch failed; treating as an empty batch");
                        Ok(Vec::new())
                    }
                }
            })
            .await?;
        let mut batch: Vec<RawItem> = fetched
            .into_iter()
            .filter(|item| !cursor.covers(item.id))
            .collect();
        // One per-item workflow per id, even if the feed repeats an item.
        batch.sort_by_key(|item| item.id);
        batch.dedup_by_key(|item| item.id);

        let next_cursor = if batch.is_empty() {
            if !ctx.is_replaying() {
                info!(%cursor, "no new items");
            }
            cursor
        } else {
            self.process_batch(ctx, cursor, batch).await?
        };

        let decision: DelayDecision = ctx
            .step("delay", || async {
                let finished_at = Utc::now();
                let delay_seconds =
                    self.delay
                        .next_delay_seconds(self.settings.active(), started_at, finished_at);
                Ok(DelayDecision {
                    finished_at,
                    delay_seconds,
                })
            })
            .await?;
        if !ctx.is_replaying() {
            info!(
                delay_seconds = decision.delay_seconds,
                cursor = %next_cursor,
                "determined delay"
            );
        }

        if decision.delay_seconds == 0 {
            return Ok(GenerationOutcome::Finished {
                cursor: next_cursor,
            });
        }
        let delay = Duration::seconds(decision.delay_seconds.min(u64::from(u32::MAX)) as i64);
        Ok(GenerationOutcome::Continue {
            cursor: next_cursor,
            wake_at: decision.finished_at + delay,
        })
    }

    async fn process_batch(
        &self,
        ctx: &GenerationContext,
        cursor: Cursor,
        batch: Vec<RawItem>,
    ) -> Result<Cursor> {
        if !ctx.is_replaying() {
            info!(count = batch.len(), "processing new items");
        }

        let tasks = batch.into_iter().map(|item| async move {
            let id = item.id;
            let step = format!("item:{id}");
            let result = ctx
                .step(&step, move || async move {
                    Ok(process_item(&self.pipeline, item).await)
                })
                .await;
            (id, result)
        });
        let results = join_all(tasks).await;

        for (id, result) in &results {
            if let Err(err) = result {
                error!(?err, item = %id, "item processing failed; deferring it to the next cycle");
            }
        }
        let Aggregate {
            archival,
            publish,
            deferred,
        } = aggregate(results);
        if !deferred.is_empty() {
            warn!(deferred = ?deferred, "cursor held back by failed items");
        }
        let (Some(first), Some(last)) = (
            archival.first().map(|r| r.id()),
            archival.last().map(|r| r.id()),
        ) else {
            return Ok(cursor);
        };
        // Keyed by the archived range: a retry may cover a longer prefix.
        let archive_name = format!("archive:{first}-{last}");
        let alert_name = format!("alert:{first}-{last}");

        if !ctx.is_replaying() {
            info!(
                publish = publish.len(),
                archive = archival.len(),
                "dispatching archival and alerts"
            );
        }
        let archive_step = ctx.step::<usize, _, _>(&archive_name, || async {
            match self.archive.store(&archival).await {
                Ok(stored) => Ok(stored),
                Err(err) => {
                    warn!(?err, count = archival.len(), "archival failed");
                    Ok(0)
                }
            }
        });
        let alert_step = async {
            if publish.is_empty() {
                return Ok(0);
            }
            ctx.step::<usize, _, _>(&alert_name, || async {
                let threshold = self.settings.alert_threshold();
                match self.alerts.publish(&publish, threshold).await {
                    Ok(sent) => Ok(sent),
                    Err(err) => {
                        warn!(?err, count = publish.len(), "alert publication failed");
                        Ok(0)
                    }
                }
            })
            .await
        };
        let (archived, alerted) = tokio::join!(archive_step, alert_step);
        archived?;
        alerted?;

        Ok(cursor.advance(last))
    }
}
