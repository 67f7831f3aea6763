//! Replay-safe execution of one generation of the polling loop.
//!
//! Every step with a side effect or a non-deterministic result runs through
//! [`GenerationContext::step`]. The first execution stores the step's result
//! in the effect log; re-running the same generation after a crash or a
//! failure returns the stored value instead of repeating the work.

pub mod controller;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::db::{self, Pool};

pub use controller::{Controller, GenerationOutcome};

pub struct GenerationContext {
    pool: Pool,
    instance_id: String,
    generation: i64,
    run_id: Uuid,
    replaying: AtomicBool,
}

impl GenerationContext {
    /// Open the context for `generation`; it starts out replaying if that
    /// generation already recorded any step.
    pub async fn open(pool: Pool, instance_id: &str, generation: i64) -> Result<Self> {
        let recorded = db::count_effects(&pool, instance_id, generation).await?;
        Ok(Self {
            pool,
            instance_id: instance_id.to_string(),
            generation,
            run_id: Uuid::new_v4(),
            replaying: AtomicBool::new(recorded > 0),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Identifies this execution attempt in logs.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// True until the generation reaches its first step without a recorded result.
    /// Diagnostics that should be emitted once per generation check this first.
    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Run `f` once per generation under `name` and memoise its result.
    ///
    /// A failing `f` records nothing, so the step runs again on retry.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(payload) =
            db::load_effect(&self.pool, &self.instance_id, self.generation, name).await?
        {
            return serde_json::from_str(&payload)
                .with_context(|| format!("corrupt effect log entry for step {name}"));
        }

        self.replaying.store(false, Ordering::SeqCst);
        let value = f().await?;
        let payload = serde_json::to_string(&value)
            .with_context(|| format!("failed to serialise result of step {name}"))?;
        db::record_effect(&self.pool, &self.instance_id, self.generation, name, &payload).await?;
        Ok(value)
    }

    /// Current time, stable across replays of this generation.
    pub async fn now(&self, name: &str) -> Result<DateTime<Utc>> {
        self.step(name, || async { Ok(Utc::now()) }).await
    }
}
