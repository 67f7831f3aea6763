//! Durable timer for the polling loops.
//!
//! Each loop is a row in `instances`. The worker picks the earliest due row,
//! runs one generation of it and either schedules the next generation,
//! completes the loop, or backs off and retries the same generation.
use anyhow::{anyhow, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, instrument};

use crate::db::{self, Instance, Pool};
use crate::model::Cursor;
use crate::workflow::{Controller, GenerationContext, GenerationOutcome};

static INSTANCE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("valid instance id pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if INSTANCE_ID.is_match(instance_id) {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid instance id {:?}: expected 1-64 of [A-Za-z0-9_.-], starting alphanumeric",
            instance_id
        ))
    }
}

/// Start the loop `instance_id` at `cursor` unless it is already scheduled.
/// A completed loop is restarted with the given cursor.
#[instrument(skip_all, fields(instance = instance_id))]
pub async fn ensure_running(pool: &Pool, instance_id: &str, cursor: Cursor) -> Result<StartOutcome> {
    validate_instance_id(instance_id)?;
    if db::create_or_restart_instance(pool, instance_id, cursor, Utc::now()).await? {
        info!(%cursor, "instance started");
        Ok(StartOutcome::Started)
    } else {
        info!("instance already running");
        Ok(StartOutcome::AlreadyRunning)
    }
}

#[instrument(skip_all)]
pub async fn process_next_due(
    pool: &Pool,
    controller: &Controller,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(inst) = db::next_due_instance(pool, Utc::now()).await? else {
        return Ok(false);
    };
    let Instance {
        instance_id,
        generation,
        cursor,
        attempt,
        ..
    } = &inst;

    let outcome = async {
        let ctx = GenerationContext::open(pool.clone(), instance_id, *generation).await?;
        controller.run_generation(&ctx, *cursor).await
    }
    .await;
    match outcome {
        Ok(GenerationOutcome::Continue { cursor, wake_at }) => {
            db::advance_generation(pool, instance_id, *generation, cursor, wake_at).await?;
            info!(
                instance = %instance_id,
                generation = generation + 1,
                %cursor,
                %wake_at,
                "next generation scheduled"
            );
        }
        Ok(GenerationOutcome::Finished { cursor }) => {
            db::complete_instance(pool, instance_id, *generation, cursor).await?;
            info!(instance = %instance_id, %cursor, "loop inactive; instance completed");
        }
        Err(err) => {
            let secs = db::backoff_instance_with_cap(
                pool,
                instance_id,
                *attempt,
                max_backoff_secs,
                &format!("{err:#}"),
            )
            .await?;
            error!(
                ?err,
                instance = %instance_id,
                generation,
                attempt,
                retry_in = secs,
                "generation failed; backoff"
            );
        }
    }
    Ok(true)
}
