use super::model::{Instance, InstanceState};
use crate::model::{Cursor, ProcessingRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&url)
        .await
        .with_context(|| format!("failed to open database {url}"))?;
    // The instance table is the loop's only memory across restarts.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL, create the parent
/// directory and ask SQLite to create the file. In-memory and non-SQLite
/// URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) if q.contains("mode=") => format!("sqlite://{path}?{q}"),
        Some(q) => format!("sqlite://{path}?{q}&mode=rwc"),
        None => format!("sqlite://{path}?mode=rwc"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn instance_from_row(row: &SqliteRow) -> Result<Instance> {
    let instance_id: String = row.get("instance_id");
    let cursor_raw: String = row.get("cursor");
    let cursor: Cursor = cursor_raw
        .parse()
        .with_context(|| format!("instance {instance_id} has a corrupt cursor"))?;
    let state_raw: String = row.get("state");
    let state = InstanceState::parse_state(&state_raw)
        .ok_or_else(|| anyhow!("instance {} has unknown state {}", instance_id, state_raw))?;
    Ok(Instance {
        cursor,
        generation: row.get("generation"),
        state,
        attempt: row.get("attempt"),
        due_at: row.get("due_at"),
        last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
        instance_id,
    })
}

const INSTANCE_COLUMNS: &str =
    "instance_id, cursor, generation, state, attempt, due_at, last_error";

#[instrument(skip_all)]
pub async fn find_instance(pool: &Pool, instance_id: &str) -> Result<Option<Instance>> {
    let row = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?"
    ))
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(instance_from_row).transpose()
}

/// Insert a new instance, or restart a completed one with a fresh cursor.
/// Returns false (and changes nothing) when the instance is still scheduled.
#[instrument(skip_all)]
pub async fn create_or_restart_instance(
    pool: &Pool,
    instance_id: &str,
    cursor: Cursor,
    due_at: DateTime<Utc>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let existing: Option<(String, i64)> =
        sqlx::query_as("SELECT state, generation FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO instances (instance_id, cursor, generation, state, attempt, due_at) VALUES (?, ?, 0, ?, 0, ?)",
            )
            .bind(instance_id)
            .bind(cursor.to_string())
            .bind(InstanceState::Scheduled.as_str())
            .bind(due_at)
            .execute(&mut *tx)
            .await?;
        }
        Some((state, _)) if state == InstanceState::Scheduled.as_str() => {
            return Ok(false);
        }
        Some((_, generation)) => {
            // Leftover effects belong to an older generation; never replay them.
            sqlx::query("DELETE FROM effects WHERE instance_id = ?")
                .bind(instance_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE instances SET cursor = ?, generation = ?, state = ?, attempt = 0, due_at = ?, last_error = NULL, updated_at = CURRENT_TIMESTAMP WHERE instance_id = ?",
            )
            .bind(cursor.to_string())
            .bind(generation + 1)
            .bind(InstanceState::Scheduled.as_str())
            .bind(due_at)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn next_due_instance(pool: &Pool, now: DateTime<Utc>) -> Result<Option<Instance>> {
    let row = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE state = ? AND datetime(due_at) <= datetime(?) ORDER BY datetime(due_at) ASC LIMIT 1"
    ))
    .bind(InstanceState::Scheduled.as_str())
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(instance_from_row).transpose()
}

/// Hand the loop over to the next generation: store its cursor and wake-up
/// time and drop the finished generation's effect log, atomically.
#[instrument(skip_all)]
pub async fn advance_generation(
    pool: &Pool,
    instance_id: &str,
    generation: i64,
    cursor: Cursor,
    due_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE instances SET cursor = ?, generation = generation + 1, attempt = 0, due_at = ?, last_error = NULL, updated_at = CURRENT_TIMESTAMP WHERE instance_id = ? AND generation = ?",
    )
    .bind(cursor.to_string())
    .bind(due_at)
    .bind(instance_id)
    .bind(generation)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!(
            "instance {} is no longer at generation {}",
            instance_id,
            generation
        ));
    }
    sqlx::query("DELETE FROM effects WHERE instance_id = ? AND generation = ?")
        .bind(instance_id)
        .bind(generation)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_instance(
    pool: &Pool,
    instance_id: &str,
    generation: i64,
    cursor: Cursor,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE instances SET cursor = ?, state = ?, attempt = 0, last_error = NULL, updated_at = CURRENT_TIMESTAMP WHERE instance_id = ? AND generation = ?",
    )
    .bind(cursor.to_string())
    .bind(InstanceState::Completed.as_str())
    .bind(instance_id)
    .bind(generation)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!(
            "instance {} is no longer at generation {}",
            instance_id,
            generation
        ));
    }
    sqlx::query("DELETE FROM effects WHERE instance_id = ? AND generation = ?")
        .bind(instance_id)
        .bind(generation)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Retry the current generation later: 5s * 2^attempt, capped at `max_cap_secs`.
#[instrument(skip_all)]
pub async fn backoff_instance_with_cap(
    pool: &Pool,
    instance_id: &str,
    attempt: i32,
    max_cap_secs: i64,
    error: &str,
) -> Result<i64> {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs > 0 {
        secs.min(max_cap_secs)
    } else {
        secs
    };
    sqlx::query(
        "UPDATE instances SET attempt = ?, due_at = datetime('now', ? || ' seconds'), last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE instance_id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(error)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(secs)
}

#[instrument(skip_all)]
pub async fn load_effect(
    pool: &Pool,
    instance_id: &str,
    generation: i64,
    step: &str,
) -> Result<Option<String>> {
    let payload = sqlx::query_scalar::<_, String>(
        "SELECT payload FROM effects WHERE instance_id = ? AND generation = ? AND step = ?",
    )
    .bind(instance_id)
    .bind(generation)
    .bind(step)
    .fetch_optional(pool)
    .await?;
    Ok(payload)
}

/// Record a step's result. The first recording wins.
#[instrument(skip_all)]
pub async fn record_effect(
    pool: &Pool,
    instance_id: &str,
    generation: i64,
    step: &str,
    payload: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO effects (instance_id, generation, step, payload) VALUES (?, ?, ?, ?) ON CONFLICT (instance_id, generation, step) DO NOTHING",
    )
    .bind(instance_id)
    .bind(generation)
    .bind(step)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_effects(pool: &Pool, instance_id: &str, generation: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM effects WHERE instance_id = ? AND generation = ?")
            .bind(instance_id)
            .bind(generation)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Insert or replace every record, keyed by item id. Safe to repeat.
#[instrument(skip_all)]
pub async fn upsert_archived_items(pool: &Pool, records: &[ProcessingRecord]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for rec in records {
        let item = &rec.item;
        let hashtags = item
            .hashtags
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("|");
        sqlx::query(
            "INSERT INTO archived_items (item_id, partition_key, created_at, full_text, hashtags, reply_to, permalink, \
                 text_without_tags, text_highlighted, lexical_score, lexical_label, lexical_version, \
                 remote_score, remote_label, remote_version, shall_publish) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (item_id) DO UPDATE SET \
                 partition_key = excluded.partition_key, created_at = excluded.created_at, \
                 full_text = excluded.full_text, hashtags = excluded.hashtags, \
                 reply_to = excluded.reply_to, permalink = excluded.permalink, \
                 text_without_tags = excluded.text_without_tags, \
                 text_highlighted = excluded.text_highlighted, \
                 lexical_score = excluded.lexical_score, lexical_label = excluded.lexical_label, \
                 lexical_version = excluded.lexical_version, remote_score = excluded.remote_score, \
                 remote_label = excluded.remote_label, remote_version = excluded.remote_version, \
                 shall_publish = excluded.shall_publish",
        )
        .bind(item.id.to_string())
        .bind(item.created_at.year().to_string())
        .bind(item.created_at)
        .bind(&item.full_text)
        .bind(hashtags)
        .bind(item.reply_to.map(|id| id.to_string()))
        .bind(&item.permalink)
        .bind(&rec.text_without_tags)
        .bind(&rec.text_highlighted)
        .bind(rec.lexical_score)
        .bind(rec.lexical_label.as_str())
        .bind(&rec.lexical_version)
        .bind(rec.remote_score)
        .bind(rec.remote_label.as_str())
        .bind(rec.remote_version.as_deref())
        .bind(rec.shall_publish())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to archive item {}", item.id))?;
    }
    tx.commit().await?;
    Ok(records.len())
}

#[instrument(skip_all)]
pub async fn count_archived_items(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archived_items")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
