//! Capture registry and the derivation job backlog.
//!
//! A job is claimable while `claimed_at` is NULL. Claiming stamps it with a
//! timestamp and claimant in a single conditional `UPDATE ... RETURNING`, so
//! concurrent claimants (threads or separate processes) can never receive the
//! same row. Jobs leave the backlog only through [`complete`], which callers
//! run inside the same transaction that publishes the job's artifacts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use thiserror::Error;

use super::models::{Capture, ClaimedJob, DerivationJob, NewCapture};

/// Raised by [`complete`] when the job is no longer held by the caller.
#[derive(Debug, Error)]
#[error("derivation job {job_id} is no longer claimed by {claimant}")]
pub struct ClaimLost {
    pub job_id: i64,
    pub claimant: String,
}

/// What [`release_claim`] did with a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The claim was cleared and the job is claimable again.
    Requeued,
    /// Another job for the same capture was already waiting, so the stuck
    /// job was dropped in its favour.
    Merged,
    /// No claimed job with that id exists.
    NotClaimed,
}

// ========== Captures ==========

/// Record a capture, returning its ID.
pub async fn insert_capture(pool: &SqlitePool, capture: &NewCapture) -> Result<i64> {
    url::Url::parse(&capture.url)
        .with_context(|| format!("Invalid capture URL: {}", capture.url))?;
    let source_path = path_str(&capture.source_path)?;

    let result = sqlx::query(
        r"
        INSERT INTO captures (url, source_path, metadata)
        VALUES (?, ?, ?)
        ",
    )
    .bind(&capture.url)
    .bind(source_path)
    .bind(capture.metadata.to_string())
    .execute(pool)
    .await
    .context("Failed to insert capture")?;

    Ok(result.last_insert_rowid())
}

/// Get a capture by ID.
pub async fn get_capture(pool: &SqlitePool, id: i64) -> Result<Option<Capture>> {
    sqlx::query_as("SELECT * FROM captures WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch capture")
}

// ========== Derivation jobs ==========

/// Queue a capture for (re)derivation, returning the job ID.
///
/// If a job for the capture is already waiting to be claimed, its ID is
/// returned and no second job is created.
pub async fn enqueue_derivation_job(pool: &SqlitePool, capture_id: i64) -> Result<i64> {
    let row = sqlx::query(
        r"
        INSERT INTO derivation_jobs (capture_id)
        VALUES (?)
        ON CONFLICT(capture_id) WHERE claimed_at IS NULL
        DO UPDATE SET capture_id = excluded.capture_id
        RETURNING id
        ",
    )
    .bind(capture_id)
    .fetch_one(pool)
    .await
    .context("Failed to enqueue derivation job")?;

    Ok(row.get::<i64, _>("id"))
}

/// Atomically claim the oldest unclaimed job for `claimant`.
///
/// Jobs whose capture already has a claimed job are skipped, so a capture is
/// never derived by two workers at once. Returns `None` when nothing is
/// claimable.
pub async fn claim_next(pool: &SqlitePool, claimant: &str) -> Result<Option<ClaimedJob>> {
    let row = sqlx::query(
        r"
        UPDATE derivation_jobs
        SET claimed_at = datetime('now'), claimed_by = ?
        WHERE claimed_at IS NULL
          AND id = (
              SELECT j.id FROM derivation_jobs j
              WHERE j.claimed_at IS NULL
                AND NOT EXISTS (
                    SELECT 1 FROM derivation_jobs c
                    WHERE c.capture_id = j.capture_id
                      AND c.claimed_at IS NOT NULL
                )
              ORDER BY j.created_at, j.id
              LIMIT 1
          )
        RETURNING id, capture_id, created_at, claimed_at, claimed_by,
            (SELECT source_path FROM captures WHERE captures.id = derivation_jobs.capture_id)
                AS source_path
        ",
    )
    .bind(claimant)
    .fetch_optional(pool)
    .await
    .context("Failed to claim derivation job")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let job = DerivationJob::from_row(&row).context("Failed to decode claimed job")?;
    let source_path: String = row
        .try_get("source_path")
        .with_context(|| format!("Claimed job {} has no capture source path", job.id))?;

    Ok(Some(ClaimedJob {
        capture_id: job.capture_id,
        source_path: PathBuf::from(source_path),
        job,
    }))
}

/// Remove a finished job from the backlog.
///
/// Must run on the connection of the transaction that publishes the job's
/// artifacts. Fails with [`ClaimLost`] if the job is gone or held by someone
/// else, which makes the caller roll back.
pub async fn complete(conn: &mut SqliteConnection, job_id: i64, claimant: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM derivation_jobs WHERE id = ? AND claimed_by = ?")
        .bind(job_id)
        .bind(claimant)
        .execute(&mut *conn)
        .await
        .context("Failed to complete derivation job")?;

    if result.rows_affected() == 0 {
        return Err(ClaimLost {
            job_id,
            claimant: claimant.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Clear a stuck claim so another worker can pick the job up.
///
/// Claims never expire on their own; this is the operator's reclaim path.
pub async fn release_claim(pool: &SqlitePool, job_id: i64) -> Result<ReleaseOutcome> {
    let requeued = sqlx::query(
        r"
        UPDATE derivation_jobs
        SET claimed_at = NULL, claimed_by = NULL
        WHERE id = ?
          AND claimed_at IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM derivation_jobs w
              WHERE w.capture_id = derivation_jobs.capture_id
                AND w.claimed_at IS NULL
          )
        ",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to release claim")?;

    if requeued.rows_affected() > 0 {
        return Ok(ReleaseOutcome::Requeued);
    }

    let merged = sqlx::query("DELETE FROM derivation_jobs WHERE id = ? AND claimed_at IS NOT NULL")
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to drop superseded claim")?;

    if merged.rows_affected() > 0 {
        Ok(ReleaseOutcome::Merged)
    } else {
        Ok(ReleaseOutcome::NotClaimed)
    }
}

/// Get a job by ID.
pub async fn get_job(pool: &SqlitePool, id: i64) -> Result<Option<DerivationJob>> {
    sqlx::query_as("SELECT * FROM derivation_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch derivation job")
}

/// Count jobs waiting to be claimed.
pub async fn count_unclaimed_jobs(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM derivation_jobs WHERE claimed_at IS NULL")
            .fetch_one(pool)
            .await
            .context("Failed to count unclaimed jobs")?;
    Ok(row.0)
}

/// List in-flight jobs, oldest claim first.
pub async fn list_claimed_jobs(pool: &SqlitePool) -> Result<Vec<DerivationJob>> {
    sqlx::query_as(
        r"
        SELECT * FROM derivation_jobs
        WHERE claimed_at IS NOT NULL
        ORDER BY claimed_at, id
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list claimed jobs")
}

pub(super) fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}
