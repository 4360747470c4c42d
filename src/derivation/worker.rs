use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, trace, warn};

use super::imaging::{derive_to_dir, DeriveError, DerivedFiles};
use crate::config::{Config, FailurePolicy};
use crate::db::{
    claim_next, complete, list_claimed_jobs, prune_tiles, upsert_file, upsert_thumbnail,
    upsert_tile, ClaimedJob, Database,
};

/// Where a coordinator is in handling its current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// About to claim.
    Idle,
    /// Holding a job; deriving files on disk.
    Claimed,
    /// Derivation done; publish transaction open.
    Publishing,
    /// Artifacts published and job removed.
    Committed,
    /// Derive or publish failed; the job stays claimed.
    Failed,
    /// Nothing was claimable.
    Done,
}

/// A job that reached [`JobState::Committed`].
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: i64,
    pub capture_id: i64,
    pub thumbnail: PathBuf,
    pub tiles: u32,
}

/// A job that reached [`JobState::Failed`].
#[derive(Debug)]
pub struct JobFailure {
    pub job_id: i64,
    pub capture_id: i64,
    pub error: anyhow::Error,
}

impl JobFailure {
    #[must_use]
    pub fn into_error(self) -> anyhow::Error {
        self.error.context(format!(
            "Derivation job {} for capture {} failed",
            self.job_id, self.capture_id
        ))
    }
}

/// Result of one [`Coordinator::step`].
#[derive(Debug)]
pub enum StepOutcome {
    Committed(JobReport),
    Failed(JobFailure),
    BacklogEmpty,
}

/// Totals for a coordinator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: u64,
    pub failed: u64,
}

impl std::ops::AddAssign for RunSummary {
    fn add_assign(&mut self, other: Self) {
        self.committed += other.committed;
        self.failed += other.failed;
    }
}

/// Claims jobs one at a time, derives their artifacts and publishes them.
pub struct Coordinator {
    db: Database,
    derived_dir: PathBuf,
    claimant: String,
    failure_policy: FailurePolicy,
    watch_interval: Option<Duration>,
    state: JobState,
}

impl Coordinator {
    /// Create a coordinator claiming under `claimant`.
    pub fn new(config: &Config, db: Database, claimant: impl Into<String>) -> Self {
        Self {
            db,
            derived_dir: config.derived_dir.clone(),
            claimant: claimant.into(),
            failure_policy: config.failure_policy,
            watch_interval: config.watch_interval,
            state: JobState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    #[must_use]
    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    /// Output directory for a capture's derived files.
    #[must_use]
    pub fn output_dir(&self, capture_id: i64) -> PathBuf {
        self.derived_dir.join(capture_id.to_string())
    }

    /// Handle at most one job: claim, derive, publish.
    ///
    /// Job-level failures come back as [`StepOutcome::Failed`] with the job
    /// left claimed. `Err` means the claim itself could not be attempted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried for the next job.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.state = JobState::Idle;

        let Some(claimed) = claim_next(self.db.pool(), &self.claimant).await? else {
            self.state = JobState::Done;
            return Ok(StepOutcome::BacklogEmpty);
        };

        self.state = JobState::Claimed;
        let job_id = claimed.job_id();
        let capture_id = claimed.capture_id;
        info!(
            job_id,
            capture_id,
            claimant = %self.claimant,
            source = %claimed.source_path.display(),
            "Claimed derivation job"
        );

        let out_dir = self.output_dir(capture_id);
        let files = match derive(&claimed.source_path, &out_dir).await {
            Ok(files) => files,
            Err(e) => {
                self.state = JobState::Failed;
                return Ok(StepOutcome::Failed(JobFailure {
                    job_id,
                    capture_id,
                    error: e,
                }));
            }
        };
        debug!(job_id, capture_id, tiles = files.tiles.len(), "Derived artifacts");

        self.state = JobState::Publishing;
        if let Err(e) = publish(&self.db, &claimed, &files).await {
            self.state = JobState::Failed;
            return Ok(StepOutcome::Failed(JobFailure {
                job_id,
                capture_id,
                error: e,
            }));
        }

        self.state = JobState::Committed;
        let tiles = files.tile_count();
        info!(job_id, capture_id, tiles, "Published derived artifacts");

        Ok(StepOutcome::Committed(JobReport {
            job_id,
            capture_id,
            thumbnail: files.thumbnail,
            tiles,
        }))
    }

    /// Run until the backlog is empty, or forever when watching.
    ///
    /// After a failed job the configured [`FailurePolicy`] decides whether to
    /// stop with that job's error or move on to the next claim.
    ///
    /// # Errors
    ///
    /// Returns the failed job's error under [`FailurePolicy::Abort`], or any
    /// error claiming a job.
    pub async fn run_until_empty(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        loop {
            match self.step().await? {
                StepOutcome::Committed(_) => summary.committed += 1,
                StepOutcome::Failed(failure) => {
                    summary.failed += 1;
                    error!(
                        job_id = failure.job_id,
                        capture_id = failure.capture_id,
                        claimant = %self.claimant,
                        "Derivation job failed, leaving it claimed: {:#}",
                        failure.error
                    );
                    if self.failure_policy == FailurePolicy::Abort {
                        return Err(failure.into_error());
                    }
                }
                StepOutcome::BacklogEmpty => match self.watch_interval {
                    None => {
                        info!(
                            claimant = %self.claimant,
                            committed = summary.committed,
                            failed = summary.failed,
                            "Backlog empty, worker finished"
                        );
                        return Ok(summary);
                    }
                    Some(interval) => {
                        trace!("No claimable derivation jobs");
                        tokio::time::sleep(interval).await;
                    }
                },
            }
        }
    }
}

/// Derive into the capture's output directory on a blocking thread.
async fn derive(source_path: &Path, out_dir: &Path) -> Result<DerivedFiles> {
    let source = source_path.to_path_buf();
    let out = out_dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || derive_to_dir(&source, &out))
        .await
        .map_err(|e| DeriveError::Task(e.to_string()))??;

    Ok(files)
}

/// Publish a job's artifacts and complete it in one transaction.
async fn publish(db: &Database, claimed: &ClaimedJob, files: &DerivedFiles) -> Result<()> {
    let mut tx = db.begin().await?;
    publish_artifacts(&mut *tx, claimed, files).await?;
    tx.commit()
        .await
        .with_context(|| format!("Failed to commit publish of job {}", claimed.job_id()))?;
    Ok(())
}

/// Write the catalog rows for a derivation and remove its job.
///
/// Runs on the caller's transaction; nothing here is visible until the caller
/// commits, and dropping the transaction discards all of it including the
/// job removal.
///
/// # Errors
///
/// Returns an error if any write fails or the job is no longer claimed by
/// this claimant.
pub async fn publish_artifacts(
    conn: &mut SqliteConnection,
    claimed: &ClaimedJob,
    files: &DerivedFiles,
) -> Result<()> {
    let capture_id = claimed.capture_id;

    upsert_file(conn, &claimed.source_path).await?;

    let thumb_file = upsert_file(conn, &files.thumbnail).await?;
    upsert_thumbnail(conn, capture_id, thumb_file).await?;

    for (index, path) in files.tiles.iter().enumerate() {
        let file_id = upsert_file(conn, path).await?;
        upsert_tile(conn, capture_id, index as u32, file_id).await?;
    }

    let pruned = prune_tiles(conn, capture_id, files.tile_count()).await?;
    if pruned > 0 {
        debug!(capture_id, pruned, "Removed tiles beyond new tile count");
    }

    complete(conn, claimed.job_id(), claimed.claimant()).await
}

/// Run `config.worker_concurrency` coordinators in parallel until each
/// finds the backlog empty.
///
/// # Errors
///
/// Returns the first worker error after all workers have stopped.
pub async fn run_workers(config: &Config, db: &Database) -> Result<RunSummary> {
    let mut handles = Vec::with_capacity(config.worker_concurrency);
    for n in 0..config.worker_concurrency {
        let mut coordinator = Coordinator::new(config, db.clone(), config.claimant_id(n));
        handles.push(tokio::spawn(async move { coordinator.run_until_empty().await }));
    }

    let mut summary = RunSummary::default();
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(worker_summary)) => summary += worker_summary,
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("Derivation worker panicked: {e}");
                first_error.get_or_insert(anyhow::anyhow!("Derivation worker panicked: {e}"));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

/// Warn about jobs that are still claimed from earlier runs.
///
/// Claims do not expire; these need an operator to release them.
pub async fn report_stuck_claims(db: &Database) -> Result<usize> {
    let claimed = list_claimed_jobs(db.pool()).await?;
    for job in &claimed {
        warn!(
            job_id = job.id,
            capture_id = job.capture_id,
            claimed_by = job.claimed_by.as_deref().unwrap_or_default(),
            claimed_at = job.claimed_at.as_deref().unwrap_or_default(),
            "Derivation job is still claimed"
        );
    }
    Ok(claimed.len())
}
