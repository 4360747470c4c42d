use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An archived page snapshot, written by the acquisition process.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Capture {
    pub id: i64,
    pub url: String,
    pub source_path: String,
    /// Acquisition metadata as JSON text.
    pub metadata: String,
    pub created_at: String,
}

impl Capture {
    /// Parse the stored acquisition metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored text is not valid JSON.
    pub fn metadata_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.metadata)
    }
}

/// Data for inserting a new capture.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub url: String,
    pub source_path: PathBuf,
    pub metadata: serde_json::Value,
}

/// A pending or in-flight derivation job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DerivationJob {
    pub id: i64,
    pub capture_id: i64,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub claimed_by: Option<String>,
}

impl DerivationJob {
    /// A claimed job is in flight and cannot be claimed again.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}

/// A job handed to exactly one claimant, with what it needs to derive.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: DerivationJob,
    pub capture_id: i64,
    pub source_path: PathBuf,
}

impl ClaimedJob {
    #[must_use]
    pub fn job_id(&self) -> i64 {
        self.job.id
    }

    /// Identity the job was claimed under.
    #[must_use]
    pub fn claimant(&self) -> &str {
        self.job.claimed_by.as_deref().unwrap_or_default()
    }
}

/// A catalogued file path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub created_at: String,
}

/// One tile of a capture, joined with its file path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TileRecord {
    pub capture_id: i64,
    pub tile_index: i64,
    pub file_id: i64,
    pub path: String,
}
