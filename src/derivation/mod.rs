//! The derivation pipeline: turning capture screenshots into thumbnails and
//! tiles and publishing them to the artifact catalog.

pub mod imaging;
pub mod worker;

pub use imaging::{
    derive_to_dir, make_thumbnail, make_tiles, open_source, tile_spans, DeriveError, DerivedFiles,
    TileSpan, THUMBNAIL_FILE, THUMBNAIL_MAX_HEIGHT, TILES_DIR, TILE_HEIGHT,
};
pub use worker::{
    publish_artifacts, report_stuck_claims, run_workers, Coordinator, JobFailure, JobReport,
    JobState, RunSummary, StepOutcome,
};
