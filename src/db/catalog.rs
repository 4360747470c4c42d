//! Artifact catalog: files, thumbnails and tiles per capture.
//!
//! Writers take a `&mut SqliteConnection` so the coordinator can compose them
//! with [`super::complete`] in one transaction; the catalog never opens a
//! transaction itself. Every writer is an upsert keyed by its logical
//! identity, so replaying a publish leaves the same rows behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::jobs::path_str;
use super::models::{FileRecord, TileRecord};

/// Insert a file path, or return the ID it already has.
pub async fn upsert_file(conn: &mut SqliteConnection, path: &Path) -> Result<i64> {
    // The no-op update makes RETURNING yield the existing row on conflict.
    let row = sqlx::query(
        r"
        INSERT INTO files (path)
        VALUES (?)
        ON CONFLICT(path) DO UPDATE SET path = excluded.path
        RETURNING id
        ",
    )
    .bind(path_str(path)?)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("Failed to upsert file {}", path.display()))?;

    Ok(row.get::<i64, _>("id"))
}

/// Point a capture's thumbnail at `file_id`, replacing any previous one.
pub async fn upsert_thumbnail(
    conn: &mut SqliteConnection,
    capture_id: i64,
    file_id: i64,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO thumbnails (capture_id, file_id)
        VALUES (?, ?)
        ON CONFLICT(capture_id) DO UPDATE SET
            file_id = excluded.file_id,
            updated_at = datetime('now')
        ",
    )
    .bind(capture_id)
    .bind(file_id)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert thumbnail")?;

    Ok(())
}

/// Point tile `index` of a capture at `file_id`, replacing any previous one.
pub async fn upsert_tile(
    conn: &mut SqliteConnection,
    capture_id: i64,
    index: u32,
    file_id: i64,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO tiles (capture_id, tile_index, file_id)
        VALUES (?, ?, ?)
        ON CONFLICT(capture_id, tile_index) DO UPDATE SET
            file_id = excluded.file_id,
            updated_at = datetime('now')
        ",
    )
    .bind(capture_id)
    .bind(i64::from(index))
    .bind(file_id)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to upsert tile {index}"))?;

    Ok(())
}

/// Drop tile rows at or beyond `tile_count`, left over from an earlier
/// derivation that produced more tiles.
pub async fn prune_tiles(
    conn: &mut SqliteConnection,
    capture_id: i64,
    tile_count: u32,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tiles WHERE capture_id = ? AND tile_index >= ?")
        .bind(capture_id)
        .bind(i64::from(tile_count))
        .execute(&mut *conn)
        .await
        .context("Failed to prune stale tiles")?;

    Ok(result.rows_affected())
}

// ========== Read side ==========

/// Look up a catalogued file by path.
pub async fn get_file_by_path(pool: &SqlitePool, path: &Path) -> Result<Option<FileRecord>> {
    sqlx::query_as("SELECT * FROM files WHERE path = ?")
        .bind(path_str(path)?)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch file by path")
}

/// Path of a capture's thumbnail, if it has been derived.
pub async fn get_thumbnail_path(pool: &SqlitePool, capture_id: i64) -> Result<Option<PathBuf>> {
    let row: Option<(String,)> = sqlx::query_as(
        r"
        SELECT f.path
        FROM thumbnails t
        JOIN files f ON f.id = t.file_id
        WHERE t.capture_id = ?
        ",
    )
    .bind(capture_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch thumbnail path")?;

    Ok(row.map(|(path,)| PathBuf::from(path)))
}

/// Path of one tile of a capture, if it has been derived.
pub async fn get_tile_path(
    pool: &SqlitePool,
    capture_id: i64,
    index: u32,
) -> Result<Option<PathBuf>> {
    let row: Option<(String,)> = sqlx::query_as(
        r"
        SELECT f.path
        FROM tiles t
        JOIN files f ON f.id = t.file_id
        WHERE t.capture_id = ? AND t.tile_index = ?
        ",
    )
    .bind(capture_id)
    .bind(i64::from(index))
    .fetch_optional(pool)
    .await
    .context("Failed to fetch tile path")?;

    Ok(row.map(|(path,)| PathBuf::from(path)))
}

/// All tiles of a capture in index order.
pub async fn get_tiles_for_capture(pool: &SqlitePool, capture_id: i64) -> Result<Vec<TileRecord>> {
    sqlx::query_as(
        r"
        SELECT t.capture_id, t.tile_index, t.file_id, f.path
        FROM tiles t
        JOIN files f ON f.id = t.file_id
        WHERE t.capture_id = ?
        ORDER BY t.tile_index
        ",
    )
    .bind(capture_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch tiles for capture")
}

/// Number of tiles catalogued for a capture.
pub async fn count_tiles(pool: &SqlitePool, capture_id: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tiles WHERE capture_id = ?")
        .bind(capture_id)
        .fetch_one(pool)
        .await
        .context("Failed to count tiles")?;
    Ok(row.0)
}

/// Number of thumbnail rows for a capture (0 or 1).
pub async fn count_thumbnails(pool: &SqlitePool, capture_id: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thumbnails WHERE capture_id = ?")
        .bind(capture_id)
        .fetch_one(pool)
        .await
        .context("Failed to count thumbnails")?;
    Ok(row.0)
}
