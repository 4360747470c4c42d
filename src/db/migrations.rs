use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM _schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: captures, jobs and artifact catalog");

    // Captures are written by the acquisition process and read-only here.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS captures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            source_path TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create captures table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS derivation_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            capture_id INTEGER NOT NULL REFERENCES captures(id),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            claimed_at TEXT,
            claimed_by TEXT,
            CHECK ((claimed_at IS NULL) = (claimed_by IS NULL))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create derivation_jobs table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_derivation_jobs_unclaimed ON derivation_jobs(created_at, id) WHERE claimed_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_derivation_jobs_capture ON derivation_jobs(capture_id)",
    )
    .execute(pool)
    .await?;

    // At most one waiting job per capture; claimed jobs are not constrained.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_derivation_jobs_one_waiting ON derivation_jobs(capture_id) WHERE claimed_at IS NULL",
    )
    .execute(pool)
    .await
    .context("Failed to create waiting-job uniqueness index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create files table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS thumbnails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            capture_id INTEGER NOT NULL UNIQUE REFERENCES captures(id),
            file_id INTEGER NOT NULL REFERENCES files(id),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create thumbnails table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS tiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            capture_id INTEGER NOT NULL REFERENCES captures(id),
            tile_index INTEGER NOT NULL CHECK (tile_index >= 0),
            file_id INTEGER NOT NULL REFERENCES files(id),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(capture_id, tile_index)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create tiles table")?;

    Ok(())
}
