//! Concurrency tests for claiming derivation jobs.

use std::collections::HashSet;

use capture_deriver::db::{
    claim_next, count_unclaimed_jobs, enqueue_derivation_job, insert_capture, list_claimed_jobs,
    Database, NewCapture,
};
use serde_json::json;
use tempfile::TempDir;

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

async fn enqueue_captures(db: &Database, count: usize) -> Vec<i64> {
    let mut job_ids = Vec::with_capacity(count);
    for i in 0..count {
        let capture = NewCapture {
            url: format!("https://example.com/page/{i}"),
            source_path: format!("/captures/{i}/w1024.png").into(),
            metadata: json!({ "url": format!("https://example.com/page/{i}") }),
        };
        let capture_id = insert_capture(db.pool(), &capture).await.unwrap();
        job_ids.push(enqueue_derivation_job(db.pool(), capture_id).await.unwrap());
    }
    job_ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_job_is_claimed_exactly_once() {
    let (db, _temp_dir) = setup_db().await;
    let job_ids = enqueue_captures(&db, 1).await;

    let mut handles = Vec::new();
    for n in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            claim_next(db.pool(), &format!("worker-{n}")).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(claimed) = handle.await.unwrap().unwrap() {
            winners.push(claimed);
        }
    }

    assert_eq!(winners.len(), 1, "exactly one claimant should win");
    assert_eq!(winners[0].job_id(), job_ids[0]);

    let claimed = list_claimed_jobs(db.pool()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some(winners[0].claimant()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimants_never_share_jobs() {
    let (db, _temp_dir) = setup_db().await;
    let job_ids = enqueue_captures(&db, 40).await;

    let mut handles = Vec::new();
    for n in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let claimant = format!("worker-{n}");
            let mut mine = Vec::new();
            while let Some(claimed) = claim_next(db.pool(), &claimant).await.unwrap() {
                assert_eq!(claimed.claimant(), claimant);
                mine.push(claimed.job_id());
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for job_id in handle.await.unwrap() {
            assert!(seen.insert(job_id), "job {job_id} was claimed twice");
        }
    }

    assert_eq!(seen, job_ids.into_iter().collect::<HashSet<_>>());
    assert_eq!(count_unclaimed_jobs(db.pool()).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_handles_share_one_backlog() {
    let (db, temp_dir) = setup_db().await;
    let job_ids = enqueue_captures(&db, 20).await;

    // A second handle on the same file stands in for another process.
    let other = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("Failed to open second handle");

    let drain = |db: Database, claimant: &'static str| {
        tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(claimed) = claim_next(db.pool(), claimant).await.unwrap() {
                mine.push(claimed.job_id());
            }
            mine
        })
    };

    let a = drain(db.clone(), "process-a");
    let b = drain(other, "process-b");
    let a = a.await.unwrap();
    let b = b.await.unwrap();

    let a_set: HashSet<_> = a.iter().copied().collect();
    let b_set: HashSet<_> = b.iter().copied().collect();
    assert!(a_set.is_disjoint(&b_set));
    assert_eq!(a.len() + b.len(), job_ids.len());
}
