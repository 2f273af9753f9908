//! PostgreSQL repository integration tests.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database.
//! Run migrations first: `sqlx migrate run`, then
//! `cargo test -p tether-db -- --ignored`.

use chrono::{Duration, Utc};
use uuid::Uuid;

use tether_core::{
    ConnectionKind, ConnectionTarget, CreatedBy, DetectedConnection, DetectionFilter,
    DetectionState, Error, JobScope, JobStatus, NewChunk, RedetectPolicy, Repositories,
};
use tether_db::{Database, DEFAULT_TEST_DATABASE_URL};

async fn claim(repos: &Repositories, job_id: Uuid) -> tether_core::DetectionJob {
    // Other tests may share the queue; fail whatever is ahead of ours.
    while let Some(job) = repos.jobs.claim_next().await.unwrap() {
        if job.id == job_id {
            return job;
        }
        repos.jobs.fail(job.id, "claimed by another test").await.unwrap();
    }
    panic!("job {} should be claimable", job_id);
}

async fn setup() -> Repositories {
    let _ = dotenvy::dotenv();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_TEST_DATABASE_URL.to_string());
    Database::connect(&database_url)
        .await
        .expect("Failed to connect to test database")
        .repositories()
}

async fn document_with_chunks(repos: &Repositories, n: i32) -> (Uuid, Vec<Uuid>) {
    let doc = repos.documents.insert("pg test document").await.unwrap();
    let ids = repos
        .chunks
        .insert_batch(
            doc,
            (0..n)
                .map(|i| NewChunk {
                    sequence_number: i,
                    content: format!("chunk {}", i),
                })
                .collect(),
        )
        .await
        .unwrap();
    (doc, ids)
}

fn bridge(to: Uuid) -> DetectedConnection {
    DetectedConnection {
        target: ConnectionTarget::Chunk(to),
        kind: ConnectionKind::ThematicBridge,
        strength: 0.9,
        metadata: Some(serde_json::json!({"model": "test"})),
    }
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_chunk_state_round_trip() {
    let repos = setup().await;
    let (doc, ids) = document_with_chunks(&repos, 3).await;

    assert_eq!(
        repos.chunks.get_state(ids[0]).await.unwrap(),
        DetectionState::Undetected
    );
    let first = Utc::now() - Duration::seconds(30);
    repos.chunks.mark_detected(ids[0], first).await.unwrap();
    let later = Utc::now();
    repos.chunks.mark_detected(ids[0], later).await.unwrap();

    let chunk = repos.chunks.get(ids[0]).await.unwrap().unwrap();
    let detected_at = chunk.detection.detected_at().unwrap();
    assert!(detected_at > first);

    let undetected = repos
        .chunks
        .list_by_document(doc, DetectionFilter::Undetected)
        .await
        .unwrap();
    assert_eq!(
        undetected.iter().map(|c| c.id).collect::<Vec<_>>(),
        ids[1..].to_vec()
    );

    repos.chunks.mark_undetected(ids[0]).await.unwrap();
    let chunk = repos.chunks.get(ids[0]).await.unwrap().unwrap();
    assert!(chunk.detection.detected_at().is_none());

    assert!(matches!(
        repos.chunks.mark_detected(Uuid::new_v4(), later).await,
        Err(Error::ChunkNotFound(_))
    ));
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_duplicate_sequence_number_rejected() {
    let repos = setup().await;
    let (doc, _) = document_with_chunks(&repos, 1).await;
    let err = repos
        .chunks
        .insert_batch(
            doc,
            vec![NewChunk {
                sequence_number: 0,
                content: "again".to_string(),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_one_active_job_per_document() {
    let repos = setup().await;
    let (doc, _) = document_with_chunks(&repos, 1).await;

    let first = repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::User)
        .await
        .unwrap();
    assert!(first.is_some());
    let second = repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::Auto)
        .await
        .unwrap();
    assert!(second.is_none());

    let active = repos.jobs.active_for_document(doc).await.unwrap().unwrap();
    assert_eq!(Some(active.id), first);

    repos.jobs.fail(active.id, "test").await.unwrap();
    assert!(repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::User)
        .await
        .unwrap()
        .is_some());

    assert!(matches!(
        repos
            .jobs
            .create_exclusive(Uuid::new_v4(), JobScope::Full, CreatedBy::User)
            .await,
        Err(Error::DocumentNotFound(_))
    ));
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_job_progress_lifecycle() {
    let repos = setup().await;
    let (doc, ids) = document_with_chunks(&repos, 2).await;
    let job_id = repos
        .jobs
        .create_exclusive(
            doc,
            JobScope::Selective {
                chunk_ids: ids.iter().copied().collect(),
            },
            CreatedBy::User,
        )
        .await
        .unwrap()
        .unwrap();

    let claimed = claim(&repos, job_id).await;
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.scope.explicit_chunk_ids().unwrap().len(), 2);

    assert!(repos.jobs.start(job_id, 2).await.unwrap());
    assert!(repos.jobs.record_progress(job_id, None).await.unwrap());
    assert!(repos
        .jobs
        .record_progress(
            job_id,
            Some(tether_core::ChunkFailure {
                chunk_id: ids[1],
                error: "detector down".to_string(),
            }),
        )
        .await
        .unwrap());
    assert!(repos.jobs.complete(job_id).await.unwrap());
    // A terminal job refuses further progress.
    assert!(!repos.jobs.record_progress(job_id, None).await.unwrap());
    assert!(!repos.jobs.fail(job_id, "late").await.unwrap());

    let job = repos.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!((job.progress.completed, job.progress.failed), (1, 1));
    assert_eq!(job.failed_chunk_ids(), vec![ids[1]]);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_connections_dedupe_and_replace() {
    let repos = setup().await;
    let (doc, ids) = document_with_chunks(&repos, 2).await;
    let job_a = repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::User)
        .await
        .unwrap()
        .unwrap();

    let inserted = repos
        .connections
        .record(
            ids[0],
            job_a,
            vec![bridge(ids[1]), bridge(ids[1])],
            RedetectPolicy::Append,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    repos.jobs.fail(job_a, "done").await.unwrap();

    let job_b = repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::User)
        .await
        .unwrap()
        .unwrap();
    repos
        .connections
        .record(ids[0], job_b, vec![bridge(ids[1])], RedetectPolicy::Replace)
        .await
        .unwrap();

    let stored = repos.connections.list_for_chunk(ids[0]).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].job_id, job_b);
    assert_eq!(stored[0].target, ConnectionTarget::Chunk(ids[1]));

    let summaries = repos
        .chunks
        .list_summaries(doc, DetectionFilter::All)
        .await
        .unwrap();
    assert_eq!(summaries[0].connection_count, 1);
    assert_eq!(summaries[1].connection_count, 0);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_fail_stale_frees_document() {
    let repos = setup().await;
    let (doc, _) = document_with_chunks(&repos, 1).await;
    let job_id = repos
        .jobs
        .create_exclusive(doc, JobScope::Full, CreatedBy::User)
        .await
        .unwrap()
        .unwrap();

    let cutoff = Utc::now() + Duration::seconds(1);
    // Queued jobs are never stale.
    assert!(!repos.jobs.fail_stale(cutoff).await.unwrap().contains(&job_id));

    claim(&repos, job_id).await;
    let reaped = repos
        .jobs
        .fail_stale(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(reaped.contains(&job_id));
    assert!(!repos.jobs.record_progress(job_id, None).await.unwrap());

    let job = repos.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("no progress since"));
    assert!(repos.jobs.active_for_document(doc).await.unwrap().is_none());
}
