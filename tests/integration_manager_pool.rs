//! Manager and pool behavior: ownership exclusivity under concurrency,
//! reload-driven resize, shrink under load, and shutdown quiescence.

mod helpers;

use helpers::{test_settings, Harness};
use repo_migrator::{RepoState, Store};
use std::time::{Duration, Instant};

async fn wait_for_pool_size(harness: &Harness, target: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if harness.manager.active_workers().await == target {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "pool did not reach {target} workers; currently {}",
                harness.manager.active_workers().await
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_no_duplicate_claims_across_workers() {
    let mut settings = test_settings();
    settings.worker_count = 4;
    let harness = Harness::new(settings).await;

    let mut ids = Vec::new();
    for i in 0..16 {
        let repo = harness
            .insert_repo(
                &format!("acme/repo-{i}"),
                &format!("https://github.example.com/acme/repo-{i}"),
            )
            .await;
        ids.push(repo.id);
    }

    harness.manager.start().await.unwrap();
    // RecordingStore panics inside the workers on any duplicate claim, which
    // would surface as repositories that never finish.
    for id in &ids {
        harness
            .wait_for_state(*id, RepoState::Complete, Duration::from_secs(60))
            .await;
    }
    harness.manager.stop().await;

    for id in ids {
        let repo = harness.store.snapshot(id).await.unwrap();
        assert!(repo.assigned_worker.is_none());
        assert_eq!(repo.state, RepoState::Complete);
    }
}

#[tokio::test]
async fn test_reload_resizes_pool_and_rebuilds_forges() {
    let harness = Harness::new(test_settings()).await;
    harness.manager.start().await.unwrap();
    wait_for_pool_size(&harness, 2, Duration::from_secs(5)).await;
    let builds_before = harness.factory.build_count();

    // Grow.
    let mut settings = test_settings();
    settings.worker_count = 5;
    harness.update_settings(settings).await;
    wait_for_pool_size(&harness, 5, Duration::from_secs(5)).await;
    assert!(harness.factory.build_count() > builds_before);

    // Repeated reloads with unchanged settings change nothing.
    assert!(!harness.manager.reload_config().await.unwrap());
    assert!(!harness.manager.reload_config().await.unwrap());
    wait_for_pool_size(&harness, 5, Duration::from_secs(2)).await;

    // Shrink: draining workers leave the active set immediately; idle ones
    // are reaped on the next dispatch pass.
    let mut settings = test_settings();
    settings.worker_count = 1;
    harness.update_settings(settings).await;
    wait_for_pool_size(&harness, 1, Duration::from_secs(5)).await;

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_pool_shrink_under_load_keeps_polling() {
    let mut settings = test_settings();
    settings.worker_count = 8;
    let harness = Harness::new(settings).await;

    // Keep live migrations in flight for several poll cycles.
    harness.mock.set_live_script(vec![
        repo_migrator::MigrationPoll::running(repo_migrator::MigrationPhase::Queued),
        repo_migrator::MigrationPoll::running(repo_migrator::MigrationPhase::Migrating),
        repo_migrator::MigrationPoll::running(repo_migrator::MigrationPhase::Migrating),
        repo_migrator::MigrationPoll::succeeded(),
    ]);

    let mut ids = Vec::new();
    for i in 0..8 {
        let repo = harness
            .insert_repo(
                &format!("acme/load-{i}"),
                &format!("https://github.example.com/acme/load-{i}"),
            )
            .await;
        ids.push(repo.id);
    }

    harness.manager.start().await.unwrap();
    // Wait until every repository has a live migration in flight.
    for id in &ids {
        harness
            .wait_until(*id, Duration::from_secs(60), |r| {
                r.live_migration_id.is_some()
            })
            .await;
    }

    // Shrink the pool while all eight external migrations are running.
    let mut settings = test_settings();
    settings.worker_count = 3;
    harness.update_settings(settings).await;
    wait_for_pool_size(&harness, 3, Duration::from_secs(5)).await;

    // The poll loop keeps advancing everything to completion regardless of
    // pool size; no repository regresses.
    for id in &ids {
        harness
            .wait_for_state(*id, RepoState::Complete, Duration::from_secs(60))
            .await;
    }
    harness.manager.stop().await;
}

#[tokio::test]
async fn test_stop_quiesces_store_writes() {
    let harness = Harness::new(test_settings()).await;

    // Live migrations that stay running: poll-owned rows remain in flight.
    harness.mock.set_live_script(vec![
        repo_migrator::MigrationPoll::running(repo_migrator::MigrationPhase::Migrating),
    ]);
    let mut ids = Vec::new();
    for i in 0..3 {
        let repo = harness
            .insert_repo(
                &format!("acme/stop-{i}"),
                &format!("https://github.example.com/acme/stop-{i}"),
            )
            .await;
        ids.push(repo.id);
    }

    harness.manager.start().await.unwrap();
    for id in &ids {
        harness
            .wait_until(*id, Duration::from_secs(30), |r| {
                r.live_migration_id.is_some()
            })
            .await;
    }

    harness.manager.stop().await;
    let writes_after_stop = harness.store.write_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        harness.store.write_count(),
        writes_after_stop,
        "store writes continued after stop() returned"
    );

    // The in-flight external migrations are intentionally left running; the
    // rows still carry their identifiers for the next process start.
    for id in ids {
        let repo = harness.store.snapshot(id).await.unwrap();
        assert!(repo.live_migration_id.is_some());
        assert!(!repo.state.is_terminal());
    }
}

#[tokio::test]
async fn test_batch_gating_defers_dispatch() {
    let harness = Harness::new(test_settings()).await;
    let batch = harness.store.create_batch("wave-1", None).await.unwrap();
    let repo = harness
        .insert_repo("acme/batched", "https://github.example.com/acme/batched")
        .await;
    harness
        .store
        .assign_to_batch(repo.id, batch.id)
        .await
        .unwrap();

    harness.manager.start().await.unwrap();
    // Draft batches are never dispatched.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        harness.store.snapshot(repo.id).await.unwrap().state,
        RepoState::Pending
    );

    harness
        .store
        .set_batch_state(batch.id, repo_migrator::BatchState::Ready)
        .await
        .unwrap();
    harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;

    // The poll tick rolls the batch up to finished once members terminate.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let batch = harness.store.get_batch(batch.id).await.unwrap();
        if batch.state == repo_migrator::BatchState::Finished {
            break;
        }
        if Instant::now() > deadline {
            panic!("batch never finished; currently {:?}", batch.state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    harness.manager.stop().await;
}
