//! End-to-end pipeline tests: a repository walks the full dry-run + live
//! pipeline against the scripted forge, URL normalization feeds the naming
//! rule, and a restarted process resumes in-flight migrations without
//! double-starting them.

mod helpers;

use helpers::{drain_transitions, test_settings, Harness};
use repo_migrator::migration::state::edge_allowed;
use repo_migrator::{
    AttemptOutcome, CollisionPolicy, MigrationKind, RepoState, Store, TransitionPatch, Visibility,
};
use std::time::Duration;

#[tokio::test]
async fn test_happy_path_dry_run_then_live() {
    let harness = Harness::new(test_settings()).await;
    let mut events = harness.manager.subscribe_events();
    let repo = harness
        .insert_repo("acme/web", "https://github.example.com/acme/web")
        .await;

    harness.manager.start().await.unwrap();
    harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;
    harness.manager.stop().await;

    let edges = drain_transitions(&mut events, repo.id);
    let expected = vec![
        (RepoState::Pending, RepoState::DryRunQueued),
        (RepoState::DryRunQueued, RepoState::DryRunInProgress),
        (RepoState::DryRunInProgress, RepoState::DryRunComplete),
        (RepoState::DryRunComplete, RepoState::PreMigration),
        (RepoState::PreMigration, RepoState::ArchiveGenerating),
        (RepoState::ArchiveGenerating, RepoState::QueuedForMigration),
        (RepoState::QueuedForMigration, RepoState::MigratingContent),
        (RepoState::MigratingContent, RepoState::PostMigration),
        (RepoState::PostMigration, RepoState::MigrationComplete),
        (RepoState::MigrationComplete, RepoState::Complete),
    ];
    assert_eq!(edges, expected);
    // Every observed transition is an edge of the pipeline graph.
    for (from, to) in &edges {
        assert!(edge_allowed(*from, *to), "observed invalid edge {from} -> {to}");
    }

    // Exactly one external migration per kind, both finished successfully.
    let attempts = harness.attempts(repo.id).await;
    let dry: Vec<_> = attempts
        .iter()
        .filter(|a| a.kind == MigrationKind::DryRun)
        .collect();
    let live: Vec<_> = attempts
        .iter()
        .filter(|a| a.kind == MigrationKind::Live)
        .collect();
    assert_eq!(dry.len(), 1);
    assert_eq!(live.len(), 1);
    assert_eq!(dry[0].outcome, AttemptOutcome::Succeeded);
    assert_eq!(live[0].outcome, AttemptOutcome::Succeeded);

    let final_repo = harness.store.snapshot(repo.id).await.unwrap();
    assert_eq!(final_repo.destination_full_name.as_deref(), Some("web"));
    assert_eq!(final_repo.dry_run_attempt_count, 1);
    assert_eq!(final_repo.live_attempt_count, 1);
    assert!(final_repo.assigned_worker.is_none());
    assert!(harness.mock.repo_exists("web"));
    // Post-migration adjusted the destination visibility.
    assert!(harness
        .mock
        .visibility_updates()
        .iter()
        .any(|(name, _)| name == "web"));
}

#[tokio::test]
async fn test_ado_normalization_with_rename_policy() {
    let mut settings = test_settings();
    settings.on_exists = CollisionPolicy::Rename;
    let harness = Harness::new(settings).await;

    // The preferred destination name is already taken.
    harness.mock.add_existing_repo("contoso-myproject-myrepo");
    let repo = harness
        .insert_repo(
            "contoso/MyProject/MyRepo",
            "git@ssh.dev.azure.com:v3/contoso/MyProject/MyRepo.git",
        )
        .await;

    harness.manager.start().await.unwrap();
    let resolved = harness
        .wait_for_state(repo.id, RepoState::DryRunComplete, Duration::from_secs(30))
        .await;
    assert_eq!(
        resolved.destination_full_name.as_deref(),
        Some("contoso-myproject-myrepo-1")
    );

    let done = harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;
    harness.manager.stop().await;

    // The colliding repository still holds the preferred name, so name
    // restoration keeps the suffix.
    assert_eq!(
        done.destination_full_name.as_deref(),
        Some("contoso-myproject-myrepo-1")
    );
    assert!(harness.mock.renames().is_empty());
    assert!(harness.mock.repo_exists("contoso-myproject-myrepo-1"));
}

#[tokio::test]
async fn test_rename_restores_preferred_name_when_freed() {
    let mut settings = test_settings();
    settings.on_exists = CollisionPolicy::Rename;
    let harness = Harness::new(settings).await;

    harness.mock.add_existing_repo("web");
    let repo = harness
        .insert_repo("acme/web", "https://github.example.com/acme/web")
        .await;

    harness.manager.start().await.unwrap();
    harness
        .wait_for_state(repo.id, RepoState::MigratingContent, Duration::from_secs(30))
        .await;
    // The squatting repository disappears before post-migration runs.
    harness.mock.remove_existing_repo("web");

    let done = harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;
    harness.manager.stop().await;

    assert_eq!(done.destination_full_name.as_deref(), Some("web"));
    assert_eq!(
        harness.mock.renames(),
        vec![("web-1".to_string(), "web".to_string())]
    );
}

#[tokio::test]
async fn test_crash_recovery_does_not_double_start() {
    let harness = Harness::new(test_settings()).await;
    let repo = harness
        .insert_repo("acme/web", "https://github.example.com/acme/web")
        .await;

    // Seed the state a crashed process would leave behind: the dry run was
    // started and its id persisted, but nothing has advanced since.
    harness
        .store
        .transition(
            repo.id,
            RepoState::Pending,
            RepoState::DryRunQueued,
            TransitionPatch::new(),
        )
        .await
        .unwrap();
    harness
        .store
        .transition(
            repo.id,
            RepoState::DryRunQueued,
            RepoState::DryRunInProgress,
            TransitionPatch::new()
                .dry_run_migration_id("mig-preexisting")
                .destination("web")
                .increment_attempts(MigrationKind::DryRun),
        )
        .await
        .unwrap();
    harness.mock.script_polls_for(
        "mig-preexisting",
        vec![repo_migrator::MigrationPoll::succeeded()],
    );
    // The destination repo exists from before the crash.
    harness.mock.add_existing_repo("web");

    harness.manager.start().await.unwrap();
    let done = harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;
    harness.manager.stop().await;

    // No second dry run was ever started; exactly one live migration was.
    assert_eq!(harness.mock.started_count(MigrationKind::DryRun), 0);
    assert_eq!(harness.mock.started_count(MigrationKind::Live), 1);
    assert_eq!(done.dry_run_attempt_count, 1);
}

#[tokio::test]
async fn test_source_visibility_maps_to_destination() {
    let mut settings = test_settings();
    settings.visibility_public = Visibility::Internal;
    let harness = Harness::new(settings).await;
    harness
        .mock
        .set_source_visibility("acme/site", Visibility::Public);
    let repo = harness
        .insert_repo("acme/site", "https://github.com/acme/site")
        .await;

    harness.manager.start().await.unwrap();
    harness
        .wait_for_state(repo.id, RepoState::Complete, Duration::from_secs(30))
        .await;
    harness.manager.stop().await;

    let updates = harness.mock.visibility_updates();
    assert!(updates.contains(&("site".to_string(), Visibility::Internal)));
}
